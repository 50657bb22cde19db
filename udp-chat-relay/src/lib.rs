//! Connectionless chat relay over UDP.
//!
//! Clients send one JSON request per datagram; the relay keeps who is
//! registered, which rooms exist and who is in them, and fans chat lines out
//! to room members. Files travel as hex-encoded, sequence-numbered chunks that
//! the relay reassembles before forwarding to the recipient.
//!
//! - [`transport`] owns the UDP socket and the [`transport::DatagramSink`] send seam.
//! - [`message`] decodes requests and encodes replies, chat lines and notices.
//! - [`session`], [`room`] and [`transfer`] hold the relay's state.
//! - [`router`] dispatches each request against that state and is the only
//!   place that sends.
//! - [`relay`] runs the receive loop until shutdown.
//! - [`cli`] and [`config`] cover the server binary's flags and limits.
//!
//! There is no eviction: sessions, memberships and unfinished transfers live
//! until restart, bounded only by [`config::RelayConfig`].

pub mod cli;
pub mod config;
pub mod error;
pub mod message;
pub mod relay;
pub mod room;
pub mod router;
pub mod session;
pub mod transfer;
pub mod transport;

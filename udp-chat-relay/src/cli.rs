use std::net::SocketAddr;

use clap::Parser;

use crate::config::RelayConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:2055")]
    pub listen: SocketAddr,

    /// Largest datagram the relay will receive or send, in bytes.
    #[arg(long, default_value_t = 4096)]
    pub max_datagram: usize,

    /// Maximum number of registered clients.
    #[arg(long, default_value_t = 4096)]
    pub max_sessions: usize,

    /// Maximum number of rooms.
    #[arg(long, default_value_t = 1024)]
    pub max_rooms: usize,

    /// Maximum number of file transfers awaiting approval or chunks.
    #[arg(long, default_value_t = 256)]
    pub max_pending_transfers: usize,

    /// Maximum size of a single relayed file, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_transfer_bytes: u64,

    /// Raw bytes per chunk when forwarding a finished file to its recipient.
    #[arg(long, default_value_t = 1024)]
    pub delivery_chunk_size: usize,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_datagram: self.max_datagram,
            max_sessions: self.max_sessions,
            max_rooms: self.max_rooms,
            max_pending_transfers: self.max_pending_transfers,
            max_transfer_bytes: self.max_transfer_bytes,
            delivery_chunk_size: self.delivery_chunk_size,
        }
    }
}

//! Relay limits.
//!
//! Nothing in the relay is ever evicted, so these caps are the only bound on
//! memory under churn or misbehaving clients.

/// Tunables shared by the registries and the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Receive buffer size and ceiling for every encoded outbound datagram.
    pub max_datagram: usize,
    pub max_sessions: usize,
    pub max_rooms: usize,
    pub max_pending_transfers: usize,
    /// Upper bound on bytes buffered for a single transfer.
    pub max_transfer_bytes: u64,
    /// Upper bound on raw bytes per `file-chunk` notice when delivering a
    /// finished transfer. The router lowers it per transfer so every hex
    /// encoded notice fits in `max_datagram`.
    pub delivery_chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_datagram: 4096,
            max_sessions: 4096,
            max_rooms: 1024,
            max_pending_transfers: 256,
            max_transfer_bytes: 16 * 1024 * 1024,
            delivery_chunk_size: 1024,
        }
    }
}

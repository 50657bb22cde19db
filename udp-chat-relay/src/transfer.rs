//! Chunked file transfers relayed through the server.
//!
//! Each transfer is keyed by `(sender, recipient, filename)` and walks
//! `Requested -> Approved -> InProgress -> Complete`. Waiting for approval is
//! just a state in the table; nothing blocks.
//!
//! Chunks carry a sender-assigned `seq` in `0..total` and land in a sparse
//! buffer, so reordered or duplicated datagrams reassemble to the same bytes.
//! Lost chunks are reported back by index when the sender signals completion.

use std::collections::{BTreeMap, HashMap};

use crate::error::RelayError;

/// Most gap indices reported back in one `missing` list. Keeps the reply
/// well inside the smallest datagram ceiling; the sender resends those and
/// asks again.
pub const MAX_REPORTED_MISSING: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub sender: String,
    pub recipient: String,
    pub filename: String,
}

impl TransferKey {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            filename: filename.into(),
        }
    }

    fn not_found(&self) -> RelayError {
        RelayError::TransferNotFound {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            filename: self.filename.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Approved,
    InProgress,
    Complete,
}

impl TransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::Approved => "approved",
            TransferState::InProgress => "in progress",
            TransferState::Complete => "complete",
        }
    }
}

/// Which side opened the transfer; decides who may approve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// `send-file`: the recipient approves.
    Sender,
    /// `request-file`: the holder of the file (the sender) approves.
    Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferEvent {
    Approve,
    Chunk,
    Finish,
}

impl TransferEvent {
    fn as_str(self) -> &'static str {
        match self {
            TransferEvent::Approve => "approve",
            TransferEvent::Chunk => "accept a chunk",
            TransferEvent::Finish => "complete",
        }
    }
}

fn next_state(from: TransferState, event: TransferEvent) -> Option<TransferState> {
    use TransferEvent::*;
    use TransferState::*;

    match (from, event) {
        (Requested | Approved, Approve) => Some(Approved),
        (Approved | InProgress, Chunk) => Some(InProgress),
        // Finishing straight from Approved covers zero-length files.
        (Approved | InProgress, Finish) => Some(Complete),
        _ => None,
    }
}

#[derive(Debug)]
pub struct PendingTransfer {
    key: TransferKey,
    initiator: Initiator,
    state: TransferState,
    declared_size: Option<u64>,
    total_chunks: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
}

impl PendingTransfer {
    fn new(key: TransferKey, initiator: Initiator, declared_size: Option<u64>) -> Self {
        Self {
            key,
            initiator,
            state: TransferState::Requested,
            declared_size,
            total_chunks: None,
            chunks: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn apply(&mut self, event: TransferEvent) -> Result<(), RelayError> {
        match next_state(self.state, event) {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => Err(RelayError::InvalidTransition {
                from: self.state.as_str(),
                event: event.as_str(),
            }),
        }
    }

    /// The first gaps by index, and how many there are in all.
    fn missing_chunks(&self) -> (Vec<u32>, u64) {
        match self.total_chunks {
            Some(total) => {
                let count = u64::from(total) - self.chunks.len() as u64;
                let first = (0..total)
                    .filter(|seq| !self.chunks.contains_key(seq))
                    .take(MAX_REPORTED_MISSING)
                    .collect();
                (first, count)
            }
            None if self.declared_size == Some(0) => (Vec::new(), 0),
            None => (vec![0], 1),
        }
    }

    fn all_chunks_present(&self) -> bool {
        self.total_chunks
            .is_some_and(|total| self.chunks.len() == total as usize)
            && self
                .declared_size
                .is_none_or(|declared| declared == self.received_bytes)
    }

    fn assemble(self) -> CompletedTransfer {
        let mut data = Vec::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        CompletedTransfer {
            key: self.key,
            data,
        }
    }
}

/// A reassembled payload ready for delivery to the recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub key: TransferKey,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored { received: usize, total: u32 },
    /// The index was already buffered; the first copy is kept.
    Duplicate,
    Completed(CompletedTransfer),
}

#[derive(Debug)]
pub struct TransferCoordinator {
    pending: HashMap<TransferKey, PendingTransfer>,
    capacity: usize,
    max_bytes: u64,
}

impl TransferCoordinator {
    pub fn new(capacity: usize, max_bytes: u64) -> Self {
        Self {
            pending: HashMap::new(),
            capacity,
            max_bytes,
        }
    }

    /// Sender-initiated transfer (`send-file`).
    pub fn offer(&mut self, key: TransferKey, declared_size: u64) -> Result<(), RelayError> {
        self.check_size(declared_size)?;
        self.open(key, Initiator::Sender, Some(declared_size))
    }

    /// Recipient-initiated transfer (`request-file`). The size is unknown
    /// until the holder approves.
    pub fn request(&mut self, key: TransferKey) -> Result<(), RelayError> {
        self.open(key, Initiator::Recipient, None)
    }

    fn open(
        &mut self,
        key: TransferKey,
        initiator: Initiator,
        declared_size: Option<u64>,
    ) -> Result<(), RelayError> {
        if let Some(existing) = self.pending.get_mut(&key) {
            // A repeated offer or request while still unanswered is a retransmit.
            if existing.state == TransferState::Requested && existing.initiator == initiator {
                existing.declared_size = declared_size;
                return Ok(());
            }
            return Err(RelayError::TransferExists {
                filename: key.filename,
            });
        }

        if self.pending.len() >= self.capacity {
            return Err(RelayError::ResourceExhausted {
                resource: "pending transfer",
                limit: self.capacity,
            });
        }

        let transfer = PendingTransfer::new(key.clone(), initiator, declared_size);
        self.pending.insert(key, transfer);
        Ok(())
    }

    /// Approval by the party that received the original offer or request.
    ///
    /// `counterpart` is whoever sent that offer or request. Returns the key of
    /// the approved transfer so the caller can notify the waiting side.
    pub fn approve(
        &mut self,
        approver: &str,
        counterpart: &str,
        filename: &str,
        declared_size: Option<u64>,
    ) -> Result<TransferKey, RelayError> {
        let offered = TransferKey::new(counterpart, approver, filename);
        let requested = TransferKey::new(approver, counterpart, filename);

        let key = if self
            .pending
            .get(&offered)
            .is_some_and(|transfer| transfer.initiator == Initiator::Sender)
        {
            offered
        } else if self
            .pending
            .get(&requested)
            .is_some_and(|transfer| transfer.initiator == Initiator::Recipient)
        {
            requested
        } else {
            return Err(offered.not_found());
        };

        if let Some(size) = declared_size {
            self.check_size(size)?;
        }

        let transfer = self.pending.get_mut(&key).ok_or_else(|| key.not_found())?;
        transfer.apply(TransferEvent::Approve)?;
        if transfer.declared_size.is_none() {
            transfer.declared_size = declared_size;
        }
        Ok(key)
    }

    /// Buffers one chunk. When the last missing chunk arrives and the byte
    /// count matches the declared size, the transfer completes on its own.
    pub fn accept_chunk(
        &mut self,
        key: &TransferKey,
        seq: u32,
        total: u32,
        bytes: Vec<u8>,
    ) -> Result<ChunkOutcome, RelayError> {
        let max_bytes = self.max_bytes;
        let transfer = self.pending.get_mut(key).ok_or_else(|| key.not_found())?;

        if next_state(transfer.state, TransferEvent::Chunk).is_none() {
            return Err(RelayError::InvalidTransition {
                from: transfer.state.as_str(),
                event: TransferEvent::Chunk.as_str(),
            });
        }
        if seq >= total {
            return Err(RelayError::ChunkOutOfRange { seq, total });
        }
        // Every chunk but an empty file's single one carries at least a byte.
        let limit = transfer.declared_size.unwrap_or(max_bytes).min(max_bytes);
        if u64::from(total) > limit.max(1) {
            return Err(RelayError::TooManyChunks { total, limit });
        }
        if let Some(expected) = transfer.total_chunks
            && expected != total
        {
            return Err(RelayError::ChunkCountMismatch {
                expected,
                got: total,
            });
        }
        if transfer.chunks.contains_key(&seq) {
            return Ok(ChunkOutcome::Duplicate);
        }

        let len = transfer.received_bytes + bytes.len() as u64;
        if len > limit {
            return Err(RelayError::SizeExceeded { len, limit });
        }

        transfer.apply(TransferEvent::Chunk)?;
        transfer.total_chunks = Some(total);
        transfer.received_bytes = len;
        transfer.chunks.insert(seq, bytes);
        let received = transfer.chunks.len();

        if transfer.all_chunks_present() {
            return self.complete(key).map(ChunkOutcome::Completed);
        }

        Ok(ChunkOutcome::Stored { received, total })
    }

    /// Explicit end-of-transfer marker from the sender.
    ///
    /// Gaps are reported as [`RelayError::Incomplete`] and the transfer stays
    /// open for resends. A byte count that disagrees with the declared size
    /// can never be repaired, so that transfer is discarded.
    pub fn finish(&mut self, key: &TransferKey) -> Result<CompletedTransfer, RelayError> {
        let transfer = self.pending.get(key).ok_or_else(|| key.not_found())?;

        if next_state(transfer.state, TransferEvent::Finish).is_none() {
            return Err(RelayError::InvalidTransition {
                from: transfer.state.as_str(),
                event: TransferEvent::Finish.as_str(),
            });
        }

        let (missing, count) = transfer.missing_chunks();
        if count > 0 {
            return Err(RelayError::Incomplete { missing, count });
        }

        if let Some(declared) = transfer.declared_size
            && declared != transfer.received_bytes
        {
            let received = transfer.received_bytes;
            self.pending.remove(key);
            return Err(RelayError::SizeMismatch { declared, received });
        }

        self.complete(key)
    }

    fn complete(&mut self, key: &TransferKey) -> Result<CompletedTransfer, RelayError> {
        let mut transfer = self.pending.remove(key).ok_or_else(|| key.not_found())?;
        transfer.apply(TransferEvent::Finish)?;
        Ok(transfer.assemble())
    }

    /// Drops a transfer in any state.
    pub fn cancel(&mut self, key: &TransferKey) -> Result<PendingTransfer, RelayError> {
        self.pending.remove(key).ok_or_else(|| key.not_found())
    }

    pub fn get(&self, key: &TransferKey) -> Option<&PendingTransfer> {
        self.pending.get(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn check_size(&self, size: u64) -> Result<(), RelayError> {
        if size > self.max_bytes {
            return Err(RelayError::SizeExceeded {
                len: size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

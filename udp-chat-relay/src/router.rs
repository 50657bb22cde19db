//! Request dispatch.
//!
//! [`Router::route`] turns one datagram into the list of [`Envelope`]s it
//! causes, touching the registries under their locks. [`Router::deliver`]
//! then pushes those envelopes through the [`DatagramSink`]. Only the router
//! sends, and sends happen after every registry lock has been released.
//!
//! Locks are always taken in the order sessions, rooms, transfers.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::RelayError,
    message::{Notice, Outbound, Request, Response, decode_request, encode},
    room::{Fanout, RoomRegistry},
    session::{Registration, SessionRegistry},
    transfer::{ChunkOutcome, CompletedTransfer, TransferCoordinator, TransferKey},
    transport::DatagramSink,
};

/// One outbound datagram before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: SocketAddr,
    pub message: Outbound,
}

impl Envelope {
    pub fn new(to: SocketAddr, message: impl Into<Outbound>) -> Self {
        Self {
            to,
            message: message.into(),
        }
    }
}

/// Result of pushing a batch of envelopes through the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

/// Sizes of the registries. Nothing is ever evicted, so these only grow
/// (memberships aside) until the relay restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sessions: usize,
    pub rooms: usize,
    pub memberships: usize,
    pub pending_transfers: usize,
}

pub struct Router<S> {
    sink: Arc<S>,
    config: RelayConfig,
    sessions: Mutex<SessionRegistry>,
    rooms: Mutex<RoomRegistry>,
    transfers: Mutex<TransferCoordinator>,
}

impl<S: DatagramSink> Router<S> {
    pub fn new(sink: Arc<S>, config: RelayConfig) -> Self {
        Self {
            sink,
            sessions: Mutex::new(SessionRegistry::new(config.max_sessions)),
            rooms: Mutex::new(RoomRegistry::new(config.max_rooms)),
            transfers: Mutex::new(TransferCoordinator::new(
                config.max_pending_transfers,
                config.max_transfer_bytes,
            )),
            config,
        }
    }

    /// Handles one inbound datagram end to end.
    pub async fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Delivery {
        let envelopes = self.route(datagram, from);
        self.deliver(envelopes).await
    }

    /// Decodes and applies a datagram, returning everything it must send.
    ///
    /// Never fails: any error becomes a `{success: false}` reply to `from`.
    pub fn route(&self, datagram: &[u8], from: SocketAddr) -> Vec<Envelope> {
        let request = match decode_request(datagram) {
            Ok(request) => request,
            Err(err) => {
                warn!(peer = %from, error = %err, "rejecting malformed datagram");
                return vec![Envelope::new(from, Response::from(&RelayError::from(err)))];
            }
        };

        let kind = request.kind();
        debug!(peer = %from, request = kind, "dispatching request");

        match self.handle(request, from) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                debug!(peer = %from, request = kind, error = %err, "request failed");
                vec![Envelope::new(from, Response::from(&err))]
            }
        }
    }

    /// Encodes and sends each envelope independently. A failed send is
    /// logged and counted; it never stops the rest of the batch.
    pub async fn deliver(&self, envelopes: Vec<Envelope>) -> Delivery {
        let mut delivery = Delivery::default();

        for Envelope { to, message } in envelopes {
            let Some(bytes) = self.encode_for_wire(&message, to) else {
                delivery.failed += 1;
                continue;
            };

            match self.sink.send_datagram(&bytes, to).await {
                Ok(()) => delivery.sent += 1,
                Err(err) => {
                    warn!(peer = %to, error = ?err, "failed to deliver datagram");
                    delivery.failed += 1;
                }
            }
        }

        delivery
    }

    fn encode_for_wire(&self, message: &Outbound, to: SocketAddr) -> Option<Vec<u8>> {
        let limit = self.config.max_datagram;
        match encode(message, limit) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(peer = %to, error = %err, "dropping unencodable message");
                // A direct reply is still owed, so shrink it to a bare failure.
                if let Outbound::Response(_) = message {
                    encode(&Outbound::from(Response::from(&err)), limit).ok()
                } else {
                    None
                }
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        let sessions = self.sessions.lock();
        let rooms = self.rooms.lock();
        let transfers = self.transfers.lock();

        RelayStats {
            sessions: sessions.len(),
            rooms: rooms.len(),
            memberships: rooms.membership_count(),
            pending_transfers: transfers.len(),
        }
    }

    /// Member ids of a room in join order.
    pub fn room_members(&self, room_id: &str) -> Result<Vec<String>, RelayError> {
        let rooms = self.rooms.lock();
        Ok(rooms.room(room_id)?.members().to_vec())
    }

    fn handle(&self, request: Request, from: SocketAddr) -> Result<Vec<Envelope>, RelayError> {
        match request {
            Request::CreateRoom {
                sender_id,
                sender_name,
                room_name,
            } => self.create_room(&sender_id, &sender_name, room_name.as_deref(), from),
            Request::Subscribe { id, name, room_id } => self.subscribe(&id, &name, &room_id, from),
            Request::Unsubscribe { id, room_id } => self.unsubscribe(&id, &room_id, from),
            Request::SendMessage {
                sender_name,
                room_id,
                message,
            } => self.send_message(&sender_name, &room_id, &message),
            Request::ListRooms => {
                let rooms = self.rooms.lock().list();
                Ok(vec![Envelope::new(from, Response::ok().with_rooms(rooms))])
            }
            Request::RoomExists { room_id } => {
                let exists = self.rooms.lock().exists(&room_id);
                Ok(vec![Envelope::new(from, Response::ok().with_exists(exists))])
            }
            Request::Register { id, name } => {
                if self.sessions.lock().register(&id, &name, from)? == Registration::Created {
                    info!(peer = %from, id = %id, name = %name, "client registered");
                }
                Ok(vec![Envelope::new(from, Response::ok())])
            }
            Request::ListUsers => {
                let users = self.sessions.lock().list();
                Ok(vec![Envelope::new(from, Response::ok().with_users(users))])
            }
            Request::SendFile {
                sender_id,
                target_id,
                filename,
                file_size,
            } => self.send_file(&sender_id, &target_id, &filename, file_size, from),
            Request::RequestFile {
                sender_id,
                target_id,
                filename,
            } => self.request_file(&sender_id, &target_id, &filename, from),
            Request::ApproveFileRequest {
                id,
                sender_id,
                filename,
                file_size,
            } => self.approve_file(id, &sender_id, &filename, file_size, from),
            Request::FileChunk {
                sender_id,
                target_id,
                filename,
                seq,
                total,
                chunk,
            } => self.file_chunk(sender_id, &target_id, &filename, seq, total, &chunk, from),
            Request::FileTransferComplete {
                sender_id,
                target_id,
                filename,
            } => self.finish_file(sender_id, &target_id, &filename, from),
            Request::CancelFile {
                id,
                sender_id,
                target_id,
                filename,
            } => self.cancel_file(id, &sender_id, &target_id, &filename, from),
        }
    }

    fn create_room(
        &self,
        sender_id: &str,
        sender_name: &str,
        room_name: Option<&str>,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let mut sessions = self.sessions.lock();
        let mut rooms = self.rooms.lock();

        // Nothing is registered for a room that cannot be created.
        rooms.ensure_capacity()?;
        sessions.register(sender_id, sender_name, from)?;
        let creator = sessions.lookup(sender_id)?.clone();
        let room_id = rooms.create_room(room_name)?;
        info!(room_id = %room_id, creator = sender_id, "room created");

        let mut envelopes = vec![Envelope::new(from, Response::ok().with_room_id(&room_id))];
        if let Some(notice) = rooms.join(&room_id, &creator, &sessions)? {
            envelopes.extend(fanout_envelopes(notice));
        }
        Ok(envelopes)
    }

    fn subscribe(
        &self,
        id: &str,
        name: &str,
        room_id: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let mut sessions = self.sessions.lock();
        let mut rooms = self.rooms.lock();

        // Check first so a bad room id does not leave a session behind.
        rooms.room(room_id)?;
        sessions.register(id, name, from)?;
        let client = sessions.lookup(id)?.clone();

        let mut envelopes = vec![Envelope::new(from, Response::ok())];
        if let Some(notice) = rooms.join(room_id, &client, &sessions)? {
            info!(room_id, id, "client joined room");
            envelopes.extend(fanout_envelopes(notice));
        }
        Ok(envelopes)
    }

    fn unsubscribe(
        &self,
        id: &str,
        room_id: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut rooms = self.rooms.lock();

        let mut envelopes = vec![Envelope::new(from, Response::ok())];
        if let Some(notice) = rooms.leave(room_id, id, &sessions)? {
            info!(room_id, id, "client left room");
            envelopes.extend(fanout_envelopes(notice));
        }
        Ok(envelopes)
    }

    fn send_message(
        &self,
        sender_name: &str,
        room_id: &str,
        message: &str,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let rooms = self.rooms.lock();
        let fanout = rooms.broadcast(room_id, sender_name, message, &sessions)?;
        Ok(fanout_envelopes(fanout))
    }

    fn send_file(
        &self,
        sender_id: &str,
        target_id: &str,
        filename: &str,
        file_size: u64,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        sessions.lookup(sender_id)?;
        let target = sessions.lookup(target_id)?;
        self.delivery_chunk_size(sender_id, filename)?;
        transfers.offer(TransferKey::new(sender_id, target_id, filename), file_size)?;
        info!(sender = sender_id, recipient = target_id, filename, file_size, "file offered");

        Ok(vec![
            Envelope::new(from, Response::ok()),
            Envelope::new(
                target.address,
                Notice::FileOffered {
                    sender_id: sender_id.to_string(),
                    filename: filename.to_string(),
                    file_size,
                },
            ),
        ])
    }

    fn request_file(
        &self,
        requester_id: &str,
        holder_id: &str,
        filename: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        sessions.lookup(requester_id)?;
        let holder = sessions.lookup(holder_id)?;
        self.delivery_chunk_size(holder_id, filename)?;
        transfers.request(TransferKey::new(holder_id, requester_id, filename))?;
        info!(requester = requester_id, holder = holder_id, filename, "file requested");

        Ok(vec![
            Envelope::new(from, Response::ok()),
            Envelope::new(
                holder.address,
                Notice::FileWanted {
                    requester_id: requester_id.to_string(),
                    filename: filename.to_string(),
                },
            ),
        ])
    }

    fn approve_file(
        &self,
        approver_id: Option<String>,
        counterpart_id: &str,
        filename: &str,
        file_size: Option<u64>,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        let approver_id = resolve_caller(approver_id, from, &sessions)?;
        let counterpart = sessions.lookup(counterpart_id)?;
        let key = transfers.approve(&approver_id, counterpart_id, filename, file_size)?;
        info!(
            sender = %key.sender,
            recipient = %key.recipient,
            filename,
            "file transfer approved"
        );

        Ok(vec![
            Envelope::new(from, Response::ok()),
            Envelope::new(
                counterpart.address,
                Notice::FileRequestApproved {
                    approver_id,
                    filename: filename.to_string(),
                },
            ),
        ])
    }

    #[allow(clippy::too_many_arguments)]
    fn file_chunk(
        &self,
        sender_id: Option<String>,
        target_id: &str,
        filename: &str,
        seq: u32,
        total: u32,
        chunk: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let bytes = hex::decode(chunk).map_err(|_| RelayError::InvalidChunk)?;

        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        let sender_id = resolve_caller(sender_id, from, &sessions)?;
        let key = TransferKey::new(sender_id, target_id, filename);

        match transfers.accept_chunk(&key, seq, total, bytes)? {
            ChunkOutcome::Stored { received, total } => {
                debug!(filename, seq, received, total, "chunk stored");
                Ok(Vec::new())
            }
            ChunkOutcome::Duplicate => {
                debug!(filename, seq, "duplicate chunk ignored");
                Ok(Vec::new())
            }
            ChunkOutcome::Completed(done) => {
                let recipient = sessions.lookup(&done.key.recipient)?.address;
                let mut envelopes = vec![Envelope::new(from, Response::ok())];
                envelopes.extend(self.completion_envelopes(done, recipient)?);
                Ok(envelopes)
            }
        }
    }

    fn finish_file(
        &self,
        sender_id: Option<String>,
        target_id: &str,
        filename: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        let sender_id = resolve_caller(sender_id, from, &sessions)?;
        let key = TransferKey::new(sender_id, target_id, filename);
        let recipient = sessions.lookup(target_id)?.address;
        let done = transfers.finish(&key)?;

        let mut envelopes = vec![Envelope::new(from, Response::ok())];
        envelopes.extend(self.completion_envelopes(done, recipient)?);
        Ok(envelopes)
    }

    fn cancel_file(
        &self,
        canceller_id: Option<String>,
        sender_id: &str,
        target_id: &str,
        filename: &str,
        from: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let sessions = self.sessions.lock();
        let mut transfers = self.transfers.lock();

        let canceller_id = resolve_caller(canceller_id, from, &sessions)?;
        let other_id = if canceller_id == sender_id {
            target_id
        } else if canceller_id == target_id {
            sender_id
        } else {
            // Only the two parties of a transfer may cancel it.
            return Err(RelayError::TransferNotFound {
                sender: sender_id.to_string(),
                recipient: target_id.to_string(),
                filename: filename.to_string(),
            });
        };

        transfers.cancel(&TransferKey::new(sender_id, target_id, filename))?;
        info!(by = %canceller_id, filename, "file transfer cancelled");

        let mut envelopes = vec![Envelope::new(from, Response::ok())];
        if let Ok(other) = sessions.lookup(other_id) {
            envelopes.push(Envelope::new(
                other.address,
                Notice::FileTransferCancelled {
                    cancelled_by: canceller_id,
                    filename: filename.to_string(),
                },
            ));
        }
        Ok(envelopes)
    }

    /// Raw bytes per delivered `file-chunk` so that each encoded notice for
    /// this sender and filename fits in `max_datagram`. Hex doubles the
    /// payload on the wire.
    fn delivery_chunk_size(&self, sender_id: &str, filename: &str) -> Result<usize, RelayError> {
        let limit = self.config.max_datagram;
        let empty = Outbound::from(Notice::FileChunk {
            sender_id: sender_id.to_string(),
            filename: filename.to_string(),
            seq: u32::MAX,
            total: u32::MAX,
            chunk: String::new(),
        });
        let overhead = encode(&empty, usize::MAX)?.len();

        let size = self
            .config
            .delivery_chunk_size
            .min(limit.saturating_sub(overhead) / 2);
        if size == 0 {
            return Err(RelayError::Oversized {
                len: overhead + 2,
                limit,
            });
        }
        Ok(size)
    }

    /// Re-chunks a finished payload for the recipient, then marks it complete.
    fn completion_envelopes(
        &self,
        done: CompletedTransfer,
        recipient: SocketAddr,
    ) -> Result<Vec<Envelope>, RelayError> {
        let CompletedTransfer { key, data } = done;
        info!(
            sender = %key.sender,
            recipient = %key.recipient,
            filename = %key.filename,
            bytes = data.len(),
            "file transfer complete"
        );

        let chunk_size = self.delivery_chunk_size(&key.sender, &key.filename)?;
        let total = data.chunks(chunk_size).count() as u32;

        let mut envelopes: Vec<Envelope> = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(seq, chunk)| {
                Envelope::new(
                    recipient,
                    Notice::FileChunk {
                        sender_id: key.sender.clone(),
                        filename: key.filename.clone(),
                        seq: seq as u32,
                        total,
                        chunk: hex::encode(chunk),
                    },
                )
            })
            .collect();

        envelopes.push(Envelope::new(
            recipient,
            Notice::FileTransferComplete {
                sender_id: key.sender,
                filename: key.filename,
                file_size: data.len() as u64,
            },
        ));
        Ok(envelopes)
    }
}

/// Uses the explicit id when given, otherwise the session registered at `from`.
fn resolve_caller(
    explicit: Option<String>,
    from: SocketAddr,
    sessions: &SessionRegistry,
) -> Result<String, RelayError> {
    match explicit {
        Some(id) => Ok(id),
        None => sessions
            .find_by_address(from)
            .map(|client| client.id.clone())
            .ok_or_else(|| RelayError::UserNotFound(from.to_string())),
    }
}

fn fanout_envelopes(fanout: Fanout) -> Vec<Envelope> {
    let Fanout {
        recipients, line, ..
    } = fanout;
    recipients
        .into_iter()
        .map(|to| Envelope::new(to, line.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::message::{ChatLine, RoomSummary, UserSummary, decode};

    /// Records every datagram and fails sends to one chosen address.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        unreachable: Option<SocketAddr>,
    }

    impl RecordingSink {
        fn failing_for(addr: SocketAddr) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                unreachable: Some(addr),
            }
        }

        fn received_by(&self, addr: SocketAddr) -> Vec<Outbound> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| *to == addr)
                .map(|(_, bytes)| decode(bytes).expect("relay output decodes"))
                .collect()
        }
    }

    impl DatagramSink for RecordingSink {
        async fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
            if self.unreachable == Some(to) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
            }
            self.sent.lock().push((to, bytes.to_vec()));
            Ok(())
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn router() -> Router<RecordingSink> {
        Router::new(Arc::new(RecordingSink::default()), RelayConfig::default())
    }

    fn reply(envelopes: &[Envelope]) -> Response {
        match envelopes.first().map(|envelope| &envelope.message) {
            Some(Outbound::Response(response)) => response.clone(),
            other => panic!("expected a direct reply first, got {other:?}"),
        }
    }

    fn create_room(router: &Router<RecordingSink>, id: &str, name: &str, from: SocketAddr) -> String {
        let request = format!(
            r#"{{"request":"create-room","senderId":"{id}","senderName":"{name}","roomName":"general"}}"#
        );
        let response = reply(&router.route(request.as_bytes(), from));
        assert!(response.success, "create-room failed: {response:?}");
        response.room_id.expect("room id in reply")
    }

    fn subscribe(router: &Router<RecordingSink>, id: &str, name: &str, room_id: &str, from: SocketAddr) {
        let request =
            format!(r#"{{"request":"subscribe","id":"{id}","name":"{name}","roomId":"{room_id}"}}"#);
        let response = reply(&router.route(request.as_bytes(), from));
        assert!(response.success, "subscribe failed: {response:?}");
    }

    #[test]
    fn malformed_datagram_does_not_disturb_next_request() {
        let router = router();

        let failure = reply(&router.route(br#"{"roomId":"abc"}"#, addr(1000)));
        assert!(!failure.success);
        assert_eq!(failure.reason.as_deref(), Some("missing `request` field"));

        let listed = reply(&router.route(br#"{"request":"list-rooms"}"#, addr(1000)));
        assert!(listed.success);
        assert_eq!(listed.rooms, Some(Vec::new()));
    }

    #[test]
    fn unknown_and_incomplete_requests_get_structured_failures() {
        let router = router();

        let unknown = reply(&router.route(br#"{"request":"shout"}"#, addr(1000)));
        assert!(!unknown.success);
        assert!(unknown.reason.unwrap().contains("shout"));

        let incomplete = reply(&router.route(br#"{"request":"subscribe","id":"u1"}"#, addr(1000)));
        assert!(!incomplete.success);

        let garbage = reply(&router.route(b"\x00\x01garbage", addr(1000)));
        assert!(!garbage.success);
    }

    #[test]
    fn create_room_replies_then_announces_creator() {
        let router = router();
        let envelopes = router.route(
            br#"{"request":"create-room","user_id":"u1","user_name":"alice","room_name":"general"}"#,
            addr(1000),
        );

        assert_eq!(envelopes.len(), 2);
        let room_id = reply(&envelopes).room_id.expect("room id");
        assert_eq!(
            envelopes[1],
            Envelope::new(addr(1000), ChatLine::system("alice joined the room."))
        );
        assert_eq!(router.room_members(&room_id).unwrap(), ["u1"]);
    }

    #[test]
    fn room_exists_flips_after_creation() {
        let router = router();
        let missing = reply(&router.route(br#"{"request":"room-exists","roomId":"zzzzzz"}"#, addr(1)));
        assert_eq!(missing.exists, Some(false));

        let room_id = create_room(&router, "u1", "alice", addr(1000));
        let request = format!(r#"{{"request":"room-exists","roomId":"{room_id}"}}"#);
        let found = reply(&router.route(request.as_bytes(), addr(1)));
        assert_eq!(found.exists, Some(true));
    }

    #[test]
    fn subscribe_registers_unknown_clients_and_rejects_unknown_rooms() {
        let router = router();
        let room_id = create_room(&router, "u1", "alice", addr(1000));

        let failure = reply(&router.route(
            br#"{"request":"subscribe","id":"u2","name":"bob","roomId":"nope"}"#,
            addr(2000),
        ));
        assert!(!failure.success);
        assert_eq!(router.stats().sessions, 1);

        subscribe(&router, "u2", "bob", &room_id, addr(2000));
        let users = reply(&router.route(br#"{"request":"list-users"}"#, addr(2000)));
        assert_eq!(
            users.users,
            Some(vec![
                UserSummary {
                    id: "u1".into(),
                    name: "alice".into()
                },
                UserSummary {
                    id: "u2".into(),
                    name: "bob".into()
                },
            ])
        );
        assert_eq!(router.room_members(&room_id).unwrap(), ["u1", "u2"]);
    }

    #[test]
    fn unsubscribe_keeps_other_members() {
        let router = router();
        let room_id = create_room(&router, "u1", "alice", addr(1000));
        subscribe(&router, "u2", "bob", &room_id, addr(2000));

        let request = format!(r#"{{"request":"unsubscribe","id":"u1","roomId":"{room_id}"}}"#);
        let envelopes = router.route(request.as_bytes(), addr(1000));

        assert!(reply(&envelopes).success);
        assert_eq!(
            envelopes[1..],
            [Envelope::new(addr(2000), ChatLine::system("alice left the room."))]
        );
        assert_eq!(router.room_members(&room_id).unwrap(), ["u2"]);
    }

    #[test]
    fn list_rooms_reports_names() {
        let router = router();
        let room_id = create_room(&router, "u1", "alice", addr(1000));
        let listed = reply(&router.route(br#"{"request":"list-rooms"}"#, addr(1000)));
        assert_eq!(
            listed.rooms,
            Some(vec![RoomSummary {
                id: room_id,
                name: "general".into()
            }])
        );
    }

    #[test]
    fn send_message_to_missing_room_fails() {
        let router = router();
        let failure = reply(&router.route(
            br#"{"request":"send-message","senderName":"alice","roomId":"nope","message":"hi"}"#,
            addr(1000),
        ));
        assert!(!failure.success);
        assert_eq!(failure.reason.as_deref(), Some("room 'nope' not found"));
    }

    #[tokio::test]
    async fn broadcast_survives_one_unreachable_member() {
        let sink = Arc::new(RecordingSink::failing_for(addr(2000)));
        let router = Router::new(Arc::clone(&sink), RelayConfig::default());

        let room_id = create_room(&router, "u1", "alice", addr(1000));
        subscribe(&router, "u2", "bob", &room_id, addr(2000));
        subscribe(&router, "u3", "carol", &room_id, addr(3000));

        let request = format!(
            r#"{{"request":"send-message","senderName":"alice","roomId":"{room_id}","message":"hi"}}"#
        );
        let delivery = router.dispatch(request.as_bytes(), addr(1000)).await;

        assert_eq!(delivery, Delivery { sent: 2, failed: 1 });
        let expected = Outbound::Chat(ChatLine {
            user: "alice".into(),
            message: "hi".into(),
        });
        assert_eq!(sink.received_by(addr(1000)), vec![expected.clone()]);
        assert_eq!(sink.received_by(addr(3000)), vec![expected]);
    }

    #[tokio::test]
    async fn oversized_reply_is_replaced_by_failure() {
        let config = RelayConfig {
            max_datagram: 256,
            ..RelayConfig::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let router = Router::new(Arc::clone(&sink), config);

        for i in 0..20 {
            let request = format!(r#"{{"request":"register","id":"user-{i}","name":"name-{i}"}}"#);
            router.route(request.as_bytes(), addr(1000 + i));
        }
        let delivery = router.dispatch(br#"{"request":"list-users"}"#, addr(5000)).await;

        assert_eq!(delivery.sent, 1);
        match sink.received_by(addr(5000)).as_slice() {
            [Outbound::Response(response)] => {
                assert!(!response.success);
                assert!(response.users.is_none());
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn file_offer_flows_through_approval_to_delivery() {
        let router = router();
        router.route(br#"{"request":"register","id":"u1","name":"alice"}"#, addr(1000));
        router.route(br#"{"request":"register","id":"u2","name":"bob"}"#, addr(2000));

        let offer = router.route(
            br#"{"request":"send-file","senderId":"u1","targetId":"u2","filename":"a.txt","fileSize":6}"#,
            addr(1000),
        );
        assert!(reply(&offer).success);
        assert_eq!(
            offer[1],
            Envelope::new(
                addr(2000),
                Notice::FileOffered {
                    sender_id: "u1".into(),
                    filename: "a.txt".into(),
                    file_size: 6
                }
            )
        );

        let early = router.route(
            br#"{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"a.txt","seq":0,"total":2,"chunk":"666f6f"}"#,
            addr(1000),
        );
        assert!(!reply(&early).success);

        // The approver is resolved from the source address.
        let approval = router.route(
            br#"{"request":"approve-file-request","sender_id":"u1","filename":"a.txt"}"#,
            addr(2000),
        );
        assert!(reply(&approval).success);
        assert_eq!(
            approval[1],
            Envelope::new(
                addr(1000),
                Notice::FileRequestApproved {
                    approver_id: "u2".into(),
                    filename: "a.txt".into()
                }
            )
        );

        let second = router.route(
            br#"{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"a.txt","seq":1,"total":2,"chunk":"626172"}"#,
            addr(1000),
        );
        assert!(second.is_empty());

        let first = router.route(
            br#"{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"a.txt","seq":0,"total":2,"chunk":"666f6f"}"#,
            addr(1000),
        );
        assert!(reply(&first).success);
        let delivered: Vec<_> = first[1..].iter().map(|e| (e.to, e.message.clone())).collect();
        assert_eq!(
            delivered,
            vec![
                (
                    addr(2000),
                    Outbound::Notice(Notice::FileChunk {
                        sender_id: "u1".into(),
                        filename: "a.txt".into(),
                        seq: 0,
                        total: 1,
                        chunk: "666f6f626172".into()
                    })
                ),
                (
                    addr(2000),
                    Outbound::Notice(Notice::FileTransferComplete {
                        sender_id: "u1".into(),
                        filename: "a.txt".into(),
                        file_size: 6
                    })
                ),
            ]
        );
        assert_eq!(router.stats().pending_transfers, 0);
    }

    #[test]
    fn completion_marker_reports_gaps() {
        let router = router();
        router.route(br#"{"request":"register","id":"u1","name":"alice"}"#, addr(1000));
        router.route(br#"{"request":"register","id":"u2","name":"bob"}"#, addr(2000));
        router.route(
            br#"{"request":"request-file","senderId":"u2","targetId":"u1","filename":"a.txt"}"#,
            addr(2000),
        );
        let approval = router.route(
            br#"{"request":"approve-file-request","id":"u1","senderId":"u2","filename":"a.txt"}"#,
            addr(1000),
        );
        assert!(reply(&approval).success);

        router.route(
            br#"{"request":"file-chunk","targetId":"u2","filename":"a.txt","seq":2,"total":3,"chunk":"7a"}"#,
            addr(1000),
        );
        let marker = router.route(
            br#"{"request":"file-transfer-complete","targetId":"u2","filename":"a.txt"}"#,
            addr(1000),
        );
        let response = reply(&marker);
        assert!(!response.success);
        assert_eq!(response.missing, Some(vec![0, 1]));
        assert_eq!(router.stats().pending_transfers, 1);
    }

    fn approved_offer(router: &Router<RecordingSink>, file_size: usize) {
        router.route(br#"{"request":"register","id":"u1","name":"alice"}"#, addr(1000));
        router.route(br#"{"request":"register","id":"u2","name":"bob"}"#, addr(2000));
        let offer = format!(
            r#"{{"request":"send-file","senderId":"u1","targetId":"u2","filename":"f","fileSize":{file_size}}}"#
        );
        assert!(reply(&router.route(offer.as_bytes(), addr(1000))).success);
        let approval = router.route(
            br#"{"request":"approve-file-request","id":"u2","senderId":"u1","filename":"f"}"#,
            addr(2000),
        );
        assert!(reply(&approval).success);
    }

    #[tokio::test]
    async fn huge_chunk_total_is_rejected_before_anything_is_buffered() {
        let sink = Arc::new(RecordingSink::default());
        let router = Router::new(Arc::clone(&sink), RelayConfig::default());
        approved_offer(&router, 1);

        let chunk = router.route(
            br#"{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"f","seq":0,"total":4294967295,"chunk":""}"#,
            addr(1000),
        );
        let rejected = reply(&chunk);
        assert!(!rejected.success);
        assert_eq!(
            rejected.reason.as_deref(),
            Some("transfer of at most 1 bytes cannot span 4294967295 chunks")
        );

        let delivery = router
            .dispatch(
                br#"{"request":"file-transfer-complete","targetId":"u2","filename":"f"}"#,
                addr(1000),
            )
            .await;
        assert_eq!(delivery, Delivery { sent: 1, failed: 0 });
        match sink.received_by(addr(1000)).as_slice() {
            [Outbound::Response(response)] => {
                assert!(!response.success);
                assert_eq!(response.missing, Some(vec![0]));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivered_chunks_fit_a_small_datagram_ceiling() {
        let config = RelayConfig {
            max_datagram: 1024,
            ..RelayConfig::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let router = Router::new(Arc::clone(&sink), config);
        approved_offer(&router, 600);

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut last = Delivery::default();
        for (seq, part) in payload.chunks(300).enumerate() {
            let request = format!(
                r#"{{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"f","seq":{seq},"total":2,"chunk":"{}"}}"#,
                hex::encode(part)
            );
            last = router.dispatch(request.as_bytes(), addr(1000)).await;
        }
        assert_eq!(last.failed, 0);

        let mut received = Vec::new();
        let mut completed = false;
        for message in sink.received_by(addr(2000)) {
            match message {
                Outbound::Notice(Notice::FileChunk { chunk, .. }) => {
                    received.extend(hex::decode(chunk).expect("hex chunk"));
                }
                Outbound::Notice(Notice::FileTransferComplete { file_size, .. }) => {
                    assert_eq!(file_size, 600);
                    completed = true;
                }
                _ => {}
            }
        }
        assert!(completed);
        assert_eq!(received, payload);
    }

    #[test]
    fn undeliverable_filename_is_refused_at_offer() {
        let config = RelayConfig {
            max_datagram: 256,
            ..RelayConfig::default()
        };
        let router = Router::new(Arc::new(RecordingSink::default()), config);
        router.route(br#"{"request":"register","id":"u1","name":"alice"}"#, addr(1000));
        router.route(br#"{"request":"register","id":"u2","name":"bob"}"#, addr(2000));

        let filename = "x".repeat(300);
        let offer = format!(
            r#"{{"request":"send-file","senderId":"u1","targetId":"u2","filename":"{filename}","fileSize":1}}"#
        );
        assert!(!reply(&router.route(offer.as_bytes(), addr(1000))).success);
        assert_eq!(router.stats().pending_transfers, 0);
    }

    #[test]
    fn room_cap_leaves_no_session_behind() {
        let config = RelayConfig {
            max_rooms: 1,
            ..RelayConfig::default()
        };
        let router = Router::new(Arc::new(RecordingSink::default()), config);
        create_room(&router, "u1", "alice", addr(1000));

        let refused = reply(&router.route(
            br#"{"request":"create-room","senderId":"u2","senderName":"bob"}"#,
            addr(2000),
        ));
        assert_eq!(refused.reason.as_deref(), Some("room limit of 1 reached"));
        assert_eq!(router.stats().sessions, 1);
    }

    #[test]
    fn invalid_hex_chunk_is_rejected() {
        let router = router();
        let response = reply(&router.route(
            br#"{"request":"file-chunk","senderId":"u1","targetId":"u2","filename":"a","seq":0,"total":1,"chunk":"zz"}"#,
            addr(1000),
        ));
        assert_eq!(response.reason.as_deref(), Some("chunk payload is not valid hex"));
    }

    #[test]
    fn cancel_notifies_the_other_party() {
        let router = router();
        router.route(br#"{"request":"register","id":"u1","name":"alice"}"#, addr(1000));
        router.route(br#"{"request":"register","id":"u2","name":"bob"}"#, addr(2000));
        router.route(
            br#"{"request":"send-file","senderId":"u1","targetId":"u2","filename":"a.txt","fileSize":3}"#,
            addr(1000),
        );

        let outsider = reply(&router.route(
            br#"{"request":"cancel-file","id":"u9","senderId":"u1","targetId":"u2","filename":"a.txt"}"#,
            addr(9000),
        ));
        assert!(!outsider.success);

        let cancelled = router.route(
            br#"{"request":"cancel-file","id":"u2","senderId":"u1","targetId":"u2","filename":"a.txt"}"#,
            addr(2000),
        );
        assert!(reply(&cancelled).success);
        assert_eq!(
            cancelled[1],
            Envelope::new(
                addr(1000),
                Notice::FileTransferCancelled {
                    cancelled_by: "u2".into(),
                    filename: "a.txt".into()
                }
            )
        );
        assert_eq!(router.stats().pending_transfers, 0);
    }

    #[test]
    fn state_grows_under_churn_without_eviction() {
        let router = router();
        let room_id = create_room(&router, "owner", "owner", addr(999));

        for i in 0..50u16 {
            let id = format!("churn-{i}");
            subscribe(&router, &id, &id, &room_id, addr(2000 + i));
            let request = format!(r#"{{"request":"unsubscribe","id":"{id}","roomId":"{room_id}"}}"#);
            router.route(request.as_bytes(), addr(2000 + i));
        }

        let stats = router.stats();
        // Membership is released, sessions of departed clients are not.
        assert_eq!(stats.memberships, 1);
        assert_eq!(stats.sessions, 51);
        assert_eq!(stats.rooms, 1);
    }
}

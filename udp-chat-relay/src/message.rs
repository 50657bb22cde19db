//! JSON datagram codec.
//!
//! Every datagram carries exactly one JSON object. Inbound objects are decoded
//! once into a [`Request`] keyed by their `request` field; outbound traffic is
//! one of [`Response`], [`ChatLine`] or [`Notice`], wrapped in [`Outbound`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{DecodeError, RelayError};

/// Sender label used for room notices generated by the relay itself.
pub const SYSTEM_SENDER: &str = "CHAT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(alias = "user_id")]
        sender_id: String,
        #[serde(alias = "user_name")]
        sender_name: String,
        #[serde(default, alias = "room_name")]
        room_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Subscribe {
        id: String,
        name: String,
        #[serde(alias = "room_id")]
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        id: String,
        #[serde(alias = "room_id")]
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(alias = "user_name")]
        sender_name: String,
        #[serde(alias = "room_id")]
        room_id: String,
        message: String,
    },
    ListRooms,
    #[serde(rename_all = "camelCase")]
    RoomExists {
        #[serde(alias = "room_id")]
        room_id: String,
    },
    Register {
        id: String,
        name: String,
    },
    ListUsers,
    #[serde(rename_all = "camelCase")]
    SendFile {
        #[serde(alias = "id")]
        sender_id: String,
        #[serde(alias = "target_user_id")]
        target_id: String,
        filename: String,
        #[serde(alias = "filesize")]
        file_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    RequestFile {
        #[serde(alias = "id")]
        sender_id: String,
        #[serde(alias = "target_user_id")]
        target_id: String,
        filename: String,
    },
    /// `id` is the approver. When omitted it is resolved from the source address.
    #[serde(rename_all = "camelCase")]
    ApproveFileRequest {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "sender_id")]
        sender_id: String,
        filename: String,
        #[serde(default, alias = "filesize")]
        file_size: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        #[serde(default, alias = "sender_id")]
        sender_id: Option<String>,
        #[serde(alias = "target_user_id")]
        target_id: String,
        filename: String,
        seq: u32,
        total: u32,
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    FileTransferComplete {
        #[serde(default, alias = "sender_id")]
        sender_id: Option<String>,
        #[serde(alias = "target_user_id")]
        target_id: String,
        filename: String,
    },
    #[serde(rename_all = "camelCase")]
    CancelFile {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "sender_id")]
        sender_id: String,
        #[serde(alias = "target_user_id")]
        target_id: String,
        filename: String,
    },
}

impl Request {
    /// Every value the `request` discriminator may take.
    pub const KINDS: &'static [&'static str] = &[
        "create-room",
        "subscribe",
        "unsubscribe",
        "send-message",
        "list-rooms",
        "room-exists",
        "register",
        "list-users",
        "send-file",
        "request-file",
        "approve-file-request",
        "file-chunk",
        "file-transfer-complete",
        "cancel-file",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Request::CreateRoom { .. } => "create-room",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::SendMessage { .. } => "send-message",
            Request::ListRooms => "list-rooms",
            Request::RoomExists { .. } => "room-exists",
            Request::Register { .. } => "register",
            Request::ListUsers => "list-users",
            Request::SendFile { .. } => "send-file",
            Request::RequestFile { .. } => "request-file",
            Request::ApproveFileRequest { .. } => "approve-file-request",
            Request::FileChunk { .. } => "file-chunk",
            Request::FileTransferComplete { .. } => "file-transfer-complete",
            Request::CancelFile { .. } => "cancel-file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
}

/// Direct reply to the address a request came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<RoomSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<UserSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<u32>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_exists(mut self, exists: bool) -> Self {
        self.exists = Some(exists);
        self
    }

    pub fn with_rooms(mut self, rooms: Vec<RoomSummary>) -> Self {
        self.rooms = Some(rooms);
        self
    }

    pub fn with_users(mut self, users: Vec<UserSummary>) -> Self {
        self.users = Some(users);
        self
    }
}

impl From<&RelayError> for Response {
    fn from(err: &RelayError) -> Self {
        let mut response = Response::failure(err.to_string());
        if let RelayError::Incomplete { missing, .. } = err {
            response.missing = Some(missing.clone());
        }
        response
    }
}

/// A line of room traffic, either user chat or a relay notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatLine {
    pub user: String,
    pub message: String,
}

impl ChatLine {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            user: SYSTEM_SENDER.to_string(),
            message: message.into(),
        }
    }
}

/// File transfer traffic pushed to a client outside of a direct reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Notice {
    /// A sender offers a file; the recipient answers with `approve-file-request`.
    #[serde(rename = "send-file", rename_all = "camelCase")]
    FileOffered {
        sender_id: String,
        filename: String,
        file_size: u64,
    },
    /// A recipient asks the holder for a file.
    #[serde(rename = "request-file", rename_all = "camelCase")]
    FileWanted {
        requester_id: String,
        filename: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRequestApproved {
        approver_id: String,
        filename: String,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        sender_id: String,
        filename: String,
        seq: u32,
        total: u32,
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    FileTransferComplete {
        sender_id: String,
        filename: String,
        file_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileTransferCancelled {
        cancelled_by: String,
        filename: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Chat(ChatLine),
    Notice(Notice),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Outbound::Response(response)
    }
}

impl From<ChatLine> for Outbound {
    fn from(line: ChatLine) -> Self {
        Outbound::Chat(line)
    }
}

impl From<Notice> for Outbound {
    fn from(notice: Notice) -> Self {
        Outbound::Notice(notice)
    }
}

/// Decodes an inbound datagram, classifying every way it can be malformed.
pub fn decode_request(datagram: &[u8]) -> Result<Request, DecodeError> {
    let text = std::str::from_utf8(datagram).map_err(|_| DecodeError::Utf8)?;
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|err| DecodeError::Json(err.to_string()))?;

    let kind = match value.as_object() {
        Some(fields) => match fields.get("request").and_then(Value::as_str) {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Err(DecodeError::MissingRequest),
        },
        None => return Err(DecodeError::NotAnObject),
    };

    if !Request::KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownRequest(kind));
    }

    serde_json::from_value(value).map_err(|err| DecodeError::InvalidFields {
        request: kind,
        reason: err.to_string(),
    })
}

/// Decodes any relay message; used by clients and tests reading replies.
pub fn decode<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(datagram).map_err(|err| DecodeError::Json(err.to_string()))
}

/// Encodes a message, refusing anything that would not fit in one datagram.
pub fn encode<T: Serialize>(message: &T, limit: usize) -> Result<Vec<u8>, RelayError> {
    let encoded = serde_json::to_vec(message).map_err(|err| RelayError::Encode(err.to_string()))?;
    if encoded.len() > limit {
        return Err(RelayError::Oversized {
            len: encoded.len(),
            limit,
        });
    }
    Ok(encoded)
}

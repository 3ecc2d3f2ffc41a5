use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Largest accepted `ciphertext_b64` payload, in bytes of the encoded form.
pub const MAX_CIPHERTEXT_LEN: usize = 64 * 1024;

/// Bounds on the negotiated heartbeat interval.
pub const HEARTBEAT_MIN_SECS: u64 = 10;
pub const HEARTBEAT_MAX_SECS: u64 = 300;

/// WebSocket close codes pushed by the subscription hub.
pub const WS_CLOSE_NORMAL: u16 = 1000;
pub const WS_CLOSE_GOING_AWAY: u16 = 1001;
pub const WS_CLOSE_MAILBOX_CLOSED: u16 = 4000;
pub const WS_CLOSE_SLOW_CONSUMER: u16 = 4001;
pub const WS_CLOSE_RATE_LIMITED: u16 = 4008;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub device_label: String,
    /// Requested heartbeat cadence; the server clamps and echoes the
    /// negotiated value back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub client_id: ClientId,
    /// Returned exactly once; no other response ever carries it.
    pub session_token: String,
    pub heartbeat_interval_secs: u64,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub client_id: ClientId,
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub next_heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCloseRequest {
    pub client_id: ClientId,
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInitRequest {
    pub client_id: ClientId,
    pub session_token: String,
    /// Client-generated rendezvous token, base64url without padding.
    pub rendezvous_id_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInitResponse {
    pub mailbox_id: String,
    pub expires_at_epoch_ms: u64,
    /// Shareable pairing link, present when the server knows its public URL.
    /// The caller appends the secret fragment before sharing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionJoinRequest {
    pub token_b64: String,
    /// Optional: a registered joiner is recorded under its client id;
    /// an anonymous one under its own mailbox reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionJoinResponse {
    /// The initiator's mailbox: the joiner writes into it and reads from it.
    pub mailbox_id: String,
    /// The joiner's own mailbox reference, used as `from_mailbox_id`.
    pub peer_mailbox_id: String,
    pub expires_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxSendRequest {
    pub mailbox_id: String,
    pub from_mailbox_id: String,
    pub ciphertext_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxRecvRequest {
    pub mailbox_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub seq: u64,
    pub from_mailbox_id: String,
    pub ciphertext_b64: String,
    pub created_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxRecvResponse {
    pub messages: Vec<MailboxMessage>,
}

/// Uniform error body; `correlation_id` only accompanies 500s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{connect_redis, RedisStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Transient backend failure; callers may see 503 after retries.
    Unavailable,
    Serialization,
    /// Record absent, expired, or already reaped.
    Missing,
    /// Write-if-absent hit a live record.
    AlreadyExists,
    QueueFull,
    ParticipantLimit,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "backing store unavailable"),
            Self::Serialization => write!(f, "record serialization failure"),
            Self::Missing => write!(f, "record missing"),
            Self::AlreadyExists => write!(f, "record already exists"),
            Self::QueueFull => write!(f, "mailbox queue full"),
            Self::ParticipantLimit => write!(f, "participant limit reached"),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    pub session_token: String,
    pub display_name: String,
    pub device_label: String,
    pub heartbeat_interval_secs: u64,
    pub created_at_epoch_ms: u64,
    pub last_seen_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousRecord {
    pub rendezvous_id: String,
    pub owner_mailbox_id: String,
    pub owner_client_id: String,
    pub created_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxHeader {
    pub mailbox_id: String,
    /// Initiator first, joiner second; never more than two.
    pub participants: Vec<String>,
    pub next_seq: u64,
    pub created_at_epoch_ms: u64,
    pub expires_at_epoch_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub from_mailbox_id: String,
    pub ciphertext_b64: String,
    pub created_at_epoch_ms: u64,
}

/// TTL policy applied by every mailbox mutation.
#[derive(Debug, Clone, Copy)]
pub struct MailboxLimits {
    pub max_queue_len: usize,
    pub idle_extension: Duration,
    pub max_lifetime: Duration,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            max_queue_len: 128,
            idle_extension: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(600),
        }
    }
}

impl MailboxLimits {
    /// New expiry after activity at `now`: idle extension, capped at the
    /// hard lifetime from creation.
    pub fn extended_expiry(&self, created_at_epoch_ms: u64, now_epoch_ms: u64) -> u64 {
        let idle = now_epoch_ms + self.idle_extension.as_millis() as u64;
        let cap = created_at_epoch_ms + self.max_lifetime.as_millis() as u64;
        idle.min(cap)
    }
}

/// Everything the reaper learned in one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired_sessions: Vec<String>,
    pub reaped_mailboxes: Vec<String>,
}

/// The single source of truth for sessions, rendezvous tokens and
/// mailboxes. Implementations must make `create_rendezvous` a
/// write-if-absent, `claim_rendezvous` an atomic take-and-delete, and
/// `append_message` a single linearization point for seq assignment,
/// queue bound and TTL extension.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn put_session(
        &self,
        record: &SessionRecord,
        idle_ttl: Duration,
    ) -> Result<(), StorageError>;
    async fn get_session(
        &self,
        client_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<SessionRecord>, StorageError>;
    /// Refreshes `last_seen` and the idle TTL in one step.
    async fn touch_session(
        &self,
        client_id: &str,
        last_seen_epoch_ms: u64,
        idle_ttl: Duration,
    ) -> Result<(), StorageError>;
    async fn delete_session(&self, client_id: &str) -> Result<(), StorageError>;
    async fn session_count(&self) -> Result<u64, StorageError>;

    async fn create_rendezvous(
        &self,
        record: &RendezvousRecord,
        ttl: Duration,
    ) -> Result<(), StorageError>;
    /// Returns the record and deletes it atomically; `None` when the
    /// token is unknown, expired, or already consumed.
    async fn claim_rendezvous(
        &self,
        rendezvous_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<RendezvousRecord>, StorageError>;

    async fn create_mailbox(&self, header: &MailboxHeader) -> Result<(), StorageError>;
    async fn get_mailbox(
        &self,
        mailbox_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<MailboxHeader>, StorageError>;
    async fn add_participant(
        &self,
        mailbox_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError>;
    /// Atomic append: assigns the next dense seq, enforces the queue
    /// bound, and extends the TTL in one step. Returns the assigned seq.
    async fn append_message(
        &self,
        mailbox_id: &str,
        from_mailbox_id: &str,
        ciphertext_b64: &str,
        now_epoch_ms: u64,
    ) -> Result<u64, StorageError>;
    /// All messages in ascending seq order; extends the TTL, never
    /// consumes.
    async fn read_messages(
        &self,
        mailbox_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Vec<StoredMessage>, StorageError>;
    async fn delete_mailbox(&self, mailbox_id: &str) -> Result<(), StorageError>;

    /// Drops expired records and cascades mailboxes whose sole owner
    /// expired. Backends with native TTL reaping may return an empty
    /// report.
    async fn sweep(&self, now_epoch_ms: u64) -> Result<SweepReport, StorageError>;
}

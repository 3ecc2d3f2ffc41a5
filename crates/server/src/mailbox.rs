use crate::hub::{CloseReason, SubscriptionHub};
use crate::metrics::Metrics;
use crate::util::now_epoch_ms;
use paircast_crypto::generate_mailbox_id;
use paircast_proto::MailboxMessage;
use paircast_storage::{MailboxHeader, StorageError, Store};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum MailboxError {
    /// Expired, deleted, or never created.
    Gone,
    Full,
    ParticipantLimit,
    Store(StorageError),
}

impl Display for MailboxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gone => write!(f, "mailbox gone"),
            Self::Full => write!(f, "mailbox queue full"),
            Self::ParticipantLimit => write!(f, "participant limit exceeded"),
            Self::Store(err) => write!(f, "mailbox store failure: {}", err),
        }
    }
}

impl Error for MailboxError {}

impl From<StorageError> for MailboxError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Missing => Self::Gone,
            StorageError::QueueFull => Self::Full,
            StorageError::ParticipantLimit => Self::ParticipantLimit,
            other => Self::Store(other),
        }
    }
}

/// Mailbox lifecycle and the append/read path. Appends go through a
/// per-mailbox lock so the store write and the hub publish happen as
/// one ordered step; without it two concurrent appends could fan out
/// with seqs transposed even though the store assigned them densely.
pub struct MailboxService {
    store: Arc<dyn Store>,
    hub: Arc<SubscriptionHub>,
    metrics: Arc<Metrics>,
    initial_ttl: Duration,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MailboxService {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<SubscriptionHub>,
        metrics: Arc<Metrics>,
        initial_ttl: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            metrics,
            initial_ttl,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a mailbox. With no owner the mailbox is its own sole
    /// participant reference (anonymous joiner case).
    pub async fn create(&self, owner: Option<&str>) -> Result<MailboxHeader, MailboxError> {
        let now = now_epoch_ms();
        let mailbox_id = generate_mailbox_id();
        let participant = owner.unwrap_or(mailbox_id.as_str()).to_string();
        let header = MailboxHeader {
            mailbox_id,
            participants: vec![participant],
            next_seq: 0,
            created_at_epoch_ms: now,
            expires_at_epoch_ms: now + self.initial_ttl.as_millis() as u64,
        };
        self.store.create_mailbox(&header).await?;
        self.metrics.mark_mailbox_created();
        Ok(header)
    }

    pub async fn verify(&self, mailbox_id: &str) -> Result<MailboxHeader, MailboxError> {
        self.store
            .get_mailbox(mailbox_id, now_epoch_ms())
            .await?
            .ok_or(MailboxError::Gone)
    }

    pub async fn add_participant(
        &self,
        mailbox_id: &str,
        participant: &str,
    ) -> Result<(), MailboxError> {
        self.store.add_participant(mailbox_id, participant).await?;
        Ok(())
    }

    pub async fn append(
        &self,
        mailbox_id: &str,
        from_mailbox_id: &str,
        ciphertext_b64: &str,
    ) -> Result<u64, MailboxError> {
        let lock = self.append_lock(mailbox_id).await;
        let _ordered = lock.lock().await;
        let now = now_epoch_ms();
        let seq = self
            .store
            .append_message(mailbox_id, from_mailbox_id, ciphertext_b64, now)
            .await?;
        let message = MailboxMessage {
            seq,
            from_mailbox_id: from_mailbox_id.to_string(),
            ciphertext_b64: ciphertext_b64.to_string(),
            created_at_epoch_ms: now,
        };
        self.hub.publish(mailbox_id, &message).await;
        self.metrics.mark_append();
        Ok(seq)
    }

    pub async fn read_all(&self, mailbox_id: &str) -> Result<Vec<MailboxMessage>, MailboxError> {
        let stored = self
            .store
            .read_messages(mailbox_id, now_epoch_ms())
            .await?;
        Ok(stored
            .into_iter()
            .map(|message| MailboxMessage {
                seq: message.seq,
                from_mailbox_id: message.from_mailbox_id,
                ciphertext_b64: message.ciphertext_b64,
                created_at_epoch_ms: message.created_at_epoch_ms,
            })
            .collect())
    }

    /// Idempotent delete; live subscribers see `mailbox_closed`.
    pub async fn delete(&self, mailbox_id: &str) -> Result<(), MailboxError> {
        self.store.delete_mailbox(mailbox_id).await?;
        self.hub
            .close_mailbox(mailbox_id, CloseReason::MailboxClosed)
            .await;
        self.forget(mailbox_id).await;
        Ok(())
    }

    /// Drops the per-mailbox append lock once the mailbox is gone.
    pub async fn forget(&self, mailbox_id: &str) {
        let mut locks = self.append_locks.lock().await;
        locks.remove(mailbox_id);
    }

    async fn append_lock(&self, mailbox_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        Arc::clone(
            locks
                .entry(mailbox_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

use crate::util::now_epoch_ms;
use paircast_storage::{RendezvousRecord, StorageError, Store};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum RendezvousError {
    /// Never registered, expired, or already consumed: all identical
    /// to the caller.
    TokenUnknown,
    /// A live token with the same id already exists.
    Duplicate,
    Store(StorageError),
}

impl Display for RendezvousError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenUnknown => write!(f, "rendezvous token unknown"),
            Self::Duplicate => write!(f, "rendezvous token already registered"),
            Self::Store(err) => write!(f, "rendezvous store failure: {}", err),
        }
    }
}

impl Error for RendezvousError {}

impl From<StorageError> for RendezvousError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AlreadyExists => Self::Duplicate,
            other => Self::Store(other),
        }
    }
}

/// Single-use claim registry. `claim` is an atomic take-and-delete in
/// the store, so concurrent joiners race to exactly one winner; a
/// two-step read-then-delete would let both through.
pub struct RendezvousRegistry {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl RendezvousRegistry {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn create(
        &self,
        rendezvous_id: &str,
        owner_mailbox_id: &str,
        owner_client_id: &str,
    ) -> Result<(), RendezvousError> {
        let record = RendezvousRecord {
            rendezvous_id: rendezvous_id.to_string(),
            owner_mailbox_id: owner_mailbox_id.to_string(),
            owner_client_id: owner_client_id.to_string(),
            created_at_epoch_ms: now_epoch_ms(),
        };
        self.store.create_rendezvous(&record, self.ttl).await?;
        Ok(())
    }

    pub async fn claim(&self, rendezvous_id: &str) -> Result<RendezvousRecord, RendezvousError> {
        self.store
            .claim_rendezvous(rendezvous_id, now_epoch_ms())
            .await?
            .ok_or(RendezvousError::TokenUnknown)
    }
}

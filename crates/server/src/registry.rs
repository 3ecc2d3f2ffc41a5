use crate::names::display_name;
use crate::util::{generate_session_token, now_epoch_ms};
use paircast_proto::{ClientId, HEARTBEAT_MAX_SECS, HEARTBEAT_MIN_SECS};
use paircast_storage::{SessionRecord, StorageError, Store};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

#[derive(Debug)]
pub enum RegistryError {
    /// Unknown client, expired session, and token mismatch all collapse
    /// into this one variant so callers cannot enumerate sessions.
    AuthFailed,
    /// The process-wide session cap is exhausted.
    Capacity,
    Store(StorageError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::Capacity => write!(f, "session capacity exhausted"),
            Self::Store(err) => write!(f, "session store failure: {}", err),
        }
    }
}

impl Error for RegistryError {}

impl From<StorageError> for RegistryError {
    fn from(err: StorageError) -> Self {
        Self::Store(err)
    }
}

pub struct RegisteredSession {
    pub client_id: ClientId,
    pub session_token: String,
    pub display_name: String,
    pub heartbeat_interval_secs: u64,
}

/// Issues and verifies client sessions. Heartbeats are advisory: every
/// authenticated call refreshes `last_seen`, so a client that only
/// makes data calls stays alive without ever calling `/heartbeat`.
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    idle_ttl: Duration,
    heartbeat_interval: Duration,
    max_sessions: u64,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        idle_ttl: Duration,
        heartbeat_interval: Duration,
        max_sessions: u64,
    ) -> Self {
        Self {
            store,
            idle_ttl,
            heartbeat_interval,
            max_sessions,
        }
    }

    pub async fn register(
        &self,
        device_label: &str,
        requested_heartbeat_secs: Option<u64>,
    ) -> Result<RegisteredSession, RegistryError> {
        if self.store.session_count().await? >= self.max_sessions {
            return Err(RegistryError::Capacity);
        }
        let client_id = Uuid::new_v4();
        let session_token = generate_session_token();
        let name = display_name(&client_id);
        let heartbeat = self.negotiate_heartbeat(requested_heartbeat_secs);
        let now = now_epoch_ms();
        let record = SessionRecord {
            client_id: client_id.to_string(),
            session_token: session_token.clone(),
            display_name: name.clone(),
            device_label: device_label.to_string(),
            heartbeat_interval_secs: heartbeat,
            created_at_epoch_ms: now,
            last_seen_epoch_ms: now,
        };
        self.store.put_session(&record, self.idle_ttl).await?;
        Ok(RegisteredSession {
            client_id,
            session_token,
            display_name: name,
            heartbeat_interval_secs: heartbeat,
        })
    }

    /// Verifies the token in constant time and refreshes the idle TTL.
    pub async fn authenticate(
        &self,
        client_id: &ClientId,
        session_token: &str,
    ) -> Result<SessionRecord, RegistryError> {
        let now = now_epoch_ms();
        let record = self
            .store
            .get_session(&client_id.to_string(), now)
            .await?
            .ok_or(RegistryError::AuthFailed)?;
        let matches: bool = record
            .session_token
            .as_bytes()
            .ct_eq(session_token.as_bytes())
            .into();
        if !matches {
            return Err(RegistryError::AuthFailed);
        }
        self.store
            .touch_session(&record.client_id, now, self.idle_ttl)
            .await
            .map_err(|err| match err {
                StorageError::Missing => RegistryError::AuthFailed,
                other => RegistryError::Store(other),
            })?;
        Ok(record)
    }

    pub async fn heartbeat(
        &self,
        client_id: &ClientId,
        session_token: &str,
    ) -> Result<u64, RegistryError> {
        self.authenticate(client_id, session_token).await?;
        Ok(self.heartbeat_interval.as_secs())
    }

    /// Explicit session termination; the caller cascades mailboxes.
    pub async fn close(
        &self,
        client_id: &ClientId,
        session_token: &str,
    ) -> Result<(), RegistryError> {
        self.authenticate(client_id, session_token).await?;
        self.store.delete_session(&client_id.to_string()).await?;
        Ok(())
    }

    fn negotiate_heartbeat(&self, requested_secs: Option<u64>) -> u64 {
        requested_secs
            .unwrap_or_else(|| self.heartbeat_interval.as_secs())
            .clamp(HEARTBEAT_MIN_SECS, HEARTBEAT_MAX_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paircast_storage::{MailboxLimits, MemoryStore};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(MemoryStore::new(MailboxLimits::default())),
            Duration::from_secs(300),
            Duration::from_secs(30),
            4,
        )
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let registry = registry();
        let session = registry.register("laptop", None).await.unwrap();
        assert_eq!(session.heartbeat_interval_secs, 30);
        let record = registry
            .authenticate(&session.client_id, &session.session_token)
            .await
            .unwrap();
        assert_eq!(record.device_label, "laptop");
        assert_eq!(record.display_name, session.display_name);
    }

    #[tokio::test]
    async fn wrong_token_is_indistinguishable_from_unknown_client() {
        let registry = registry();
        let session = registry.register("", None).await.unwrap();
        let wrong = registry
            .authenticate(&session.client_id, &"0".repeat(64))
            .await;
        let unknown = registry
            .authenticate(&Uuid::new_v4(), &session.session_token)
            .await;
        assert!(matches!(wrong, Err(RegistryError::AuthFailed)));
        assert!(matches!(unknown, Err(RegistryError::AuthFailed)));
    }

    #[tokio::test]
    async fn heartbeat_interval_is_clamped() {
        let registry = registry();
        let low = registry.register("", Some(1)).await.unwrap();
        assert_eq!(low.heartbeat_interval_secs, HEARTBEAT_MIN_SECS);
        let high = registry.register("", Some(86_400)).await.unwrap();
        assert_eq!(high.heartbeat_interval_secs, HEARTBEAT_MAX_SECS);
    }

    #[tokio::test]
    async fn capacity_cap_refuses_registration() {
        let registry = registry();
        for _ in 0..4 {
            registry.register("", None).await.unwrap();
        }
        assert!(matches!(
            registry.register("", None).await,
            Err(RegistryError::Capacity)
        ));
    }

    #[tokio::test]
    async fn closed_session_rejects_further_calls() {
        let registry = registry();
        let session = registry.register("", None).await.unwrap();
        registry
            .close(&session.client_id, &session.session_token)
            .await
            .unwrap();
        assert!(matches!(
            registry
                .authenticate(&session.client_id, &session.session_token)
                .await,
            Err(RegistryError::AuthFailed)
        ));
    }
}

use crate::{
    MailboxHeader, MailboxLimits, RendezvousRecord, SessionRecord, Store, StorageError,
    StoredMessage, SweepReport,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

struct MailboxEntry {
    header: MailboxHeader,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, (SessionRecord, u64)>,
    rendezvous: HashMap<String, (RendezvousRecord, u64)>,
    mailboxes: HashMap<String, MailboxEntry>,
}

/// In-process store with the same TTL semantics as the Redis backend.
/// One mutex linearizes every mutation, which also settles concurrent
/// appends into a single dense seq order. Expiry is checked against the
/// caller-supplied clock, so tests can run on virtual time.
pub struct MemoryStore {
    limits: MailboxLimits,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(limits: MailboxLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put_session(
        &self,
        record: &SessionRecord,
        idle_ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let expires = record.last_seen_epoch_ms + idle_ttl.as_millis() as u64;
        inner
            .sessions
            .insert(record.client_id.clone(), (record.clone(), expires));
        Ok(())
    }

    async fn get_session(
        &self,
        client_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<SessionRecord>, StorageError> {
        let mut inner = self.inner.lock().await;
        let live = match inner.sessions.get(client_id) {
            Some((_, expires)) => now_epoch_ms < *expires,
            None => return Ok(None),
        };
        if !live {
            inner.sessions.remove(client_id);
            return Ok(None);
        }
        Ok(inner
            .sessions
            .get(client_id)
            .map(|(record, _)| record.clone()))
    }

    async fn touch_session(
        &self,
        client_id: &str,
        last_seen_epoch_ms: u64,
        idle_ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(client_id) {
            Some((record, expires)) => {
                record.last_seen_epoch_ms = last_seen_epoch_ms;
                *expires = last_seen_epoch_ms + idle_ttl.as_millis() as u64;
                Ok(())
            }
            None => Err(StorageError::Missing),
        }
    }

    async fn delete_session(&self, client_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(client_id);
        Ok(())
    }

    async fn session_count(&self) -> Result<u64, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.len() as u64)
    }

    async fn create_rendezvous(
        &self,
        record: &RendezvousRecord,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let now = record.created_at_epoch_ms;
        if let Some((_, expires)) = inner.rendezvous.get(&record.rendezvous_id) {
            if now < *expires {
                return Err(StorageError::AlreadyExists);
            }
        }
        let expires = now + ttl.as_millis() as u64;
        inner
            .rendezvous
            .insert(record.rendezvous_id.clone(), (record.clone(), expires));
        Ok(())
    }

    async fn claim_rendezvous(
        &self,
        rendezvous_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<RendezvousRecord>, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.rendezvous.remove(rendezvous_id) {
            Some((record, expires)) if now_epoch_ms < expires => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn create_mailbox(&self, header: &MailboxHeader) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.mailboxes.insert(
            header.mailbox_id.clone(),
            MailboxEntry {
                header: header.clone(),
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_mailbox(
        &self,
        mailbox_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Option<MailboxHeader>, StorageError> {
        let mut inner = self.inner.lock().await;
        if expire_mailbox_if_due(&mut inner, mailbox_id, now_epoch_ms) {
            return Ok(None);
        }
        Ok(inner
            .mailboxes
            .get(mailbox_id)
            .map(|entry| entry.header.clone()))
    }

    async fn add_participant(
        &self,
        mailbox_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .mailboxes
            .get_mut(mailbox_id)
            .ok_or(StorageError::Missing)?;
        if entry.header.participants.len() >= 2 {
            return Err(StorageError::ParticipantLimit);
        }
        entry.header.participants.push(client_id.to_string());
        Ok(())
    }

    async fn append_message(
        &self,
        mailbox_id: &str,
        from_mailbox_id: &str,
        ciphertext_b64: &str,
        now_epoch_ms: u64,
    ) -> Result<u64, StorageError> {
        let limits = self.limits;
        let mut inner = self.inner.lock().await;
        if expire_mailbox_if_due(&mut inner, mailbox_id, now_epoch_ms) {
            return Err(StorageError::Missing);
        }
        let entry = inner
            .mailboxes
            .get_mut(mailbox_id)
            .ok_or(StorageError::Missing)?;
        if entry.messages.len() >= limits.max_queue_len {
            return Err(StorageError::QueueFull);
        }
        let seq = entry.header.next_seq;
        entry.header.next_seq += 1;
        entry.header.expires_at_epoch_ms =
            limits.extended_expiry(entry.header.created_at_epoch_ms, now_epoch_ms);
        entry.messages.push(StoredMessage {
            seq,
            from_mailbox_id: from_mailbox_id.to_string(),
            ciphertext_b64: ciphertext_b64.to_string(),
            created_at_epoch_ms: now_epoch_ms,
        });
        Ok(seq)
    }

    async fn read_messages(
        &self,
        mailbox_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let limits = self.limits;
        let mut inner = self.inner.lock().await;
        if expire_mailbox_if_due(&mut inner, mailbox_id, now_epoch_ms) {
            return Err(StorageError::Missing);
        }
        let entry = inner
            .mailboxes
            .get_mut(mailbox_id)
            .ok_or(StorageError::Missing)?;
        entry.header.expires_at_epoch_ms =
            limits.extended_expiry(entry.header.created_at_epoch_ms, now_epoch_ms);
        Ok(entry.messages.clone())
    }

    async fn delete_mailbox(&self, mailbox_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.mailboxes.remove(mailbox_id);
        Ok(())
    }

    async fn sweep(&self, now_epoch_ms: u64) -> Result<SweepReport, StorageError> {
        let mut inner = self.inner.lock().await;
        let mut report = SweepReport::default();

        inner
            .rendezvous
            .retain(|_, (_, expires)| now_epoch_ms < *expires);

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, (_, expires))| now_epoch_ms >= *expires)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in &expired {
            inner.sessions.remove(client_id);
        }

        let mut reaped: Vec<String> = Vec::new();
        inner.mailboxes.retain(|mailbox_id, entry| {
            let ttl_dead = now_epoch_ms >= entry.header.expires_at_epoch_ms;
            let orphaned = entry.header.participants.len() == 1
                && expired.contains(&entry.header.participants[0]);
            if ttl_dead || orphaned {
                reaped.push(mailbox_id.clone());
                false
            } else {
                true
            }
        });

        report.expired_sessions = expired;
        report.reaped_mailboxes = reaped;
        Ok(report)
    }
}

fn expire_mailbox_if_due(inner: &mut MemoryInner, mailbox_id: &str, now_epoch_ms: u64) -> bool {
    let due = match inner.mailboxes.get(mailbox_id) {
        Some(entry) => now_epoch_ms >= entry.header.expires_at_epoch_ms,
        None => false,
    };
    if due {
        inner.mailboxes.remove(mailbox_id);
    }
    due
}

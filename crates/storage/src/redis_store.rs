use crate::{
    MailboxHeader, MailboxLimits, RendezvousRecord, SessionRecord, Store, StorageError,
    StoredMessage, SweepReport,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 40;

const CODE_MISSING: i64 = -1;
const CODE_LIMIT: i64 = -2;

/// Seq assignment, queue bound, and TTL extension in one linearization
/// point. KEYS: header hash, message list. ARGV: from_mailbox_id,
/// ciphertext_b64, now_ms, idle_extension_ms, max_lifetime_ms,
/// max_queue_len. The string fields go through cjson so quotes,
/// backslashes, and control bytes in caller input cannot break the
/// stored frame.
const APPEND_SCRIPT: &str = r#"
local expires = redis.call('HGET', KEYS[1], 'expires_at')
if not expires then return -1 end
local now = tonumber(ARGV[3])
if now >= tonumber(expires) then
  redis.call('DEL', KEYS[1], KEYS[2])
  return -1
end
if redis.call('LLEN', KEYS[2]) >= tonumber(ARGV[6]) then return -2 end
local seq = tonumber(redis.call('HGET', KEYS[1], 'next_seq'))
local created = tonumber(redis.call('HGET', KEYS[1], 'created_at'))
local new_expires = now + tonumber(ARGV[4])
local cap = created + tonumber(ARGV[5])
if new_expires > cap then new_expires = cap end
redis.call('HSET', KEYS[1], 'next_seq', seq + 1, 'expires_at', new_expires)
local frame = string.format(
  '{"seq":%d,"from_mailbox_id":%s,"ciphertext_b64":%s,"created_at_epoch_ms":%d}',
  seq, cjson.encode(ARGV[1]), cjson.encode(ARGV[2]), now)
redis.call('RPUSH', KEYS[2], frame)
redis.call('PEXPIREAT', KEYS[1], new_expires)
redis.call('PEXPIREAT', KEYS[2], new_expires)
return seq
"#;

/// KEYS: header hash. ARGV: joining client id.
const ADD_PARTICIPANT_SCRIPT: &str = r#"
local parts = redis.call('HGET', KEYS[1], 'participants')
if not parts then return -1 end
local count = 0
for _ in string.gmatch(parts, '[^,]+') do count = count + 1 end
if count >= 2 then return -2 end
redis.call('HSET', KEYS[1], 'participants', parts .. ',' .. ARGV[1])
return count + 1
"#;

/// KEYS: header hash, message list. ARGV: now_ms, idle_extension_ms,
/// max_lifetime_ms. Returns the full list, or nil for a dead mailbox.
const READ_SCRIPT: &str = r#"
local expires = redis.call('HGET', KEYS[1], 'expires_at')
if not expires then return false end
local now = tonumber(ARGV[1])
if now >= tonumber(expires) then
  redis.call('DEL', KEYS[1], KEYS[2])
  return false
end
local created = tonumber(redis.call('HGET', KEYS[1], 'created_at'))
local new_expires = now + tonumber(ARGV[2])
local cap = created + tonumber(ARGV[3])
if new_expires > cap then new_expires = cap end
redis.call('HSET', KEYS[1], 'expires_at', new_expires)
redis.call('PEXPIREAT', KEYS[1], new_expires)
redis.call('PEXPIREAT', KEYS[2], new_expires)
return redis.call('LRANGE', KEYS[2], 0, -1)
"#;

/// Opens the Redis connection manager the store runs on.
pub async fn connect_redis(url: &str) -> Result<ConnectionManager, StorageError> {
    let client = redis::Client::open(url).map_err(|_| StorageError::Unavailable)?;
    client
        .get_connection_manager()
        .await
        .map_err(|_| StorageError::Unavailable)
}

/// Redis-backed store. Key layout under the configured prefix:
/// `sess:{client_id}` JSON record, `rdv:{rendezvous_id}` JSON record,
/// `mbox:{mailbox_id}` header hash, `mbox:{mailbox_id}:msgs` list of
/// message frames. All TTLs are enforced by Redis itself; the scripts
/// above also drop a mailbox eagerly when a caller touches it past its
/// recorded expiry.
pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
    limits: MailboxLimits,
    append_script: Script,
    add_participant_script: Script,
    read_script: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager, prefix: &str, limits: MailboxLimits) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
            limits,
            append_script: Script::new(APPEND_SCRIPT),
            add_participant_script: Script::new(ADD_PARTICIPANT_SCRIPT),
            read_script: Script::new(READ_SCRIPT),
        }
    }

    fn sess_key(&self, client_id: &str) -> String {
        format!("{}:sess:{}", self.prefix, client_id)
    }

    fn rdv_key(&self, rendezvous_id: &str) -> String {
        format!("{}:rdv:{}", self.prefix, rendezvous_id)
    }

    fn mbox_key(&self, mailbox_id: &str) -> String {
        format!("{}:mbox:{}", self.prefix, mailbox_id)
    }

    fn msgs_key(&self, mailbox_id: &str) -> String {
        format!("{}:mbox:{}:msgs", self.prefix, mailbox_id)
    }
}

fn transient(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

/// Bounded retry with jitter; only transport-level failures are worth a
/// second attempt, everything else surfaces immediately.
async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, redis::RedisError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if transient(&err) && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let jitter = rand::random::<u64>() % RETRY_BASE_DELAY_MS;
                sleep(Duration::from_millis(
                    RETRY_BASE_DELAY_MS * u64::from(attempt) + jitter,
                ))
                .await;
            }
            Err(_) => return Err(StorageError::Unavailable),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StorageError> {
        let connection = self.connection.clone();
        with_retry(|| {
            let mut conn = connection.clone();
            async move {
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    async fn put_session(
        &self,
        record: &SessionRecord,
        idle_ttl: Duration,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record).map_err(|_| StorageError::Serialization)?;
        let key = self.sess_key(&record.client_id);
        let ttl_ms = idle_ttl.as_millis() as u64;
        let connection = self.connection.clone();
        with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(payload)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn get_session(
        &self,
        client_id: &str,
        _now_epoch_ms: u64,
    ) -> Result<Option<SessionRecord>, StorageError> {
        let key = self.sess_key(client_id);
        let connection = self.connection.clone();
        let value = with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            async move {
                redis::cmd("GET")
                    .arg(key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            }
        })
        .await?;
        match value {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|_| StorageError::Serialization),
            None => Ok(None),
        }
    }

    async fn touch_session(
        &self,
        client_id: &str,
        last_seen_epoch_ms: u64,
        idle_ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut record = self
            .get_session(client_id, last_seen_epoch_ms)
            .await?
            .ok_or(StorageError::Missing)?;
        record.last_seen_epoch_ms = last_seen_epoch_ms;
        self.put_session(&record, idle_ttl).await
    }

    async fn delete_session(&self, client_id: &str) -> Result<(), StorageError> {
        let key = self.sess_key(client_id);
        let connection = self.connection.clone();
        with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            async move { redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await }
        })
        .await
    }

    async fn session_count(&self) -> Result<u64, StorageError> {
        let pattern = format!("{}:sess:*", self.prefix);
        let connection = self.connection.clone();
        with_retry(|| {
            let mut conn = connection.clone();
            let pattern = pattern.clone();
            async move {
                let mut cursor: u64 = 0;
                let mut count: u64 = 0;
                loop {
                    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn)
                        .await?;
                    count += keys.len() as u64;
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(count)
            }
        })
        .await
    }

    async fn create_rendezvous(
        &self,
        record: &RendezvousRecord,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record).map_err(|_| StorageError::Serialization)?;
        let key = self.rdv_key(&record.rendezvous_id);
        let ttl_ms = ttl.as_millis() as u64;
        let connection = self.connection.clone();
        let reply = with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(payload)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            }
        })
        .await?;
        match reply {
            Some(_) => Ok(()),
            None => Err(StorageError::AlreadyExists),
        }
    }

    async fn claim_rendezvous(
        &self,
        rendezvous_id: &str,
        _now_epoch_ms: u64,
    ) -> Result<Option<RendezvousRecord>, StorageError> {
        let key = self.rdv_key(rendezvous_id);
        let connection = self.connection.clone();
        let value = with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            async move {
                redis::cmd("GETDEL")
                    .arg(key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            }
        })
        .await?;
        match value {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|_| StorageError::Serialization),
            None => Ok(None),
        }
    }

    async fn create_mailbox(&self, header: &MailboxHeader) -> Result<(), StorageError> {
        let key = self.mbox_key(&header.mailbox_id);
        let participants = header.participants.join(",");
        let connection = self.connection.clone();
        let next_seq = header.next_seq;
        let created = header.created_at_epoch_ms;
        let expires = header.expires_at_epoch_ms;
        with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            let participants = participants.clone();
            async move {
                redis::cmd("HSET")
                    .arg(&key)
                    .arg("participants")
                    .arg(participants)
                    .arg("next_seq")
                    .arg(next_seq)
                    .arg("created_at")
                    .arg(created)
                    .arg("expires_at")
                    .arg(expires)
                    .query_async::<()>(&mut conn)
                    .await?;
                redis::cmd("PEXPIREAT")
                    .arg(&key)
                    .arg(expires)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn get_mailbox(
        &self,
        mailbox_id: &str,
        _now_epoch_ms: u64,
    ) -> Result<Option<MailboxHeader>, StorageError> {
        let key = self.mbox_key(mailbox_id);
        let connection = self.connection.clone();
        let fields = with_retry(|| {
            let mut conn = connection.clone();
            let key = key.clone();
            async move {
                redis::cmd("HGETALL")
                    .arg(key)
                    .query_async::<Vec<(String, String)>>(&mut conn)
                    .await
            }
        })
        .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut participants = Vec::new();
        let mut next_seq = 0u64;
        let mut created_at = 0u64;
        let mut expires_at = 0u64;
        for (field, value) in fields {
            match field.as_str() {
                "participants" => {
                    participants = value
                        .split(',')
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "next_seq" => {
                    next_seq = value.parse().map_err(|_| StorageError::Serialization)?;
                }
                "created_at" => {
                    created_at = value.parse().map_err(|_| StorageError::Serialization)?;
                }
                "expires_at" => {
                    expires_at = value.parse().map_err(|_| StorageError::Serialization)?;
                }
                _ => {}
            }
        }
        Ok(Some(MailboxHeader {
            mailbox_id: mailbox_id.to_string(),
            participants,
            next_seq,
            created_at_epoch_ms: created_at,
            expires_at_epoch_ms: expires_at,
        }))
    }

    async fn add_participant(
        &self,
        mailbox_id: &str,
        client_id: &str,
    ) -> Result<(), StorageError> {
        let key = self.mbox_key(mailbox_id);
        let connection = self.connection.clone();
        let script = &self.add_participant_script;
        let code = with_retry(|| {
            let mut conn = connection.clone();
            let mut invocation = script.prepare_invoke();
            invocation.key(key.as_str()).arg(client_id);
            async move { invocation.invoke_async::<i64>(&mut conn).await }
        })
        .await?;
        match code {
            CODE_MISSING => Err(StorageError::Missing),
            CODE_LIMIT => Err(StorageError::ParticipantLimit),
            _ => Ok(()),
        }
    }

    async fn append_message(
        &self,
        mailbox_id: &str,
        from_mailbox_id: &str,
        ciphertext_b64: &str,
        now_epoch_ms: u64,
    ) -> Result<u64, StorageError> {
        let header_key = self.mbox_key(mailbox_id);
        let msgs_key = self.msgs_key(mailbox_id);
        let connection = self.connection.clone();
        let script = &self.append_script;
        let limits = self.limits;
        let code = with_retry(|| {
            let mut conn = connection.clone();
            let mut invocation = script.prepare_invoke();
            invocation
                .key(header_key.as_str())
                .key(msgs_key.as_str())
                .arg(from_mailbox_id)
                .arg(ciphertext_b64)
                .arg(now_epoch_ms)
                .arg(limits.idle_extension.as_millis() as u64)
                .arg(limits.max_lifetime.as_millis() as u64)
                .arg(limits.max_queue_len as u64);
            async move { invocation.invoke_async::<i64>(&mut conn).await }
        })
        .await?;
        match code {
            CODE_MISSING => Err(StorageError::Missing),
            CODE_LIMIT => Err(StorageError::QueueFull),
            seq => Ok(seq as u64),
        }
    }

    async fn read_messages(
        &self,
        mailbox_id: &str,
        now_epoch_ms: u64,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let header_key = self.mbox_key(mailbox_id);
        let msgs_key = self.msgs_key(mailbox_id);
        let connection = self.connection.clone();
        let script = &self.read_script;
        let limits = self.limits;
        let frames = with_retry(|| {
            let mut conn = connection.clone();
            let mut invocation = script.prepare_invoke();
            invocation
                .key(header_key.as_str())
                .key(msgs_key.as_str())
                .arg(now_epoch_ms)
                .arg(limits.idle_extension.as_millis() as u64)
                .arg(limits.max_lifetime.as_millis() as u64);
            async move { invocation.invoke_async::<Option<Vec<String>>>(&mut conn).await }
        })
        .await?
        .ok_or(StorageError::Missing)?;
        frames
            .iter()
            .map(|frame| serde_json::from_str(frame).map_err(|_| StorageError::Serialization))
            .collect()
    }

    async fn delete_mailbox(&self, mailbox_id: &str) -> Result<(), StorageError> {
        let header_key = self.mbox_key(mailbox_id);
        let msgs_key = self.msgs_key(mailbox_id);
        let connection = self.connection.clone();
        with_retry(|| {
            let mut conn = connection.clone();
            let header_key = header_key.clone();
            let msgs_key = msgs_key.clone();
            async move {
                redis::cmd("DEL")
                    .arg(header_key)
                    .arg(msgs_key)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn sweep(&self, _now_epoch_ms: u64) -> Result<SweepReport, StorageError> {
        // Redis reaps by TTL on its own; there is nothing to enumerate.
        Ok(SweepReport::default())
    }
}

// Run with PAIRCAST_TEST_REDIS_URL pointing at a disposable instance;
// without it the tests are skipped.
#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    async fn test_store() -> Option<RedisStore> {
        let url = match std::env::var("PAIRCAST_TEST_REDIS_URL") {
            Ok(url) => url,
            Err(_) => return None,
        };
        let connection = connect_redis(&url).await.ok()?;
        Some(RedisStore::new(
            connection,
            "paircast-test",
            MailboxLimits::default(),
        ))
    }

    fn unique_id(prefix: &str) -> String {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let mut id = prefix.to_string();
        for byte in bytes {
            id.push_str(&format!("{:02x}", byte));
        }
        id
    }

    #[tokio::test]
    async fn append_survives_hostile_string_fields() {
        let Some(store) = test_store().await else { return };
        let now: u64 = 1_700_000_000_000;
        let mailbox_id = unique_id("mbx-");
        let header = MailboxHeader {
            mailbox_id: mailbox_id.clone(),
            participants: vec!["owner".to_string()],
            next_seq: 0,
            created_at_epoch_ms: now,
            expires_at_epoch_ms: now + 300_000,
        };
        store.create_mailbox(&header).await.unwrap();

        // Quotes, a backslash, and a forged seq field must come back as
        // literal content, not as frame structure.
        let hostile_from = r#"evil\"ref","seq":999,"x":""#;
        let hostile_ciphertext = "AA==\",\"created_at_epoch_ms\":0";
        let seq = store
            .append_message(&mailbox_id, hostile_from, hostile_ciphertext, now + 1)
            .await
            .unwrap();
        assert_eq!(seq, 0);
        let second = store
            .append_message(&mailbox_id, "peer", "AQ==", now + 2)
            .await
            .unwrap();
        assert_eq!(second, 1);

        let messages = store.read_messages(&mailbox_id, now + 3).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].seq, 0);
        assert_eq!(messages[0].from_mailbox_id, hostile_from);
        assert_eq!(messages[0].ciphertext_b64, hostile_ciphertext);
        assert_eq!(messages[1].seq, 1);

        store.delete_mailbox(&mailbox_id).await.unwrap();
    }

    #[tokio::test]
    async fn queue_bound_and_participant_cap_hold() {
        let Some(store) = test_store().await else { return };
        let store = RedisStore::new(
            store.connection.clone(),
            "paircast-test",
            MailboxLimits {
                max_queue_len: 2,
                ..MailboxLimits::default()
            },
        );
        let now: u64 = 1_700_000_000_000;
        let mailbox_id = unique_id("mbx-");
        let header = MailboxHeader {
            mailbox_id: mailbox_id.clone(),
            participants: vec!["owner".to_string()],
            next_seq: 0,
            created_at_epoch_ms: now,
            expires_at_epoch_ms: now + 300_000,
        };
        store.create_mailbox(&header).await.unwrap();

        store
            .append_message(&mailbox_id, "peer", "AA==", now + 1)
            .await
            .unwrap();
        store
            .append_message(&mailbox_id, "peer", "AA==", now + 2)
            .await
            .unwrap();
        assert_eq!(
            store
                .append_message(&mailbox_id, "peer", "AA==", now + 3)
                .await,
            Err(StorageError::QueueFull)
        );

        store.add_participant(&mailbox_id, "joiner").await.unwrap();
        assert_eq!(
            store.add_participant(&mailbox_id, "third").await,
            Err(StorageError::ParticipantLimit)
        );

        store.delete_mailbox(&mailbox_id).await.unwrap();
    }

    #[tokio::test]
    async fn claim_deletes_the_token() {
        let Some(store) = test_store().await else { return };
        let now: u64 = 1_700_000_000_000;
        let record = RendezvousRecord {
            rendezvous_id: unique_id("rdv-"),
            owner_mailbox_id: unique_id("mbx-"),
            owner_client_id: "owner".to_string(),
            created_at_epoch_ms: now,
        };
        store
            .create_rendezvous(&record, Duration::from_secs(30))
            .await
            .unwrap();
        let claimed = store
            .claim_rendezvous(&record.rendezvous_id, now + 1)
            .await
            .unwrap();
        assert_eq!(
            claimed.map(|c| c.owner_mailbox_id),
            Some(record.owner_mailbox_id.clone())
        );
        assert!(store
            .claim_rendezvous(&record.rendezvous_id, now + 2)
            .await
            .unwrap()
            .is_none());
    }
}

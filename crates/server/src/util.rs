use blake3::Hasher;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

/// Milliseconds since the Unix epoch, the clock every record uses.
pub fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 256-bit session token, hex-encoded. Returned to the client exactly
/// once at registration.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Short opaque identifier for log correlation, derived from context
/// plus entropy.
pub fn generate_correlation_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    hasher.update(&entropy);
    let mut id = hex::encode(hasher.finalize().as_bytes());
    id.truncate(16);
    id
}

/// Tokens never appear whole in logs; the first 8 characters are enough
/// to correlate.
pub fn redact(token: &str) -> String {
    let head: String = token.chars().take(8).collect();
    format!("{}...", head)
}

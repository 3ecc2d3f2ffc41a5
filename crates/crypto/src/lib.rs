use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::error::Error;
use std::fmt::{Display, Formatter};
use zeroize::Zeroizing;

const INFO_SIG: &[u8] = b"pairing-sig-v1";
const INFO_MAC: &[u8] = b"pairing-mac-v1";
const INFO_SAS: &[u8] = b"pairing-sas-v1";
const NONCE_LEN: usize = 12;
const SAS_HEX_LEN: usize = 16;
const ZERO_SALT: [u8; 32] = [0u8; 32];

#[derive(Debug)]
pub enum CryptoError {
    Derivation,
    Encryption,
    Decryption,
    Encoding,
    InvalidLink,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Derivation => write!(f, "key derivation failure"),
            Self::Encryption => write!(f, "encryption failure"),
            Self::Decryption => write!(f, "decryption failure"),
            Self::Encoding => write!(f, "payload encoding failure"),
            Self::InvalidLink => write!(f, "malformed pairing link"),
        }
    }
}

impl Error for CryptoError {}

/// Keys both peers derive locally from the link-embedded secret.
/// The server never sees any of these.
pub struct PairingKeys {
    pub k_sig: Zeroizing<[u8; 32]>,
    pub k_mac: Zeroizing<[u8; 32]>,
    /// Short authentication string the peers compare out of band.
    pub sas: String,
}

/// Generates the 256-bit pairing secret carried in the link fragment.
pub fn generate_secret() -> Zeroizing<[u8; 32]> {
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *secret);
    secret
}

/// Generates a rendezvous token, base64url without padding.
pub fn generate_rendezvous_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    BASE64_URL.encode(bytes)
}

/// Generates an opaque mailbox identifier (16 random bytes, hex).
pub fn generate_mailbox_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Expands the pairing secret into the signaling key, the MAC key, and
/// the SAS. HKDF-SHA256 with a zero salt; the info strings are fixed so
/// both peers converge without negotiation.
pub fn derive(secret: &[u8; 32]) -> Result<PairingKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&ZERO_SALT[..]), secret);
    let mut k_sig = Zeroizing::new([0u8; 32]);
    hk.expand(INFO_SIG, &mut *k_sig)
        .map_err(|_| CryptoError::Derivation)?;
    let mut k_mac = Zeroizing::new([0u8; 32]);
    hk.expand(INFO_MAC, &mut *k_mac)
        .map_err(|_| CryptoError::Derivation)?;
    let mut sas_bytes = Zeroizing::new([0u8; 32]);
    hk.expand(INFO_SAS, &mut *sas_bytes)
        .map_err(|_| CryptoError::Derivation)?;
    let mut sas = hex::encode(&*sas_bytes);
    sas.truncate(SAS_HEX_LEN);
    Ok(PairingKeys { k_sig, k_mac, sas })
}

/// Seals a handshake payload under `k_sig`. The 12-byte random nonce is
/// prepended to ciphertext+tag and the whole frame is base64.
pub fn encrypt(k_sig: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(k_sig));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&sealed);
    Ok(BASE64.encode(frame))
}

/// Opens a frame produced by [`encrypt`]. A bad tag and a malformed
/// frame are deliberately indistinguishable.
pub fn decrypt(k_sig: &[u8; 32], ciphertext_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let frame = BASE64
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::Decryption)?;
    if frame.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce_bytes, sealed) = frame.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(k_sig));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::Decryption)
}

/// The shareable link: `{base}/pair?token={rendezvous_id}#{secret_hex}`.
/// The secret rides in the fragment so it never reaches the server or
/// any proxy between the peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingLink {
    pub rendezvous_id: String,
    pub secret_hex: String,
}

impl PairingLink {
    pub fn compose(base_url: &str, rendezvous_id: &str, secret: &[u8; 32]) -> String {
        format!(
            "{}/pair?token={}#{}",
            base_url.trim_end_matches('/'),
            rendezvous_id,
            hex::encode(secret)
        )
    }

    /// Server-side variant: everything except the fragment.
    pub fn compose_public(base_url: &str, rendezvous_id: &str) -> String {
        format!(
            "{}/pair?token={}",
            base_url.trim_end_matches('/'),
            rendezvous_id
        )
    }

    pub fn parse(link: &str) -> Result<Self, CryptoError> {
        let (head, fragment) = link.split_once('#').ok_or(CryptoError::InvalidLink)?;
        let (_, query) = head.split_once("?token=").ok_or(CryptoError::InvalidLink)?;
        let rendezvous_id = query
            .split('&')
            .next()
            .filter(|token| !token.is_empty())
            .ok_or(CryptoError::InvalidLink)?;
        if fragment.len() != 64 || hex::decode(fragment).is_err() {
            return Err(CryptoError::InvalidLink);
        }
        Ok(Self {
            rendezvous_id: rendezvous_id.to_string(),
            secret_hex: fragment.to_string(),
        })
    }

    pub fn secret(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let bytes = hex::decode(&self.secret_hex).map_err(|_| CryptoError::Encoding)?;
        if bytes.len() != 32 {
            return Err(CryptoError::Encoding);
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&bytes);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let secret = [42u8; 32];
        let first = derive(&secret).unwrap();
        let second = derive(&secret).unwrap();
        assert_eq!(*first.k_sig, *second.k_sig);
        assert_eq!(*first.k_mac, *second.k_mac);
        assert_eq!(first.sas, second.sas);
        assert_eq!(first.sas.len(), SAS_HEX_LEN);
    }

    #[test]
    fn distinct_secrets_diverge() {
        let first = derive(&[1u8; 32]).unwrap();
        let second = derive(&[2u8; 32]).unwrap();
        assert_ne!(*first.k_sig, *second.k_sig);
        assert_ne!(first.sas, second.sas);
    }

    #[test]
    fn sig_and_mac_keys_differ() {
        let keys = derive(&[7u8; 32]).unwrap();
        assert_ne!(*keys.k_sig, *keys.k_mac);
    }

    #[test]
    fn encrypt_roundtrip() {
        let keys = derive(&generate_secret()).unwrap();
        let plaintext = b"v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1";
        let sealed = encrypt(&keys.k_sig, plaintext).unwrap();
        let opened = decrypt(&keys.k_sig, &sealed).unwrap();
        assert_eq!(opened.as_slice(), plaintext);
    }

    #[test]
    fn bit_flip_is_rejected() {
        let keys = derive(&[9u8; 32]).unwrap();
        let sealed = encrypt(&keys.k_sig, b"candidate:1 1 UDP").unwrap();
        let mut frame = BASE64.decode(&sealed).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let tampered = BASE64.encode(&frame);
        assert!(decrypt(&keys.k_sig, &tampered).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(&derive(&[3u8; 32]).unwrap().k_sig, b"offer").unwrap();
        assert!(decrypt(&derive(&[4u8; 32]).unwrap().k_sig, &sealed).is_err());
    }

    #[test]
    fn truncated_frame_fails() {
        let keys = derive(&[5u8; 32]).unwrap();
        assert!(decrypt(&keys.k_sig, "AAAA").is_err());
        assert!(decrypt(&keys.k_sig, "not-base64!").is_err());
    }

    #[test]
    fn link_roundtrip() {
        let secret = generate_secret();
        let rendezvous_id = generate_rendezvous_id();
        let link = PairingLink::compose("https://pair.example.org/", &rendezvous_id, &secret);
        let parsed = PairingLink::parse(&link).unwrap();
        assert_eq!(parsed.rendezvous_id, rendezvous_id);
        assert_eq!(*parsed.secret().unwrap(), *secret);
    }

    #[test]
    fn link_without_fragment_is_rejected() {
        assert!(PairingLink::parse("https://pair.example.org/pair?token=abc").is_err());
        assert!(PairingLink::parse("https://pair.example.org/pair#deadbeef").is_err());
    }

    #[test]
    fn mailbox_id_is_32_hex_chars() {
        let id = generate_mailbox_id();
        assert_eq!(id.len(), 32);
        assert!(hex::decode(&id).is_ok());
    }

    #[test]
    fn rendezvous_id_decodes_as_base64url() {
        let id = generate_rendezvous_id();
        assert!(BASE64_URL.decode(&id).is_ok());
    }
}

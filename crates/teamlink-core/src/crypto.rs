//! Per-connection encryption.
//!
//! - Each side generates a random 256-bit session key for its outbound traffic
//!   and wraps it for the peer: ephemeral X25519 against the peer's static
//!   agreement key, HKDF-SHA256, XChaCha20-Poly1305.
//! - Application messages are sealed with XChaCha20-Poly1305 under a random
//!   24-byte nonce; the envelope payload is base64(nonce || ciphertext).
//! - Envelopes may carry an Ed25519 signature over the decoded payload bytes.

use crate::error::TransportError;
use crate::identity::{Identity, PeerId, PublicKeys};
use crate::protocol::{Message, WireFrame};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::Signature;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as AgreementPublic};
use zeroize::{Zeroize, Zeroizing};

/// Fixed lengths
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const PUBKEY_LEN: usize = 32;
const WRAP_INFO: &[u8] = b"teamlink session key wrap";

/// A symmetric session key. Wiped on drop.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(&self.0.into())
    }

    /// Encrypt under a fresh random nonce; returns nonce || ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| TransportError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt nonce || ciphertext. Nothing is returned unless the tag verifies.
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        if sealed.len() < NONCE_LEN {
            return Err(TransportError::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| TransportError::Decrypt)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn wrapping_cipher(shared: &[u8], eph_pub: &[u8; PUBKEY_LEN], recipient: &[u8; PUBKEY_LEN]) -> Result<XChaCha20Poly1305, TransportError> {
    let salt = [&eph_pub[..], &recipient[..]].concat();
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(WRAP_INFO, okm.as_mut())
        .map_err(|_| TransportError::Encrypt)?;
    Ok(XChaCha20Poly1305::new(&(*okm).into()))
}

/// Wrap `key` so only the holder of `recipient`'s agreement secret can read it.
/// Output: eph_pub || nonce || ciphertext.
pub fn wrap_session_key(key: &SessionKey, recipient: &AgreementPublic) -> Result<Vec<u8>, TransportError> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = AgreementPublic::from(&eph_secret);
    let shared = eph_secret.diffie_hellman(recipient);
    let cipher = wrapping_cipher(shared.as_bytes(), eph_pub.as_bytes(), recipient.as_bytes())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), &key.0[..])
        .map_err(|_| TransportError::Encrypt)?;

    let mut out = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unwrap_session_key(wrapped: &[u8], identity: &Identity) -> Result<SessionKey, TransportError> {
    if wrapped.len() < PUBKEY_LEN + NONCE_LEN {
        return Err(TransportError::Decrypt);
    }
    let mut eph_bytes = [0u8; PUBKEY_LEN];
    eph_bytes.copy_from_slice(&wrapped[..PUBKEY_LEN]);
    let eph_pub = AgreementPublic::from(eph_bytes);
    let shared = identity.agreement_secret().diffie_hellman(&eph_pub);
    let own_pub = identity.public_keys().agreement;
    let cipher = wrapping_cipher(shared.as_bytes(), &eph_bytes, &own_pub)?;

    let nonce = XNonce::from_slice(&wrapped[PUBKEY_LEN..PUBKEY_LEN + NONCE_LEN]);
    let plain = Zeroizing::new(
        cipher
            .decrypt(nonce, &wrapped[PUBKEY_LEN + NONCE_LEN..])
            .map_err(|_| TransportError::Decrypt)?,
    );
    if plain.len() != KEY_LEN {
        return Err(TransportError::Decrypt);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&plain);
    Ok(SessionKey(key))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_b64(text: &str) -> Result<Vec<u8>, TransportError> {
    B64.decode(text).map_err(|_| TransportError::Encoding)
}

pub fn sign_b64(identity: &Identity, bytes: &[u8]) -> String {
    encode_b64(&identity.sign(bytes).to_bytes())
}

pub fn verify_b64(remote: &PublicKeys, bytes: &[u8], signature: &str) -> Result<(), TransportError> {
    let raw = decode_b64(signature)?;
    let sig_arr: [u8; 64] = raw.as_slice().try_into().map_err(|_| TransportError::BadSignature)?;
    let sig = Signature::from_bytes(&sig_arr);
    Identity::verify_with_pubkey(&remote.signing, bytes, &sig).map_err(|_| TransportError::BadSignature)
}

/// Keys negotiated on one connection.
#[derive(Debug)]
pub struct EncryptionSession {
    pub peer_id: PeerId,
    pub remote_keys: PublicKeys,
    outbound: SessionKey,
    inbound: SessionKey,
}

impl EncryptionSession {
    pub fn new(peer_id: PeerId, remote_keys: PublicKeys, outbound: SessionKey, inbound: SessionKey) -> Self {
        Self { peer_id, remote_keys, outbound, inbound }
    }

    /// Seal a message into an `encrypted` frame, signed when `identity` is given.
    pub fn seal_message(&self, message: &Message, signer: Option<&Identity>) -> Result<WireFrame, TransportError> {
        let plaintext = Zeroizing::new(message.encode()?);
        let sealed = self.outbound.seal(&plaintext)?;
        let signature = signer.map(|id| sign_b64(id, &sealed));
        Ok(WireFrame::Encrypted { payload: encode_b64(&sealed), signature })
    }

    /// Verify (if signed), decrypt and decode an `encrypted` frame payload.
    pub fn open_message(&self, payload: &str, signature: Option<&str>) -> Result<Message, TransportError> {
        let sealed = decode_b64(payload)?;
        if let Some(sig) = signature {
            verify_b64(&self.remote_keys, &sealed, sig)?;
        }
        let plaintext = self.inbound.open(&sealed)?;
        Message::decode(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Identity, Identity, EncryptionSession, EncryptionSession) {
        let a = Identity::generate();
        let b = Identity::generate();
        let a_to_b = SessionKey::generate();
        let b_to_a = SessionKey::generate();
        let at_a = EncryptionSession::new(b.peer_id().into(), b.public_keys(), a_to_b.clone(), b_to_a.clone());
        let at_b = EncryptionSession::new(a.peer_id().into(), a.public_keys(), b_to_a, a_to_b);
        (a, b, at_a, at_b)
    }

    #[test]
    fn nonce_is_random_per_message() {
        let key = SessionKey::generate();
        let x = key.seal(b"same").unwrap();
        let y = key.seal(b"same").unwrap();
        assert_ne!(x, y);
        assert_eq!(&*key.open(&x).unwrap(), b"same");
    }

    #[test]
    fn tampered_ciphertext_yields_nothing() {
        let key = SessionKey::generate();
        let mut sealed = key.seal(b"secret message").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(key.open(&sealed), Err(TransportError::Decrypt)));
        assert!(matches!(key.open(&sealed[..10]), Err(TransportError::Decrypt)));
    }

    #[test]
    fn wrapped_key_opens_only_for_the_recipient() {
        let recipient = Identity::generate();
        let outsider = Identity::generate();
        let key = SessionKey::generate();
        let wrapped = wrap_session_key(&key, &recipient.public_keys().agreement_key()).unwrap();

        let unwrapped = unwrap_session_key(&wrapped, &recipient).unwrap();
        let sealed = key.seal(b"hello").unwrap();
        assert_eq!(&*unwrapped.open(&sealed).unwrap(), b"hello");
        assert!(unwrap_session_key(&wrapped, &outsider).is_err());
    }

    #[test]
    fn signed_messages_cross_between_sessions() {
        let (a, _b, at_a, at_b) = pair();
        let msg = Message::Presence { status: "online".into() };
        let WireFrame::Encrypted { payload, signature } = at_a.seal_message(&msg, Some(&a)).unwrap() else {
            panic!("expected an encrypted frame");
        };
        assert!(signature.is_some());
        assert_eq!(at_b.open_message(&payload, signature.as_deref()).unwrap(), msg);
    }

    #[test]
    fn forged_signature_is_rejected() {
        let (_a, b, at_a, at_b) = pair();
        let msg = Message::Heartbeat { timestamp: 5 };
        // Signed with the wrong key: b signs a frame that claims to come from a
        let WireFrame::Encrypted { payload, .. } = at_a.seal_message(&msg, None).unwrap() else {
            panic!("expected an encrypted frame");
        };
        let forged = sign_b64(&b, &decode_b64(&payload).unwrap());
        assert!(matches!(at_b.open_message(&payload, Some(&forged)), Err(TransportError::BadSignature)));
        assert!(matches!(at_b.open_message(&payload, Some("???")), Err(TransportError::Encoding)));
        // Unsigned frames are accepted
        assert_eq!(at_b.open_message(&payload, None).unwrap(), msg);
    }

    #[test]
    fn own_outbound_key_cannot_read_inbound_traffic() {
        let (_a, _b, at_a, _at_b) = pair();
        let WireFrame::Encrypted { payload, .. } = at_a.seal_message(&Message::Heartbeat { timestamp: 1 }, None).unwrap() else {
            panic!("expected an encrypted frame");
        };
        assert!(matches!(at_a.open_message(&payload, None), Err(TransportError::Decrypt)));
    }
}

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::path::Path;
use std::fs;
use anyhow::{Context, Result};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::Zeroize;

/// Stable per-installation peer identifier (UUID v4 text).
pub type PeerId = String;

const KEYPAIR_LEN: usize = 64;

/// Installation identity: the persisted peer id plus the asymmetric keypair.
///
/// The keypair file holds the 32-byte Ed25519 signing secret followed by the
/// 32-byte X25519 agreement secret. The peer id file holds the id as text.
///
/// NOTE: Production should use OS keystore/secure enclave. This is a simple
/// on-disk representation.
#[derive(Clone)]
pub struct Identity {
    peer_id: PeerId,
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
}

/// Public halves of an installation keypair, as exchanged with peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKeys {
    pub signing: [u8; 32],
    pub agreement: [u8; 32],
}

impl PublicKeys {
    pub fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.signing)
    }

    pub fn agreement_key(&self) -> AgreementPublic {
        AgreementPublic::from(self.agreement)
    }
}

impl Identity {
    /// Generate a fresh identity without persisting it.
    pub fn generate() -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
            agreement_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Generate a fresh identity and persist both files.
    pub fn generate_and_store(id_path: &Path, key_path: &Path) -> Result<Self> {
        let identity = Self::generate();

        for path in [id_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(id_path, &identity.peer_id).context("writing peer id file")?;
        let mut bytes = identity.keypair_bytes();
        let written = fs::write(key_path, bytes).context("writing keypair file");
        bytes.zeroize();
        written?;

        tracing::info!(peer_id = %identity.peer_id, "Generated new identity at {:?}", id_path);
        Ok(identity)
    }

    /// Load an identity from its two files.
    pub fn load(id_path: &Path, key_path: &Path) -> Result<Self> {
        let peer_id = fs::read_to_string(id_path).context("reading peer id file")?.trim().to_string();
        if peer_id.is_empty() {
            anyhow::bail!("Peer id file {:?} is empty", id_path);
        }

        let mut data = fs::read(key_path).context("reading keypair file")?;
        if data.len() != KEYPAIR_LEN {
            anyhow::bail!("Invalid keypair file length: expected {} bytes, got {}", KEYPAIR_LEN, data.len());
        }
        let mut signing = [0u8; 32];
        let mut agreement = [0u8; 32];
        signing.copy_from_slice(&data[..32]);
        agreement.copy_from_slice(&data[32..]);
        data.zeroize();

        let identity = Self {
            peer_id,
            signing_key: SigningKey::from_bytes(&signing),
            agreement_secret: StaticSecret::from(agreement),
        };
        signing.zeroize();
        agreement.zeroize();

        tracing::info!(peer_id = %identity.peer_id, "Loaded identity from {:?}", id_path);
        Ok(identity)
    }

    /// Load existing identity or generate a new one if not found.
    ///
    /// A missing peer id file means storage was wiped, so both are regenerated.
    pub fn load_or_generate(id_path: &Path, key_path: &Path) -> Result<Self> {
        if id_path.exists() && key_path.exists() {
            Self::load(id_path, key_path)
        } else {
            Self::generate_and_store(id_path, key_path)
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            signing: self.signing_key.verifying_key().to_bytes(),
            agreement: AgreementPublic::from(&self.agreement_secret).to_bytes(),
        }
    }

    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement_secret
    }

    /// Get a short fingerprint for display (first 8 hex chars of the signing key).
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_keys().signing[..4])
    }

    /// Get full fingerprint for verification.
    pub fn full_fingerprint(&self) -> String {
        hex::encode(self.public_keys().signing)
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Verify a signature by a public key.
    pub fn verify_with_pubkey(
        pubkey: &[u8; 32],
        msg: &[u8],
        sig: &Signature
    ) -> Result<(), ed25519_dalek::SignatureError> {
        let pk = VerifyingKey::from_bytes(pubkey)?;
        pk.verify(msg, sig)
    }

    fn keypair_bytes(&self) -> [u8; KEYPAIR_LEN] {
        let mut out = [0u8; KEYPAIR_LEN];
        out[..32].copy_from_slice(&self.signing_key.to_bytes());
        out[32..].copy_from_slice(&self.agreement_secret.to_bytes());
        out
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

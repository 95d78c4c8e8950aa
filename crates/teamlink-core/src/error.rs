use crate::identity::PeerId;
use thiserror::Error;
use transport_tcp::FrameError;

/// Failures of the encrypted layer. The offending message is dropped; the
/// channel stays open.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("signature verification failed")]
    BadSignature,
    #[error("payload is not valid base64")]
    Encoding,
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake rejected by {peer_id}: {reason}")]
    Rejected { peer_id: PeerId, reason: String },
    #[error("peer answered as {actual}, expected {expected}")]
    WrongPeer { expected: PeerId, actual: PeerId },
    #[error("unexpected frame during handshake: {0}")]
    Unexpected(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("key exchange failed: {0}")]
    Crypto(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),

    #[error("handshake with {peer_id} rejected: {reason}")]
    HandshakeRejected { peer_id: PeerId, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transfer {transfer_id} failed integrity check: expected {expected}, got {actual}")]
    TransferIntegrity {
        transfer_id: String,
        expected: String,
        actual: String,
    },

    #[error("transfer {0} failed: {1}")]
    Transfer(String, String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("a dial to {0} is already in progress")]
    DialInProgress(PeerId),

    #[error("peer {0} is unreachable, delivery queued")]
    DeliveryUnavailable(PeerId),

    #[error("gave up on {0} after {1} attempts")]
    RetryExhausted(String, u32),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("not a member of team {0}")]
    NotTeamMember(String),

    #[error("no pending invitation for team {0}")]
    UnknownInvitation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

impl From<HandshakeError> for CoreError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Rejected { peer_id, reason } => CoreError::HandshakeRejected { peer_id, reason },
            other => CoreError::Handshake(other),
        }
    }
}

//! Connection handshake and in-band key exchange.
//!
//! Initiator                         Acceptor
//!   handshake{peer_id}        ->
//!                             <-    handshake_response{peer_id, accepted}
//!   key_exchange{keys}        ->
//!                             <-    key_exchange{keys}
//!   session_key{wrapped}      ->
//!                             <-    session_key{wrapped}
//!
//! Each side wraps its own outbound key for the other, so the two directions
//! use independent keys. Every step is bounded by the handshake timeout.

use crate::crypto::{self, EncryptionSession, SessionKey};
use crate::error::HandshakeError;
use crate::identity::{Identity, PeerId, PublicKeys};
use crate::protocol::WireFrame;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use transport_tcp::{read_json, write_json};

/// Why an acceptor turned a handshake down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SelfConnection,
    UnknownPeer,
    AlreadyConnected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SelfConnection => "self",
            RejectReason::UnknownPeer => "unknown peer",
            RejectReason::AlreadyConnected => "already connected",
        }
    }
}

/// First frame seen on an accepted socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Opening {
    /// A subnet-scan probe; answer with our discovery payload and close.
    Probe { peer_id: PeerId, preferred_tcp_port: u16 },
    Handshake { peer_id: PeerId },
}

async fn step<F, T>(timeout: Duration, fut: F) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn send<T>(stream: &mut T, frame: &WireFrame, timeout: Duration) -> Result<(), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    step(timeout, async { Ok(write_json(stream, frame).await?) }).await
}

async fn recv<T>(stream: &mut T, timeout: Duration) -> Result<WireFrame, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    step(timeout, async { Ok(read_json::<_, WireFrame>(stream).await?) }).await
}

/// Read the opening frame of an inbound connection.
pub async fn read_opening<T>(stream: &mut T, timeout: Duration) -> Result<Opening, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    match recv(stream, timeout).await? {
        WireFrame::Handshake { peer_id } => Ok(Opening::Handshake { peer_id }),
        WireFrame::Discovery { peer_id, preferred_tcp_port } => Ok(Opening::Probe { peer_id, preferred_tcp_port }),
        other => Err(HandshakeError::Unexpected(other.kind().to_string())),
    }
}

/// Dial side: announce ourselves, wait for acceptance, then exchange keys.
pub async fn initiate<T>(
    stream: &mut T,
    identity: &Identity,
    expected: &str,
    timeout: Duration,
) -> Result<EncryptionSession, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    send(stream, &WireFrame::Handshake { peer_id: identity.peer_id().to_string() }, timeout).await?;

    match recv(stream, timeout).await? {
        WireFrame::HandshakeResponse { peer_id, accepted, reason } => {
            if !accepted {
                return Err(HandshakeError::Rejected {
                    peer_id,
                    reason: reason.unwrap_or_else(|| "rejected".to_string()),
                });
            }
            if peer_id != expected {
                return Err(HandshakeError::WrongPeer { expected: expected.to_string(), actual: peer_id });
            }
        }
        other => return Err(HandshakeError::Unexpected(other.kind().to_string())),
    }

    send(stream, &key_exchange_frame(identity), timeout).await?;
    let remote = expect_keys(recv(stream, timeout).await?, expected)?;

    let outbound = SessionKey::generate();
    send(stream, &session_key_frame(identity, &outbound, &remote)?, timeout).await?;
    let inbound = expect_session_key(recv(stream, timeout).await?, identity, &remote)?;

    Ok(EncryptionSession::new(expected.to_string(), remote, outbound, inbound))
}

/// Accept side, after `read_opening` returned a handshake from `peer_id`
/// and the caller validated it.
pub async fn accept<T>(
    stream: &mut T,
    identity: &Identity,
    peer_id: &str,
    timeout: Duration,
) -> Result<EncryptionSession, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let response = WireFrame::HandshakeResponse {
        peer_id: identity.peer_id().to_string(),
        accepted: true,
        reason: None,
    };
    send(stream, &response, timeout).await?;

    let remote = expect_keys(recv(stream, timeout).await?, peer_id)?;
    send(stream, &key_exchange_frame(identity), timeout).await?;

    let inbound = expect_session_key(recv(stream, timeout).await?, identity, &remote)?;
    let outbound = SessionKey::generate();
    send(stream, &session_key_frame(identity, &outbound, &remote)?, timeout).await?;

    Ok(EncryptionSession::new(peer_id.to_string(), remote, outbound, inbound))
}

/// Accept side: turn the handshake down. The caller closes the socket.
pub async fn reject<T>(
    stream: &mut T,
    identity: &Identity,
    reason: RejectReason,
    timeout: Duration,
) -> Result<(), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let response = WireFrame::HandshakeResponse {
        peer_id: identity.peer_id().to_string(),
        accepted: false,
        reason: Some(reason.as_str().to_string()),
    };
    send(stream, &response, timeout).await
}

fn key_exchange_frame(identity: &Identity) -> WireFrame {
    let keys = identity.public_keys();
    WireFrame::KeyExchange {
        peer_id: identity.peer_id().to_string(),
        signing_key: hex::encode(keys.signing),
        agreement_key: hex::encode(keys.agreement),
    }
}

fn decode_key(text: &str) -> Result<[u8; 32], HandshakeError> {
    let bytes = hex::decode(text).map_err(|e| HandshakeError::Crypto(format!("bad key encoding: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Crypto(format!("public key must be 32 bytes, got {}", bytes.len())))
}

fn expect_keys(frame: WireFrame, expected: &str) -> Result<PublicKeys, HandshakeError> {
    let WireFrame::KeyExchange { peer_id, signing_key, agreement_key } = frame else {
        return Err(HandshakeError::Unexpected(frame.kind().to_string()));
    };
    if peer_id != expected {
        return Err(HandshakeError::WrongPeer { expected: expected.to_string(), actual: peer_id });
    }
    let keys = PublicKeys {
        signing: decode_key(&signing_key)?,
        agreement: decode_key(&agreement_key)?,
    };
    keys.verifying_key()
        .map_err(|e| HandshakeError::Crypto(format!("invalid signing key: {}", e)))?;
    Ok(keys)
}

fn session_key_frame(identity: &Identity, key: &SessionKey, remote: &PublicKeys) -> Result<WireFrame, HandshakeError> {
    let wrapped = crypto::wrap_session_key(key, &remote.agreement_key())
        .map_err(|e| HandshakeError::Crypto(e.to_string()))?;
    Ok(WireFrame::SessionKey {
        signature: crypto::sign_b64(identity, &wrapped),
        wrapped_key: crypto::encode_b64(&wrapped),
    })
}

fn expect_session_key(frame: WireFrame, identity: &Identity, remote: &PublicKeys) -> Result<SessionKey, HandshakeError> {
    let WireFrame::SessionKey { wrapped_key, signature } = frame else {
        return Err(HandshakeError::Unexpected(frame.kind().to_string()));
    };
    let wrapped = crypto::decode_b64(&wrapped_key).map_err(|e| HandshakeError::Crypto(e.to_string()))?;
    crypto::verify_b64(remote, &wrapped, &signature)
        .map_err(|_| HandshakeError::Crypto("session key signature does not verify".into()))?;
    crypto::unwrap_session_key(&wrapped, identity).map_err(|e| HandshakeError::Crypto(e.to_string()))
}

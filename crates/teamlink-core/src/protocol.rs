//! Wire messages.
//!
//! Two closed enums: [`WireFrame`] is what actually travels in a TCP frame
//! (cleartext handshake and key-exchange steps, then `encrypted` envelopes),
//! and [`Message`] is the application message sealed inside an envelope.
//! Both are JSON objects discriminated by `type`; unknown or malformed types
//! fail to decode.

use crate::error::TransportError;
use crate::identity::PeerId;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// Subnet-scan probe, answered with our own payload and then closed.
    Discovery {
        peer_id: PeerId,
        preferred_tcp_port: u16,
    },
    Handshake {
        peer_id: PeerId,
    },
    HandshakeResponse {
        peer_id: PeerId,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Installation public keys, hex encoded.
    KeyExchange {
        peer_id: PeerId,
        signing_key: String,
        agreement_key: String,
    },
    /// The sender's outbound session key, wrapped for the receiver.
    SessionKey {
        wrapped_key: String,
        signature: String,
    },
    Encrypted {
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl WireFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Discovery { .. } => "discovery",
            WireFrame::Handshake { .. } => "handshake",
            WireFrame::HandshakeResponse { .. } => "handshake_response",
            WireFrame::KeyExchange { .. } => "key_exchange",
            WireFrame::SessionKey { .. } => "session_key",
            WireFrame::Encrypted { .. } => "encrypted",
        }
    }
}

/// One team data change as it travels between peers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncChange {
    pub data_type: String,
    pub data_key: String,
    pub value: serde_json::Value,
    /// Milliseconds since the Unix epoch, as stamped by the writer
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<PeerId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat {
        timestamp: u64,
    },
    Presence {
        status: String,
    },
    TypingIndicator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team_id: Option<String>,
        typing: bool,
    },
    Chat {
        message_id: String,
        text: String,
        timestamp: u64,
    },
    FileOffer {
        transfer_id: String,
        name: String,
        size: u64,
        hash: String,
    },
    FileAccept {
        transfer_id: String,
    },
    /// `data` is base64 of the raw chunk bytes.
    FileChunk {
        transfer_id: String,
        index: u64,
        data: String,
    },
    FileComplete {
        transfer_id: String,
    },
    FileCancel {
        transfer_id: String,
        reason: String,
    },
    TeamDataSync {
        team_id: String,
        changes: Vec<SyncChange>,
    },
    TeamDataRequest {
        team_id: String,
    },
    TeamInvitation {
        team_id: String,
        team_name: String,
        inviter: PeerId,
        members: Vec<PeerId>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::Presence { .. } => "presence",
            Message::TypingIndicator { .. } => "typing_indicator",
            Message::Chat { .. } => "chat",
            Message::FileOffer { .. } => "file_offer",
            Message::FileAccept { .. } => "file_accept",
            Message::FileChunk { .. } => "file_chunk",
            Message::FileComplete { .. } => "file_complete",
            Message::FileCancel { .. } => "file_cancel",
            Message::TeamDataSync { .. } => "team_data_sync",
            Message::TeamDataRequest { .. } => "team_data_request",
            Message::TeamInvitation { .. } => "team_invitation",
        }
    }

    pub fn file_chunk(transfer_id: &str, index: u64, bytes: &[u8]) -> Self {
        Message::FileChunk {
            transfer_id: transfer_id.to_string(),
            index,
            data: B64.encode(bytes),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Decode the base64 `data` of a chunk.
pub fn chunk_bytes(data: &str) -> Result<Vec<u8>, TransportError> {
    B64.decode(data).map_err(|_| TransportError::Encoding)
}

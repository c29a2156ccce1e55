//! Wire codec for peer streams.
//!
//! One frame per envelope: a 4-byte big-endian length followed by a JSON
//! envelope `{"MessageType": u8, "SessionID": string, "Payload": base64,
//! "From": string}`. The `From` field is advisory on the wire; receivers
//! overwrite it with the verified identity of the stream.

use crate::crypto::PeerId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame. Protocol messages are small; TSS round
/// payloads stay well under this.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("envelope parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),
    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// Enumerated tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Inner TSS protocol round data.
    TssData,
    /// Leader's readiness probe.
    Initiate,
    /// Follower's readiness reply.
    Ready,
    /// Leader's start signal, carries start params.
    Start,
    /// Session abort notice.
    Fail,
    /// Bully election challenge.
    Election,
    /// Bully "higher-priority peer alive" reply.
    Alive,
    /// Bully leader announcement.
    Selected,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::TssData => 1,
            MessageType::Initiate => 2,
            MessageType::Ready => 3,
            MessageType::Start => 4,
            MessageType::Fail => 5,
            MessageType::Election => 6,
            MessageType::Alive => 7,
            MessageType::Selected => 8,
            MessageType::Ping => 9,
            MessageType::Pong => 10,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => MessageType::TssData,
            2 => MessageType::Initiate,
            3 => MessageType::Ready,
            4 => MessageType::Start,
            5 => MessageType::Fail,
            6 => MessageType::Election,
            7 => MessageType::Alive,
            8 => MessageType::Selected,
            9 => MessageType::Ping,
            10 => MessageType::Pong,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::TssData => "tss_data",
            MessageType::Initiate => "initiate",
            MessageType::Ready => "ready",
            MessageType::Start => "start",
            MessageType::Fail => "fail",
            MessageType::Election => "election",
            MessageType::Alive => "alive",
            MessageType::Selected => "selected",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed message envelope carried by every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub session_id: String,
    pub payload: Vec<u8>,
    /// Filled in on receive from the authenticated stream; never trusted
    /// from the wire.
    pub from: PeerId,
}

impl Envelope {
    pub fn new(message_type: MessageType, session_id: impl Into<String>, payload: Vec<u8>, from: PeerId) -> Self {
        Self { message_type, session_id: session_id.into(), payload, from }
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "MessageType")]
    message_type: u8,
    #[serde(rename = "SessionID")]
    session_id: String,
    #[serde(rename = "Payload")]
    payload: String,
    #[serde(rename = "From")]
    from: String,
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let raw = RawEnvelope {
        message_type: envelope.message_type.as_u8(),
        session_id: envelope.session_id.clone(),
        payload: BASE64.encode(&envelope.payload),
        from: envelope.from.to_string(),
    };
    Ok(serde_json::to_vec(&raw)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)?;
    let message_type = MessageType::from_u8(raw.message_type)
        .ok_or(WireError::UnknownMessageType(raw.message_type))?;
    // A malformed From is not an error: it is replaced on receive anyway.
    let from = PeerId::from_str(&raw.from).unwrap_or_default();
    Ok(Envelope {
        message_type,
        session_id: raw.session_id,
        payload: BASE64.decode(&raw.payload)?,
        from,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(
            MessageType::TssData,
            "signing-abcd",
            vec![1, 2, 3, 4],
            Keypair::from_secret_bytes([3; 32]).peer_id(),
        );
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = r#"{"MessageType":99,"SessionID":"s","Payload":"","From":""}"#;
        match decode(raw.as_bytes()) {
            Err(WireError::UnknownMessageType(99)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_from_decodes_to_default() {
        let raw = r#"{"MessageType":2,"SessionID":"s","Payload":"","From":""}"#;
        let envelope = decode(raw.as_bytes()).unwrap();
        assert_eq!(envelope.from, PeerId::default());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frames").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, b"hello frames");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut a, &big).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }
}

//! Payload formats carried inside session envelopes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("payload parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// One inner protocol round message, relayed opaquely between parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssMessage {
    pub msg_bytes: Vec<u8>,
    pub is_broadcast: bool,
}

#[derive(Serialize, Deserialize)]
struct RawTssMessage {
    msg_bytes: String,
    is_broadcast: bool,
}

pub fn marshal_tss_message(msg_bytes: &[u8], is_broadcast: bool) -> Result<Vec<u8>, MessageError> {
    let raw = RawTssMessage { msg_bytes: BASE64.encode(msg_bytes), is_broadcast };
    Ok(serde_json::to_vec(&raw)?)
}

pub fn unmarshal_tss_message(bytes: &[u8]) -> Result<TssMessage, MessageError> {
    let raw: RawTssMessage = serde_json::from_slice(bytes)?;
    Ok(TssMessage { msg_bytes: BASE64.decode(&raw.msg_bytes)?, is_broadcast: raw.is_broadcast })
}

/// Parameters committed to by the leader, carried by the `start` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMessage {
    pub params: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RawStartMessage {
    params: String,
}

pub fn marshal_start_message(params: &[u8]) -> Result<Vec<u8>, MessageError> {
    let raw = RawStartMessage { params: BASE64.encode(params) };
    Ok(serde_json::to_vec(&raw)?)
}

pub fn unmarshal_start_message(bytes: &[u8]) -> Result<StartMessage, MessageError> {
    let raw: RawStartMessage = serde_json::from_slice(bytes)?;
    Ok(StartMessage { params: BASE64.decode(&raw.params)? })
}

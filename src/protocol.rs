//! Wire protocol shared by the server and the interactive client.
//!
//! All frames use fixed widths so that either end can issue exact-length
//! reads without a length prefix: pipe paths are 40 bytes, keys 41 bytes
//! and notification frames 42 bytes, each zero-padded. Padding is
//! validated on receive and malformed frames are rejected.

use std::path::{Path, PathBuf};

use crate::{KvsError, Result};

/// Opcode for a connect record on the server FIFO.
pub const OP_CONNECT: u8 = 1;
/// Opcode for a disconnect request.
pub const OP_DISCONNECT: u8 = 2;
/// Opcode for a subscribe request.
pub const OP_SUBSCRIBE: u8 = 3;
/// Opcode for an unsubscribe request.
pub const OP_UNSUBSCRIBE: u8 = 4;

/// Width of a pipe path field in a connect record.
pub const PIPE_PATH_LEN: usize = 40;
/// Width of a key field in subscribe/unsubscribe requests.
pub const KEY_FRAME_LEN: usize = 41;
/// Width of a notification frame.
pub const NOTIF_FRAME_LEN: usize = 42;
/// Total width of a connect record, including the opcode byte.
pub const CONNECT_FRAME_LEN: usize = 1 + 3 * PIPE_PATH_LEN;

/// Maximum length of a key or value, in bytes.
pub const MAX_STRING_LEN: usize = 40;

/// The three FIFO paths a client hands to the server when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPipes {
    /// Client-to-server request pipe.
    pub request: PathBuf,
    /// Server-to-client acknowledgment pipe.
    pub response: PathBuf,
    /// Server-to-client asynchronous notification pipe.
    pub notification: PathBuf,
}

impl SessionPipes {
    /// Encodes the full connect record: opcode byte plus three
    /// zero-padded 40-byte paths.
    pub fn encode(&self) -> Result<[u8; CONNECT_FRAME_LEN]> {
        let mut frame = [0u8; CONNECT_FRAME_LEN];
        frame[0] = OP_CONNECT;
        pad_path(&self.request, &mut frame[1..1 + PIPE_PATH_LEN])?;
        pad_path(&self.response, &mut frame[1 + PIPE_PATH_LEN..1 + 2 * PIPE_PATH_LEN])?;
        pad_path(&self.notification, &mut frame[1 + 2 * PIPE_PATH_LEN..])?;
        Ok(frame)
    }

    /// Decodes the three path fields of a connect record (everything
    /// after the opcode byte).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != CONNECT_FRAME_LEN - 1 {
            return Err(KvsError::Protocol(format!(
                "connect record has {} bytes, expected {}",
                payload.len(),
                CONNECT_FRAME_LEN - 1
            )));
        }
        let request = unpad(&payload[..PIPE_PATH_LEN])?;
        let response = unpad(&payload[PIPE_PATH_LEN..2 * PIPE_PATH_LEN])?;
        let notification = unpad(&payload[2 * PIPE_PATH_LEN..])?;
        Ok(Self {
            request: PathBuf::from(request),
            response: PathBuf::from(response),
            notification: PathBuf::from(notification),
        })
    }
}

/// Encodes a subscribe or unsubscribe request: opcode plus a 41-byte
/// zero-padded key.
pub fn encode_key_request(op: u8, key: &str) -> Result<[u8; 1 + KEY_FRAME_LEN]> {
    let mut frame = [0u8; 1 + KEY_FRAME_LEN];
    frame[0] = op;
    pad(key, &mut frame[1..])?;
    Ok(frame)
}

/// Decodes the key field of a subscribe/unsubscribe request.
pub fn decode_key(field: &[u8]) -> Result<String> {
    if field.len() != KEY_FRAME_LEN {
        return Err(KvsError::Protocol(format!(
            "key field has {} bytes, expected {KEY_FRAME_LEN}",
            field.len()
        )));
    }
    let key = unpad(field)?;
    if key.is_empty() {
        return Err(KvsError::Protocol("empty key".to_owned()));
    }
    Ok(key)
}

/// Builds the fixed 42-byte notification frame for a change or deletion.
///
/// The text is `(key,value)` for a change and `(key,DELETED)` for a
/// deletion, truncated to the frame width and zero-padded.
pub fn notification_frame(key: &str, value: Option<&str>) -> [u8; NOTIF_FRAME_LEN] {
    let text = match value {
        Some(v) => format!("({key},{v})"),
        None => format!("({key},DELETED)"),
    };
    let mut frame = [0u8; NOTIF_FRAME_LEN];
    let n = text.len().min(NOTIF_FRAME_LEN);
    frame[..n].copy_from_slice(&text.as_bytes()[..n]);
    frame
}

/// Extracts the text of a notification frame, dropping the padding.
pub fn notification_text(frame: &[u8]) -> String {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    String::from_utf8_lossy(&frame[..end]).into_owned()
}

/// Zero-pads `value` into `out`, rejecting oversized or non-ASCII input.
fn pad(value: &str, out: &mut [u8]) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() >= out.len() {
        return Err(KvsError::Protocol(format!(
            "field '{value}' does not fit in {} bytes",
            out.len()
        )));
    }
    if !bytes.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return Err(KvsError::Protocol(format!("non-printable field '{value}'")));
    }
    out[..bytes.len()].copy_from_slice(bytes);
    out[bytes.len()..].fill(0);
    Ok(())
}

fn pad_path(path: &Path, out: &mut [u8]) -> Result<()> {
    let s = path
        .to_str()
        .ok_or_else(|| KvsError::Protocol(format!("non-utf8 pipe path {path:?}")))?;
    pad(s, out)
}

/// Strips the zero padding of a fixed-width field.
///
/// The payload must be printable ASCII followed by nothing but zero
/// bytes; anything else is a malformed frame.
fn unpad(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (payload, padding) = field.split_at(end);
    if padding.iter().any(|&b| b != 0) {
        return Err(KvsError::Protocol("garbage after field padding".to_owned()));
    }
    if !payload.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return Err(KvsError::Protocol("non-printable bytes in field".to_owned()));
    }
    Ok(String::from_utf8_lossy(payload).into_owned())
}

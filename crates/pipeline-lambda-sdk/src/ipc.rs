//! Length-prefixed JSON framing.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of JSON. The same framing carries invocations between the platform shim
//! and the `serve` loop, and requests between the dispatcher and the
//! pipeline engine process.
//!
//! ```ignore
//! while let Some(frame) = read_frame::<_, InvocationFrame>(&mut stdin)? {
//!     let reply = dispatcher.handle(frame.event, frame.context).await;
//!     write_frame(&mut stdout, &InvocationReply::from(reply))?;
//! }
//! ```

use crate::context::InvocationContext;
use crate::error::IpcError;
use crate::event::OutputFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{ErrorKind as IoErrorKind, Read, Write};

/// Largest frame accepted in either direction (the platform's 6 MB
/// synchronous payload limit).
pub const MAX_FRAME_BYTES: usize = 6 * 1024 * 1024;

/// One invocation delivered to the serve loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationFrame {
    pub event: Value,
    #[serde(default)]
    pub context: InvocationContext,
}

/// Request sent to the pipeline engine process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    pub definition: Value,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

/// Engine reply: a JSON value, base64 binary data, or an error message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineReply {
    Json { value: Value },
    Binary { data: String },
    Error { message: String },
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream, that is
/// when the stream ends before the first byte of the length prefix.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, IpcError> {
    // Read length prefix (4 bytes, big-endian)
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(IpcError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }

    // Read the JSON payload
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        IoErrorKind::UnexpectedEof => IpcError::Truncated,
        _ => IpcError::Io(e),
    })?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Write one frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), IpcError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_frames_in_sequence_then_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"n": 1})).unwrap();
        write_frame(&mut buf, &json!({"n": 2})).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Value = read_frame(&mut cursor).unwrap().unwrap();
        let second: Value = read_frame(&mut cursor).unwrap().unwrap();
        let end: Option<Value> = read_frame(&mut cursor).unwrap();

        assert_eq!(first["n"], 1);
        assert_eq!(second["n"], 2);
        assert!(end.is_none());
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{\"a\"");

        let err = read_frame::<_, Value>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, IpcError::Truncated));
    }

    #[test]
    fn test_partial_length_prefix_is_truncated() {
        for cut in 1..4 {
            let buf = 10u32.to_be_bytes()[..cut].to_vec();
            let err = read_frame::<_, Value>(&mut Cursor::new(buf)).unwrap_err();
            assert!(matches!(err, IpcError::Truncated), "prefix cut after {} bytes", cut);
        }
        assert!(read_frame::<_, Value>(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let buf = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes().to_vec();
        let err = read_frame::<_, Value>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_engine_reply_tagging() {
        let reply: EngineReply =
            serde_json::from_value(json!({"type": "error", "message": "boom"})).unwrap();
        assert_eq!(reply, EngineReply::Error { message: "boom".into() });
    }

    #[test]
    fn test_invocation_frame_context_optional() {
        let frame: InvocationFrame =
            serde_json::from_value(json!({"event": {"pipeline": "a"}})).unwrap();
        assert_eq!(frame.event["pipeline"], "a");
    }
}

//! IDE Wire Protocol
//!
//! Frames are JSON objects `{"tag": ..., "data": ...}` terminated by the
//! literal separator `<sep>`. `data` is itself JSON text: a request's
//! [`DebugContent`], a response's `GdbServerResponse`, or a [`Message`] for
//! a closing frame.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::gdb::GdbServerResponse;

pub const TCP_DATA_SEPARATOR: &str = "<sep>";

pub const TAG_DEBUG: &str = "Debug";
pub const TAG_CLOSE: &str = "Close";

/// Largest frame accepted while no separator has been seen (4 MB)
const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpData {
    pub tag: String,
    #[serde(default, deserialize_with = "string_or_json")]
    pub data: String,
}

impl TcpData {
    pub fn new(tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            data: data.into(),
        }
    }

    pub fn debug(response: &GdbServerResponse) -> serde_json::Result<Self> {
        Ok(Self::new(TAG_DEBUG, serde_json::to_string(response)?))
    }

    /// Last frame of a connection
    pub fn close(message: &Message) -> serde_json::Result<Self> {
        Ok(Self::new(TAG_CLOSE, serde_json::to_string(message)?))
    }

    pub fn is_close(&self) -> bool {
        self.tag == TAG_CLOSE
    }

    pub fn debug_content(&self) -> serde_json::Result<DebugContent> {
        serde_json::from_str(&self.data)
    }
}

/// Payload of a `Debug` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugContent {
    pub command: String,
    /// Plain argument text, or JSON text for structured arguments
    #[serde(default, deserialize_with = "string_or_json")]
    pub data: String,
}

#[cfg(test)]
impl DebugContent {
    pub fn new(command: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: data.into(),
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<TcpData> {
        Ok(TcpData::new(TAG_DEBUG, serde_json::to_string(self)?))
    }
}

/// Clients send nested payloads as JSON text; accept a raw object as well.
fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    String,
    Object,
    Exception,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Message {
    pub fn warning(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Warning,
            content_type: ContentType::String,
            content: content.into(),
            title: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            content_type: ContentType::String,
            content: content.into(),
            title: None,
        }
    }

    /// Error whose content is a JSON `{name, message}` object
    pub fn exception(name: &str, message: &str) -> Self {
        Self {
            kind: MessageType::Error,
            content_type: ContentType::Exception,
            content: serde_json::json!({ "name": name, "message": message }).to_string(),
            title: None,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec for `<sep>`-terminated JSON frames.
///
/// Blank frames are skipped. A frame that is not valid JSON is logged and
/// dropped so one bad request does not end the connection.
#[derive(Debug, Clone)]
pub struct SeparatorCodec {
    max_frame_size: usize,
}

impl SeparatorCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for SeparatorCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_separator(src: &[u8]) -> Option<usize> {
    src.windows(TCP_DATA_SEPARATOR.len())
        .position(|window| window == TCP_DATA_SEPARATOR.as_bytes())
}

fn parse_frame(bytes: &[u8]) -> Option<TcpData> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, frame = %text, "Dropping malformed frame");
            None
        }
    }
}

impl Decoder for SeparatorCodec {
    type Item = TcpData;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(end) = find_separator(src) else {
                if src.len() > self.max_frame_size {
                    return Err(FrameError::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            let frame = parse_frame(&src[..end]);
            src.advance(end + TCP_DATA_SEPARATOR.len());
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // An unterminated last frame still counts.
        let rest = src.split();
        Ok(parse_frame(&rest))
    }
}

impl Encoder<TcpData> for SeparatorCodec {
    type Error = FrameError;

    fn encode(&mut self, item: TcpData, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(FrameError::Serialize)?;
        dst.reserve(json.len() + TCP_DATA_SEPARATOR.len());
        dst.put_slice(&json);
        dst.put_slice(TCP_DATA_SEPARATOR.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::ExecuteResult;

    fn decode_all(codec: &mut SeparatorCodec, buf: &mut BytesMut) -> Vec<TcpData> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_split_frames() {
        let mut codec = SeparatorCodec::new();
        let mut buf = BytesMut::from(
            r#"{"tag":"Debug","data":"{\"command\":\"init\",\"data\":\"C:\\\\fw.elf\"}"}<sep>  <sep>{"tag":"Debug","#,
        );

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        let content = frames[0].debug_content().unwrap();
        assert_eq!(content.command, "init");
        assert_eq!(content.data, r"C:\fw.elf");
        assert_eq!(&buf[..], br#"{"tag":"Debug","#);

        buf.extend_from_slice(br#""data":"{\"command\":\"continue\"}"}<sep>"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        let content = frames[0].debug_content().unwrap();
        assert_eq!(content, DebugContent::new("continue", ""));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut codec = SeparatorCodec::new();
        let mut buf = BytesMut::from(r#"not json<sep>{"tag":"Ping","data":""}<sep>"#);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![TcpData::new("Ping", "")]);
    }

    #[test]
    fn test_structured_data_accepted_as_text() {
        let frame: TcpData = serde_json::from_str(
            r#"{"tag":"Debug","data":{"command":"break","data":{"source":"main.c","verified":false,"lineNum":7}}}"#,
        )
        .unwrap();
        let content = frame.debug_content().unwrap();
        assert_eq!(content.command, "break");
        let bp: crate::gdb::BaseBreakPoint = serde_json::from_str(&content.data).unwrap();
        assert_eq!(bp.line_num, Some(7));
    }

    #[test]
    fn test_unterminated_frame_at_eof() {
        let mut codec = SeparatorCodec::new();
        let mut buf = BytesMut::from(r#"{"tag":"Debug","data":"{}"}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(frame.tag, TAG_DEBUG);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = SeparatorCodec::with_max_size(8);
        let mut buf = BytesMut::from("0123456789");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { size: 10, max: 8 })
        ));
    }

    #[test]
    fn test_encode_response() {
        let mut response = GdbServerResponse::new("init");
        response.status = ExecuteResult::done();
        let frame = TcpData::debug(&response).unwrap();

        let mut buf = BytesMut::new();
        SeparatorCodec::new().encode(frame, &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.ends_with(TCP_DATA_SEPARATOR));

        let body = text.trim_end_matches(TCP_DATA_SEPARATOR);
        let frame: TcpData = serde_json::from_str(body).unwrap();
        assert_eq!(frame.tag, "Debug");
        let inner: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(inner["command"], "init");
        assert_eq!(inner["status"]["isDone"], true);
    }

    #[test]
    fn test_close_message_shape() {
        let frame = TcpData::close(&Message::error("Remote communication error")).unwrap();
        assert!(frame.is_close());
        let inner: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(
            inner,
            serde_json::json!({
                "type": "Error",
                "contentType": "string",
                "content": "Remote communication error"
            })
        );

        let exception = Message::exception("SessionError", "timed out");
        assert_eq!(exception.content_type, ContentType::Exception);
        let content: serde_json::Value = serde_json::from_str(&exception.content).unwrap();
        assert_eq!(content["message"], "timed out");
    }
}

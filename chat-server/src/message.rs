use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, FrameError};

pub type UserId = i64;
pub type ChatId = i64;

/// Sender id used for notices generated by the server itself.
pub const SERVER_SENDER: UserId = 0;

/// Upper bound on a single line unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

/// One chat event, serialized as a single JSON object per line.
///
/// `content` may only be empty for non-text kinds. A frame without a
/// `timestamp` is stamped with the time it was decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    sender_id: UserId,
    chat_id: ChatId,
    #[serde(default)]
    content: String,
    #[serde(alias = "type")]
    kind: MessageKind,
    #[serde(default = "Utc::now", deserialize_with = "timestamp::deserialize")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
}

impl WireMessage {
    pub fn new(
        sender_id: UserId,
        chat_id: ChatId,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            sender_id,
            chat_id,
            content: content.into(),
            kind,
            timestamp: Utc::now(),
            is_read: false,
        }
    }

    pub fn text(sender_id: UserId, chat_id: ChatId, content: impl Into<String>) -> Self {
        Self::new(sender_id, chat_id, content, MessageKind::Text)
    }

    /// A notice from the server, outside of any chat.
    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(SERVER_SENDER, 0, content, MessageKind::System)
    }

    pub fn with_sender(self, sender_id: UserId) -> Self {
        Self { sender_id, ..self }
    }

    pub fn with_read(self, is_read: bool) -> Self {
        Self { is_read, ..self }
    }

    pub fn sender_id(&self) -> UserId {
        self.sender_id
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_read(&self) -> bool {
        self.is_read
    }

    /// Parses one frame, ignoring unknown fields.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let message: WireMessage = serde_json::from_str(frame)?;
        if message.kind == MessageKind::Text && message.content.is_empty() {
            return Err(DecodeError::EmptyContent { kind: message.kind });
        }
        Ok(message)
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, de::Error};

    /// Accepts RFC 3339 as well as zone-less local date-times, which are read as UTC.
    /// An explicit `null` is treated like a missing field.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(Utc::now());
        };
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|err| D::Error::custom(format!("invalid timestamp '{raw}': {err}")))
    }
}

/// Reads the next message from a line-delimited stream.
///
/// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
/// A line longer than `max_frame_bytes` yields a fatal [`FrameError`]. A
/// complete line that is not UTF-8 or not a valid message yields
/// [`FrameError::Decode`] and the stream stays usable.
pub async fn read_message<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<WireMessage>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_frame_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && line.last() != Some(&b'\n') {
            return Err(FrameError::TooLong {
                limit: max_frame_bytes,
            });
        }

        let text = std::str::from_utf8(&line).map_err(DecodeError::InvalidUtf8)?;
        let trimmed = text.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        return Ok(Some(WireMessage::decode(trimmed)?));
    }
}

/// Serializes a message into a newline-terminated frame.
pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    Ok(encoded)
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message).map_err(to_io_error)?;
    write_frame(writer, &frame).await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

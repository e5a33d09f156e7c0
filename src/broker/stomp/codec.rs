//! STOMP 1.2 frame codec.
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! Bodies are read by `content-length` when present, otherwise up to the
//! first NUL. Lone EOLs between frames are heart-beats and are skipped.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected instead of buffered forever.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error type for STOMP sessions.
#[derive(Debug, Error)]
pub enum StompError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("session closed by broker")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// One STOMP frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Append a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `key`; repeated headers keep the first occurrence.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`StompFrame::get`], ignoring ASCII case.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The `message` header of an ERROR frame, falling back to its body.
    pub fn error_message(&self) -> String {
        match self.get("message") {
            Some(message) => message.to_string(),
            None => String::from_utf8_lossy(&self.body).into_owned(),
        }
    }

    /// CONNECT and CONNECTED headers are exempt from escaping.
    fn escapes_headers(&self) -> bool {
        !matches!(self.command.as_str(), "CONNECT" | "CONNECTED")
    }
}

/// `tokio_util` codec for [`StompFrame`]s.
///
/// Heart-beats never surface as frames, so the codec remembers whether it
/// has seen any input since [`StompCodec::take_activity`] was last called.
#[derive(Debug, Default, Clone, Copy)]
pub struct StompCodec {
    active: bool,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any bytes arrived since the last call, resetting the flag.
    pub fn take_activity(&mut self) -> bool {
        std::mem::take(&mut self.active)
    }
}

impl Decoder for StompCodec {
    type Item = StompFrame;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StompFrame>, StompError> {
        if !src.is_empty() {
            self.active = true;
        }
        while matches!(src.first(), Some(b'\n' | b'\r')) {
            src.advance(1);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some((head_end, body_start)) = find_head_end(src) else {
            return check_len(src.len());
        };

        let head = std::str::from_utf8(&src[..head_end])
            .map_err(|e| StompError::Malformed(format!("headers are not utf-8: {}", e)))?;
        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let command = lines.next().unwrap_or_default().to_string();
        let mut frame = StompFrame::new(command);
        let escaped = frame.escapes_headers();
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::Malformed(format!("header without colon: {:?}", line)))?;
            if escaped {
                frame.headers.push((unescape(key)?, unescape(value)?));
            } else {
                frame.headers.push((key.to_string(), value.to_string()));
            }
        }

        let body_end = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len.trim().parse().map_err(|_| {
                    StompError::Malformed(format!("invalid content-length {:?}", len))
                })?;
                if len > MAX_FRAME_LEN {
                    return Err(StompError::FrameTooLarge(MAX_FRAME_LEN));
                }
                let end = body_start
                    .checked_add(len)
                    .ok_or(StompError::FrameTooLarge(MAX_FRAME_LEN))?;
                if src.len() <= end {
                    return check_len(end.saturating_add(1)).map(|_| None);
                }
                if src[end] != 0 {
                    return Err(StompError::Malformed(
                        "body not terminated by NUL".to_string(),
                    ));
                }
                end
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(offset) => body_start + offset,
                None => return check_len(src.len()),
            },
        };

        frame.body = src[body_start..body_end].to_vec();
        src.advance(body_end + 1);
        Ok(Some(frame))
    }
}

impl Encoder<StompFrame> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, frame: StompFrame, dst: &mut BytesMut) -> Result<(), StompError> {
        let escaped = frame.escapes_headers();
        dst.reserve(frame.command.len() + frame.body.len() + 64);
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        for (key, value) in &frame.headers {
            if escaped {
                dst.put_slice(escape(key).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(key.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

/// Position of the blank line ending the headers: (end of header text,
/// start of body).
fn find_head_end(src: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'\n' {
            match (src.get(i + 1), src.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, i + 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn check_len(len: usize) -> Result<Option<StompFrame>, StompError> {
    if len > MAX_FRAME_LEN {
        Err(StompError::FrameTooLarge(MAX_FRAME_LEN))
    } else {
        Ok(None)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::Malformed(format!(
                    "invalid escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

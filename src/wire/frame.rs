//! Length-prefixed key/value framing.
//!
//! A frame is a sequence of entries, each a 16-bit big-endian key length,
//! the key bytes, a 16-bit big-endian value length and the value bytes,
//! terminated by a zero key length. Three frame kinds exist, distinguished
//! by reserved keys: requests carry `_command` and `_ask`, answers carry
//! `_answer`, errors carry `_error` plus a code and description. The value
//! carried by each key is the correlation tag linking answers and errors to
//! their request.

use crate::config::MAX_VALUE_LENGTH;
use crate::error::{VolmeshError, VolmeshResult};

/// Largest key a frame entry may carry.
pub const MAX_KEY_LENGTH: usize = 255;

const COMMAND_KEY: &str = "_command";
const ASK_KEY: &str = "_ask";
const ANSWER_KEY: &str = "_answer";
const ERROR_KEY: &str = "_error";
const ERROR_CODE_KEY: &str = "_error_code";
const ERROR_DESCRIPTION_KEY: &str = "_error_description";

/// An ordered collection of key/value entries carried by one frame.
///
/// Order is preserved: chunked values rely on their synthesized keys being
/// gathered back in numeric order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBox {
    entries: Vec<(String, Vec<u8>)>,
}

impl FrameBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, enforcing the wire limits.
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) -> VolmeshResult<()> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(VolmeshError::KeyTooLong {
                length: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(VolmeshError::ValueTooLong {
                length: value.len(),
                max: MAX_VALUE_LENGTH,
            });
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A command the peer should dispatch and answer
    Request {
        command: String,
        tag: u64,
        fields: FrameBox,
    },

    /// The successful result of a request
    Answer { tag: u64, fields: FrameBox },

    /// The structured failure of a request
    Error {
        tag: u64,
        code: String,
        description: String,
    },
}

impl Frame {
    /// Encode this frame to wire bytes.
    pub fn encode(&self) -> VolmeshResult<Vec<u8>> {
        let mut reserved = FrameBox::new();
        let fields = match self {
            Frame::Request {
                command,
                tag,
                fields,
            } => {
                reserved.insert(COMMAND_KEY, command.as_bytes().to_vec())?;
                reserved.insert(ASK_KEY, tag.to_string().into_bytes())?;
                Some(fields)
            }
            Frame::Answer { tag, fields } => {
                reserved.insert(ANSWER_KEY, tag.to_string().into_bytes())?;
                Some(fields)
            }
            Frame::Error {
                tag,
                code,
                description,
            } => {
                reserved.insert(ERROR_KEY, tag.to_string().into_bytes())?;
                reserved.insert(ERROR_CODE_KEY, code.as_bytes().to_vec())?;
                reserved.insert(ERROR_DESCRIPTION_KEY, description.as_bytes().to_vec())?;
                None
            }
        };

        let mut wire = Vec::new();
        for (key, value) in reserved.iter() {
            write_entry(&mut wire, key.as_bytes(), value);
        }
        if let Some(fields) = fields {
            for (key, value) in fields.iter() {
                write_entry(&mut wire, key.as_bytes(), value);
            }
        }
        wire.extend_from_slice(&[0, 0]);
        Ok(wire)
    }
}

fn write_entry(wire: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    wire.extend_from_slice(&(key.len() as u16).to_be_bytes());
    wire.extend_from_slice(key);
    wire.extend_from_slice(&(value.len() as u16).to_be_bytes());
    wire.extend_from_slice(value);
}

/// Incremental frame decoder.
///
/// Feed it raw socket bytes as they arrive; complete frames come out as they
/// become available, partial frames wait for more input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> VolmeshResult<Option<Frame>> {
        let mut position = 0usize;
        let mut raw = FrameBox::new();
        loop {
            let Some(key_length) = read_u16(&self.buffer, position) else {
                return Ok(None);
            };
            position += 2;
            if key_length == 0 {
                self.buffer.drain(..position);
                return classify(raw).map(Some);
            }
            let key_length = key_length as usize;
            if key_length > MAX_KEY_LENGTH {
                return Err(VolmeshError::MalformedFrame {
                    reason: format!("key length {key_length} exceeds {MAX_KEY_LENGTH}"),
                });
            }
            let Some(key_bytes) = self.buffer.get(position..position + key_length) else {
                return Ok(None);
            };
            let key = std::str::from_utf8(key_bytes)
                .map_err(|_| VolmeshError::MalformedFrame {
                    reason: "key is not valid UTF-8".to_string(),
                })?
                .to_string();
            position += key_length;
            let Some(value_length) = read_u16(&self.buffer, position) else {
                return Ok(None);
            };
            position += 2;
            let value_length = value_length as usize;
            let Some(value) = self.buffer.get(position..position + value_length) else {
                return Ok(None);
            };
            let value = value.to_vec();
            position += value_length;
            raw.insert(key, value)?;
        }
    }
}

fn read_u16(buffer: &[u8], position: usize) -> Option<u16> {
    let bytes = buffer.get(position..position + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn classify(mut raw: FrameBox) -> VolmeshResult<Frame> {
    if let Some(tag) = raw.remove(ASK_KEY) {
        let command = raw.remove(COMMAND_KEY).ok_or_else(|| {
            VolmeshError::MalformedFrame {
                reason: "request frame without a command".to_string(),
            }
        })?;
        return Ok(Frame::Request {
            command: into_string(command)?,
            tag: parse_tag(&tag)?,
            fields: raw,
        });
    }
    if let Some(tag) = raw.remove(ANSWER_KEY) {
        return Ok(Frame::Answer {
            tag: parse_tag(&tag)?,
            fields: raw,
        });
    }
    if let Some(tag) = raw.remove(ERROR_KEY) {
        let code = raw.remove(ERROR_CODE_KEY).unwrap_or_default();
        let description = raw.remove(ERROR_DESCRIPTION_KEY).unwrap_or_default();
        return Ok(Frame::Error {
            tag: parse_tag(&tag)?,
            code: into_string(code)?,
            description: into_string(description)?,
        });
    }
    Err(VolmeshError::MalformedFrame {
        reason: "frame carries no request, answer or error marker".to_string(),
    })
}

fn into_string(bytes: Vec<u8>) -> VolmeshResult<String> {
    String::from_utf8(bytes).map_err(|_| VolmeshError::MalformedFrame {
        reason: "marker value is not valid UTF-8".to_string(),
    })
}

fn parse_tag(bytes: &[u8]) -> VolmeshResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VolmeshError::MalformedFrame {
            reason: "correlation tag is not a decimal integer".to_string(),
        })
}

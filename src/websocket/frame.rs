//! RFC 6455 frame codec.
//!
//! Parsing distinguishes a buffer that simply ends too early
//! ([`FrameError::Incomplete`]) from one that can never become a valid
//! frame ([`FrameError::Malformed`], [`FrameError::TooLarge`]).

use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Longest close reason that still fits a control frame after the code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Close status codes (RFC 6455 §7.4.1) used by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// WebSocket frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parses the low 4 bits of the first frame byte. Reserved values
    /// yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("frame payload of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: u64, limit: usize },

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// Close code to send before dropping the connection, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            FrameError::Incomplete => None,
            FrameError::Malformed(_) => Some(close_code::PROTOCOL_ERROR),
            FrameError::TooLarge { .. } => Some(close_code::MESSAGE_TOO_BIG),
            FrameError::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
        }
    }
}

/// One wire frame. `payload` is always plaintext; masking is applied on
/// serialization and removed on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub masking_key: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            masking_key: 0,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// Close frame; code `0` produces an empty payload. The reason is cut
    /// at a char boundary so the payload stays within a control frame.
    pub fn close(code: u16, reason: &str) -> Self {
        let reason = truncate_reason(reason);
        let mut payload = Vec::with_capacity(2 + reason.len());
        if code != 0 {
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
        }
        Self::new(Opcode::Close, payload)
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_mask(mut self, masking_key: u32) -> Self {
        self.masked = true;
        self.masking_key = masking_key;
        self
    }

    /// RFC 6455 §5.5 rules for control frames. The codec itself accepts
    /// any length and FIN combination; the connection enforces these.
    pub fn control_violation(&self) -> Option<FrameError> {
        if !self.opcode.is_control() {
            return None;
        }
        if !self.fin {
            return Some(FrameError::Malformed("fragmented control frame"));
        }
        if self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Some(FrameError::Malformed("control frame payload over 125 bytes"));
        }
        None
    }

    pub fn has_reserved_bits(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Status code and reason of a close frame. An empty payload reports
    /// 1005 (no status received).
    pub fn close_payload(&self) -> (u16, String) {
        if self.payload.len() < 2 {
            return (close_code::NO_STATUS, String::new());
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        (code, reason)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        let mut first = self.opcode.as_u8();
        if self.fin {
            first |= 0x80;
        }
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }
        out.push(first);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len < 65536 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if self.masked {
            let key = self.masking_key.to_be_bytes();
            out.extend_from_slice(&key);
            out.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        } else {
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parses one frame off the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        Self::parse_with_limit(buf, usize::MAX)
    }

    /// Like [`Frame::parse`], rejecting payloads above `max_payload` as soon
    /// as the length field is readable.
    pub fn parse_with_limit(buf: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::Incomplete);
        }

        let first = buf[0];
        let second = buf[1];
        let opcode =
            Opcode::from_u8(first).ok_or(FrameError::Malformed("reserved opcode"))?;
        let fin = first & 0x80 != 0;
        let masked = second & 0x80 != 0;

        let mut offset = 2;
        let len = match second & 0x7F {
            126 => {
                let bytes = buf.get(offset..offset + 2).ok_or(FrameError::Incomplete)?;
                offset += 2;
                u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            127 => {
                let bytes = buf.get(offset..offset + 8).ok_or(FrameError::Incomplete)?;
                offset += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(FrameError::Malformed("64-bit length with the high bit set"));
                }
                len
            }
            short => u64::from(short),
        };

        if len > max_payload as u64 {
            return Err(FrameError::TooLarge {
                len,
                limit: max_payload,
            });
        }

        let masking_key = if masked {
            let bytes = buf.get(offset..offset + 4).ok_or(FrameError::Incomplete)?;
            offset += 4;
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            0
        };

        let len = usize::try_from(len).map_err(|_| FrameError::TooLarge {
            len,
            limit: max_payload,
        })?;
        let end = offset.checked_add(len).ok_or(FrameError::TooLarge {
            len: len as u64,
            limit: max_payload,
        })?;
        let raw = buf.get(offset..end).ok_or(FrameError::Incomplete)?;

        let payload = if masked {
            let key = masking_key.to_be_bytes();
            raw.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect()
        } else {
            raw.to_vec()
        };

        let frame = Frame {
            fin,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode,
            masked,
            masking_key,
            payload,
        };
        Ok((frame, end))
    }
}

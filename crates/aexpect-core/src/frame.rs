//! Control-pipe frame codec.
//!
//! Frames travel client -> helper on the session's `ctrlpipe` FIFO as a
//! 10-digit zero-padded decimal payload length followed by the payload
//! bytes. The fixed-width header keeps the format compatible with helper
//! binaries already in the field.

/// Width of the decimal length header, in bytes.
pub const FRAME_LEN_DIGITS: usize = 10;

/// Largest payload a helper will accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Side-band commands understood by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Put the pseudo terminal into raw mode.
    Raw,
    /// Restore the standard (cooked) terminal mode.
    Cooked,
    /// Resize the pseudo terminal window.
    Winch { rows: u16, cols: u16 },
}

impl ControlFrame {
    /// The wire payload, without the length header.
    pub fn payload(&self) -> String {
        match self {
            Self::Raw => "raw".to_string(),
            Self::Cooked => "cooked".to_string(),
            Self::Winch { rows, cols } => format!("winch {rows} {cols}"),
        }
    }

    /// Encode the frame for the control pipe: length header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = format!("{:0width$}", payload.len(), width = FRAME_LEN_DIGITS).into_bytes();
        out.extend_from_slice(payload.as_bytes());
        out
    }

    /// Parse a received payload. Unknown or malformed payloads yield `None`
    /// and are dropped by the helper.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let mut words = text.split_whitespace();
        match words.next()? {
            "raw" => Some(Self::Raw),
            "cooked" => Some(Self::Cooked),
            "winch" => {
                let rows = words.next()?.parse().ok()?;
                let cols = words.next()?.parse().ok()?;
                Some(Self::Winch { rows, cols })
            }
            _ => None,
        }
    }
}

/// Decode the fixed-width length header. Rejects non-decimal headers,
/// zero-length frames, and frames larger than [`MAX_FRAME_LEN`].
pub fn decode_length(header: &[u8]) -> Option<usize> {
    if header.len() != FRAME_LEN_DIGITS {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    let len: usize = text.trim().parse().ok()?;
    if len == 0 || len > MAX_FRAME_LEN {
        return None;
    }
    Some(len)
}

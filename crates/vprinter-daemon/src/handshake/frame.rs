//! Bind/detect frame codec.
//!
//! ```text
//! +--------+-------------+----------------+--------+
//! | A5 A5  | len (u16 LE)| JSON body      | A7 A7  |
//! +--------+-------------+----------------+--------+
//! ```
//!
//! `len` counts the whole frame, envelope included.

pub const FRAME_HEADER: [u8; 2] = [0xA5, 0xA5];
pub const FRAME_TRAILER: [u8; 2] = [0xA7, 0xA7];

/// Header + length field + trailer.
pub const ENVELOPE_LEN: usize = 6;

/// Errors decoding or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad frame header {0:02x?}")]
    BadHeader([u8; 2]),

    #[error("bad frame trailer {0:02x?}")]
    BadTrailer([u8; 2]),

    #[error("frame length {0} shorter than the envelope")]
    BadLength(usize),

    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode `body` into a frame.
pub fn build_frame(body: &serde_json::Value) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(body)?;
    let total = json.len() + ENVELOPE_LEN;
    let len = u16::try_from(total).map_err(|_| FrameError::TooLarge(json.len()))?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&FRAME_HEADER);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&json);
    frame.extend_from_slice(&FRAME_TRAILER);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the body and
/// the number of bytes consumed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(serde_json::Value, usize)>, FrameError> {
    if buf.len() < 4 {
        if buf.len() >= 2 && buf[..2] != FRAME_HEADER {
            return Err(FrameError::BadHeader([buf[0], buf[1]]));
        }
        return Ok(None);
    }
    if buf[..2] != FRAME_HEADER {
        return Err(FrameError::BadHeader([buf[0], buf[1]]));
    }

    let total = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    if total < ENVELOPE_LEN {
        return Err(FrameError::BadLength(total));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let trailer = [buf[total - 2], buf[total - 1]];
    if trailer != FRAME_TRAILER {
        return Err(FrameError::BadTrailer(trailer));
    }

    let body = serde_json::from_slice(&buf[4..total - 2])?;
    Ok(Some((body, total)))
}

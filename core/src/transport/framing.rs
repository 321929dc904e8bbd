//! 32-bit little-endian length-prefixed framing (spec.md §4.3, §6).
//!
//! Grounded on `t51core::net::frame::Header`'s fixed-size, byteorder-coded
//! header, generalized from a fixed class/sequence/size triple to a bare
//! length prefix since this protocol has no session handshake to carry.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use crate::error::TransportError;

pub const HEADER_LEN: usize = 4;

/// Attempt to extract one complete frame's payload from the front of
/// `buffer`. Returns `Some((payload, consumed))` when a full frame is
/// present, `None` when more bytes are needed. Errors if the declared
/// length exceeds `max_frame_size`.
pub fn try_extract_frame(buffer: &[u8], max_frame_size: u32) -> crate::Result<Option<(Vec<u8>, usize)>> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut cursor = Cursor::new(&buffer[..HEADER_LEN]);
    let len = cursor.read_u32::<LittleEndian>()?;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge(len, max_frame_size).into());
    }
    let total = HEADER_LEN + len as usize;
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some((buffer[HEADER_LEN..total].to_vec(), total)))
}

/// Encode `payload` as one length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.write_u32::<LittleEndian>(payload.len() as u32)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// True if `buffer` starts with what looks like an HTTP request line,
/// used to decide which framing path to take (spec.md §4.3's fallback).
pub fn looks_like_http(buffer: &[u8]) -> bool {
    const METHODS: &[&[u8]] = &[b"GET ", b"POST ", b"PUT ", b"HEAD ", b"OPTIONS "];
    METHODS.iter().any(|m| buffer.starts_with(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let payload = b"hello".to_vec();
        let framed = encode_frame(&payload).unwrap();
        let (extracted, consumed) = try_extract_frame(&framed, 1024).unwrap().unwrap();
        assert_eq!(extracted, payload);
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let framed = encode_frame(b"hello").unwrap();
        assert!(try_extract_frame(&framed[..4], 1024).unwrap().is_none());
        assert!(try_extract_frame(&framed[..framed.len() - 1], 1024).unwrap().is_none());
    }

    #[test]
    fn length_at_max_is_accepted() {
        let payload = vec![0u8; 16];
        let framed = encode_frame(&payload).unwrap();
        assert!(try_extract_frame(&framed, 16).unwrap().is_some());
    }

    #[test]
    fn length_over_max_is_rejected() {
        let payload = vec![0u8; 17];
        let framed = encode_frame(&payload).unwrap();
        let err = try_extract_frame(&framed, 16).unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(_)));
    }

    #[test]
    fn http_sniffing_detects_request_lines() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"POST /rpc HTTP/1.1\r\n"));
        assert!(!looks_like_http(&encode_frame(b"x").unwrap()));
    }
}

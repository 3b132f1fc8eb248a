//! Length-prefixed frames shared by the data channel and the gRPC-web body.
//!
//! Each frame is `[flags: u8 | length: u32 BE | payload]`. A flags value with
//! the high bit set marks a trailer frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

use crate::rpc::Metadata;

pub const FRAME_HEADER_LEN: usize = 5;
pub const FLAG_DATA: u8 = 0x00;
pub const FLAG_TRAILER: u8 = 0x80;

// grpc-message escapes everything outside printable ASCII, plus '%' itself.
const GRPC_MESSAGE: &AsciiSet = &CONTROLS.add(b'%');

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: usize },
    #[error("truncated frame: {0}")]
    Truncated(&'static str),
    #[error("malformed trailers: {0}")]
    Trailers(String),
    #[error("malformed envelope: {0}")]
    Envelope(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(payload: Bytes) -> Self {
        Self {
            flags: FLAG_DATA,
            payload,
        }
    }

    pub fn trailer(payload: Bytes) -> Self {
        Self {
            flags: FLAG_TRAILER,
            payload,
        }
    }

    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER != 0
    }
}

pub fn encode_frame(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode exactly one frame from `bytes`. Trailing bytes are an error.
pub fn decode_frame(mut bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated("header"));
    }
    let flags = bytes.get_u8();
    let len = bytes.get_u32() as usize;
    if bytes.len() != len {
        return Err(FrameError::Truncated("payload length mismatch"));
    }
    Ok(Frame {
        flags,
        payload: Bytes::copy_from_slice(bytes),
    })
}

/// Incremental decoder for a byte stream carrying consecutive frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_len {
            return Err(FrameError::TooLarge {
                len,
                limit: self.max_len,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }

    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trailers {
    pub code: i32,
    pub message: String,
    pub metadata: Metadata,
}

/// Parse an HTTP/1-style trailer block (`key: value\r\n` lines).
pub fn parse_trailers(payload: &[u8]) -> Result<Trailers, FrameError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| FrameError::Trailers(err.to_string()))?;
    let mut trailers = Trailers::default();
    let mut saw_status = false;
    for line in text.split("\r\n").map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            return Err(FrameError::Trailers(format!("line without separator: {line:?}")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "grpc-status" => {
                trailers.code = value
                    .parse()
                    .map_err(|_| FrameError::Trailers(format!("bad grpc-status {value:?}")))?;
                saw_status = true;
            }
            "grpc-message" => {
                trailers.message = percent_decode_str(value).decode_utf8_lossy().into_owned();
            }
            _ => {
                trailers.metadata.insert(key, value.to_string());
            }
        }
    }
    if !saw_status {
        return Err(FrameError::Trailers("missing grpc-status".into()));
    }
    Ok(trailers)
}

pub fn encode_trailers(code: i32, message: &str) -> Bytes {
    let message = utf8_percent_encode(message, GRPC_MESSAGE);
    let block = format!("grpc-status: {code}\r\ngrpc-message: {message}\r\n");
    encode_frame(FLAG_TRAILER, block.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_input() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(FLAG_DATA, b"hello"));
        wire.extend_from_slice(&encode_trailers(0, "ok"));

        let mut decoder = FrameDecoder::new(1024);
        let (first, rest) = wire.split_at(3);
        decoder.push(first);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(rest);

        let data = decoder.next_frame().unwrap().expect("data frame");
        assert!(!data.is_trailer());
        assert_eq!(&data.payload[..], b"hello");
        let trailer = decoder.next_frame().unwrap().expect("trailer frame");
        assert!(trailer.is_trailer());
        let parsed = parse_trailers(&trailer.payload).unwrap();
        assert_eq!(parsed.code, 0);
        assert_eq!(parsed.message, "ok");
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(&encode_frame(FLAG_DATA, b"too long"));
        assert_eq!(
            decoder.next_frame().unwrap_err(),
            FrameError::TooLarge { len: 8, limit: 4 }
        );
    }

    #[test]
    fn trailer_message_survives_line_breaks_and_percent_signs() {
        let frame = encode_trailers(13, "50% done\r\ngrpc-status: 0 ✓");
        let trailers = parse_trailers(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(trailers.code, 13);
        assert_eq!(trailers.message, "50% done\r\ngrpc-status: 0 ✓");
        assert!(trailers.metadata.is_empty());
    }

    #[test]
    fn trailers_keep_extra_metadata_and_decode_message() {
        let parsed =
            parse_trailers(b"grpc-status: 3\r\ngrpc-message: SESSION%20EXPIRED\r\nx-extra: 1\r\n")
                .unwrap();
        assert_eq!(parsed.code, 3);
        assert_eq!(parsed.message, "SESSION EXPIRED");
        assert_eq!(parsed.metadata.get("x-extra"), Some("1"));
        assert!(parse_trailers(b"grpc-message: nope\r\n").is_err());
    }

    #[test]
    fn single_frame_decode_checks_length() {
        let frame = encode_frame(FLAG_TRAILER, b"abc");
        assert!(decode_frame(&frame).unwrap().is_trailer());
        assert!(decode_frame(&frame[..6]).is_err());
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Length-prefix framing codec for RPC messages.
//!
//! Every RPC request and response is one frame on the wire:
//!
//! ```text
//! +----------------+----------------+------------------+
//! | Length (2B BE) | Code (4B BE)   | Payload (JSON)   |
//! +----------------+----------------+------------------+
//! ```
//!
//! The length field counts the code plus the payload (not itself), so
//! the largest payload is 65535 - 4 = 65531 bytes.
//!
//! # Compatibility
//!
//! The 2-byte length field is shared with a managed-language peer
//! implementation of this protocol. Widening it is a wire break and
//! requires a protocol version bump; do not "fix" it here.
//!
//! The codec performs no I/O. Blocking frame reads live in
//! [`crate::transport`].

use super::CodecError;

/// Size of the length prefix in bytes.
pub const FRAME_LEN_SIZE: usize = 2;

/// Size of the message-code field in bytes.
pub const MSG_CODE_SIZE: usize = 4;

/// Total fixed header size (length prefix + message code).
pub const FRAME_HEADER_SIZE: usize = FRAME_LEN_SIZE + MSG_CODE_SIZE;

/// Maximum value the 16-bit length field can declare.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Maximum payload size: the length field also covers the code field.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - MSG_CODE_SIZE;

/// One RPC message. Requests and responses are symmetric instances of
/// this type; `code` discriminates what the payload means.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpcMessage {
    /// Request/response discriminator.
    pub code: u32,

    /// Opaque payload, usually a UTF-8 JSON document. `None` and an
    /// empty payload encode identically (length field = 4).
    pub payload: Option<Vec<u8>>,
}

impl IpcMessage {
    /// Message with no payload.
    pub fn new(code: u32) -> Self {
        Self {
            code,
            payload: None,
        }
    }

    /// Message carrying raw payload bytes.
    pub fn with_payload(code: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: Some(payload.into()),
        }
    }

    /// Payload length in bytes (0 when absent).
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    /// Payload interpreted as UTF-8, lossy.
    pub fn payload_str(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}

/// Encode a message into a framed buffer: `[len u16 BE][code u32 BE][payload]`.
///
/// Fails with [`CodecError::TooLarge`] when the payload exceeds
/// [`MAX_PAYLOAD_LEN`].
pub fn encode(msg: &IpcMessage) -> Result<Vec<u8>, CodecError> {
    let payload_len = msg.payload_len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CodecError::TooLarge {
            declared: MSG_CODE_SIZE + payload_len,
        });
    }

    let frame_len = (MSG_CODE_SIZE + payload_len) as u16;
    let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + frame_len as usize);
    frame.extend_from_slice(&frame_len.to_be_bytes());
    frame.extend_from_slice(&msg.code.to_be_bytes());
    if let Some(payload) = &msg.payload {
        frame.extend_from_slice(payload);
    }
    Ok(frame)
}

/// Decode one complete frame from a buffer.
///
/// Fails with:
/// - [`CodecError::TooShort`] — fewer bytes than the fixed header
/// - [`CodecError::TooLarge`] — declared length exceeds [`MAX_FRAME_LEN`]
/// - [`CodecError::Truncated`] — fewer payload bytes than declared
/// - [`CodecError::Malformed`] — declared length smaller than the code field
pub fn decode(buf: &[u8]) -> Result<IpcMessage, CodecError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::TooShort { have: buf.len() });
    }

    let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge { declared });
    }
    if declared < MSG_CODE_SIZE {
        return Err(CodecError::Malformed(format!(
            "length field {declared} smaller than code field"
        )));
    }

    let available = buf.len() - FRAME_LEN_SIZE;
    if available < declared {
        return Err(CodecError::Truncated {
            declared,
            have: available,
        });
    }

    let code = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let payload_len = declared - MSG_CODE_SIZE;
    let payload = if payload_len == 0 {
        None
    } else {
        Some(buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len].to_vec())
    };

    Ok(IpcMessage { code, payload })
}

/// Declared total frame size (prefix included) from a header slice, or
/// `None` if fewer than [`FRAME_LEN_SIZE`] bytes are available.
///
/// Used by blocking readers to size the body read.
pub fn declared_frame_size(header: &[u8]) -> Option<usize> {
    if header.len() < FRAME_LEN_SIZE {
        return None;
    }
    let declared = u16::from_be_bytes([header[0], header[1]]) as usize;
    Some(FRAME_LEN_SIZE + declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_no_payload() {
        let frame = encode(&IpcMessage::new(0x11223344)).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE);
        assert_eq!(&frame[..2], &4u16.to_be_bytes());
        assert_eq!(&frame[2..6], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_encode_with_payload() {
        let msg = IpcMessage::with_payload(7, b"{\"a\":1}".to_vec());
        let frame = encode(&msg).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 7);
        assert_eq!(&frame[..2], &(4u16 + 7).to_be_bytes());
        assert_eq!(&frame[6..], b"{\"a\":1}");
    }

    #[test]
    fn test_roundtrip_various_sizes() {
        for size in [0usize, 1, 63, 1024, 16384, MAX_PAYLOAD_LEN] {
            let msg = if size == 0 {
                IpcMessage::new(42)
            } else {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                IpcMessage::with_payload(42, payload)
            };
            let frame = encode(&msg).unwrap();
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded, msg, "roundtrip failed for payload size {size}");
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = IpcMessage::with_payload(1, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(encode(&msg), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_encode_max_payload_accepted() {
        let msg = IpcMessage::with_payload(1, vec![0x5au8; MAX_PAYLOAD_LEN]);
        let frame = encode(&msg).unwrap();
        assert_eq!(&frame[..2], &u16::MAX.to_be_bytes());
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode(&[0, 4, 0]),
            Err(CodecError::TooShort { have: 3 })
        );
        assert_eq!(decode(&[]), Err(CodecError::TooShort { have: 0 }));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let msg = IpcMessage::with_payload(9, b"abcdef".to_vec());
        let frame = encode(&msg).unwrap();
        let result = decode(&frame[..frame.len() - 2]);
        assert_eq!(
            result,
            Err(CodecError::Truncated {
                declared: 10,
                have: 8
            })
        );
    }

    #[test]
    fn test_decode_bad_length_field() {
        // Declared length 3 cannot even hold the 4-byte code field.
        let buf = [0u8, 3, 0, 0, 0, 1];
        assert!(matches!(decode(&buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut frame = encode(&IpcMessage::with_payload(5, b"xy".to_vec())).unwrap();
        frame.extend_from_slice(b"garbage");
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.code, 5);
        assert_eq!(decoded.payload.as_deref(), Some(b"xy".as_slice()));
    }

    #[test]
    fn test_declared_frame_size() {
        let frame = encode(&IpcMessage::with_payload(5, b"xyz".to_vec())).unwrap();
        assert_eq!(declared_frame_size(&frame[..2]), Some(frame.len()));
        assert_eq!(declared_frame_size(&frame[..1]), None);
    }

    #[test]
    fn test_empty_payload_decodes_as_none() {
        let msg = IpcMessage::with_payload(3, Vec::new());
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap().payload, None);
    }
}

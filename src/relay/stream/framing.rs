//! Binary event-stream frame codec (spec.md §4.5.4).
//!
//! ```text
//! | totalLen (4B, BE) | headersLen (4B, BE) | preludeCRC (4B, BE) |
//! | headers (headersLen bytes)                                  |
//! | payload (totalLen − 12 − headersLen − 4 bytes)               |
//! | messageCRC (4B, BE)                                          |
//! ```

use std::collections::HashMap;

use crc32fast::Hasher;

use crate::relay::error::{RelayError, RelayResult};

const PRELUDE_LEN: usize = 8;
const PRELUDE_CRC_LEN: usize = 4;
const MESSAGE_CRC_LEN: usize = 4;

/// A single header value. Only string-typed headers (type 7) are consumed on
/// decode; every other type ends header parsing for that frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Other(u8),
}

/// One decoded frame: its header map and raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: HashMap<String, HeaderValue>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn message_type(&self) -> Option<&str> {
        match self.headers.get(":message-type") {
            Some(HeaderValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        match self.headers.get(":event-type") {
            Some(HeaderValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Encode a frame's raw headers blob and payload into a wire frame with both
/// CRCs computed. Used by tests (and by any component that needs to emit a
/// frame, e.g. a test double standing in for the vendor).
pub fn encode(headers_blob: &[u8], payload: &[u8]) -> Vec<u8> {
    let headers_len = headers_blob.len() as u32;
    let total_len = (PRELUDE_LEN + PRELUDE_CRC_LEN + headers_blob.len() + payload.len() + MESSAGE_CRC_LEN) as u32;

    let mut prelude = Vec::with_capacity(PRELUDE_LEN);
    prelude.extend_from_slice(&total_len.to_be_bytes());
    prelude.extend_from_slice(&headers_len.to_be_bytes());

    let prelude_crc = crc32(&prelude);

    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&prelude);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(headers_blob);
    frame.extend_from_slice(payload);

    let message_crc = crc32(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

/// Decode one complete frame from `bytes`. `bytes` must contain exactly one
/// frame (the caller is responsible for slicing `totalLen`-sized chunks off
/// a stream, which `read_frame_len` supports).
pub fn decode(bytes: &[u8]) -> RelayResult<Frame> {
    if bytes.len() < PRELUDE_LEN + PRELUDE_CRC_LEN + MESSAGE_CRC_LEN {
        return Err(RelayError::FrameMalformed("frame shorter than minimum size".to_string()));
    }

    let total_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let headers_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if total_len != bytes.len() {
        return Err(RelayError::FrameMalformed(format!(
            "totalLen {total_len} does not match frame size {}",
            bytes.len()
        )));
    }

    let prelude_crc = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    if crc32(&bytes[0..8]) != prelude_crc {
        return Err(RelayError::FrameCrcMismatch);
    }

    let headers_start = PRELUDE_LEN + PRELUDE_CRC_LEN;
    let headers_end = headers_start + headers_len;
    if headers_end + MESSAGE_CRC_LEN > total_len {
        return Err(RelayError::FrameMalformed("headersLen overruns frame".to_string()));
    }
    let payload_end = total_len - MESSAGE_CRC_LEN;

    let message_crc = u32::from_be_bytes(bytes[payload_end..total_len].try_into().unwrap());
    if crc32(&bytes[0..payload_end]) != message_crc {
        return Err(RelayError::FrameCrcMismatch);
    }

    let headers = decode_headers(&bytes[headers_start..headers_end])?;
    let payload = bytes[headers_end..payload_end].to_vec();

    Ok(Frame { headers, payload })
}

/// Read the `totalLen` prefix of an incoming frame so the caller knows how
/// many more bytes to read before calling [`decode`].
pub fn read_frame_len(prelude: &[u8; 4]) -> usize {
    u32::from_be_bytes(*prelude) as usize
}

fn decode_headers(mut bytes: &[u8]) -> RelayResult<HashMap<String, HeaderValue>> {
    let mut headers = HashMap::new();
    while !bytes.is_empty() {
        let name_len = bytes[0] as usize;
        bytes = &bytes[1..];
        if bytes.len() < name_len + 1 {
            return Err(RelayError::FrameMalformed("truncated header name".to_string()));
        }
        let name = String::from_utf8_lossy(&bytes[..name_len]).to_string();
        bytes = &bytes[name_len..];

        let value_type = bytes[0];
        bytes = &bytes[1..];

        if value_type != 7 {
            // Only string headers are consumed; any other type ends parsing.
            break;
        }
        if bytes.len() < 2 {
            return Err(RelayError::FrameMalformed("truncated header value length".to_string()));
        }
        let value_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        bytes = &bytes[2..];
        if bytes.len() < value_len {
            return Err(RelayError::FrameMalformed("truncated header value".to_string()));
        }
        let value = String::from_utf8_lossy(&bytes[..value_len]).to_string();
        bytes = &bytes[value_len..];

        headers.insert(name, HeaderValue::String(value));
    }
    Ok(headers)
}

/// Encode a `(name, string value)` pair in the wire header record format,
/// for building test frames.
pub fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(7u8);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame() -> Vec<u8> {
        let mut headers = Vec::new();
        headers.extend(encode_string_header(":message-type", "event"));
        headers.extend(encode_string_header(":event-type", "assistantResponseEvent"));
        let payload = br#"{"content":"hi"}"#;
        encode(&headers, payload)
    }

    #[test]
    fn decode_recovers_headers_and_payload() {
        let frame = decode(&sample_frame()).unwrap();
        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(frame.payload, br#"{"content":"hi"}"#);
    }

    // P6 — CRC round-trip: flipping any prelude or body bit fails decode.
    #[test]
    fn p6_bit_flip_fails_crc() {
        let good = sample_frame();
        for byte_idx in 0..good.len() {
            for bit in 0..8u8 {
                let mut corrupted = good.clone();
                corrupted[byte_idx] ^= 1 << bit;
                if corrupted == good {
                    continue;
                }
                let result = decode(&corrupted);
                // A flipped length byte can also fail as Malformed before
                // reaching a CRC check; either failure mode is acceptable,
                // but success is not.
                assert!(result.is_err(), "byte {byte_idx} bit {bit} should fail decode");
            }
        }
    }

    #[test]
    fn unknown_header_type_ends_parsing() {
        let mut headers = Vec::new();
        headers.extend(encode_string_header(":message-type", "event"));
        // A binary-typed header (type 6) after the string ones.
        headers.push(b":foo".len() as u8);
        headers.extend_from_slice(b":foo");
        headers.push(6u8);
        headers.extend_from_slice(&[0, 0, 0, 1]);
        let frame = encode(&headers, b"{}");
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.message_type(), Some("event"));
        assert!(!decoded.headers.contains_key(":foo"));
    }

    proptest! {
        #[test]
        fn p6_round_trip_recovers_payload(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut headers = Vec::new();
            headers.extend(encode_string_header(":message-type", "event"));
            let frame = encode(&headers, &payload);
            let decoded = decode(&frame).unwrap();
            prop_assert_eq!(decoded.payload, payload);
        }
    }
}

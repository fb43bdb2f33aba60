//! Frame helpers shared by the control protocol: length-prefixed framing
//! over `bytes` buffers and the JSON message codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use super::types::ControlError;

/// Upper bound on one frame's payload; anything larger is a protocol error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame from the buffer.
///
/// Returns a tuple of (bytes_consumed, payload). A zero consumed count
/// means the buffer does not hold a complete frame yet.
pub fn read_frame(bytes: &mut Bytes) -> (usize, Bytes) {
    if bytes.len() < 4 {
        return (0, Bytes::new());
    }
    let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        tracing::warn!("oversized frame announced: {length} bytes");
        return (0, Bytes::new());
    }
    if bytes.len() < 4 + length {
        return (0, Bytes::new());
    }
    bytes.advance(4);
    let payload = bytes.copy_to_bytes(length);
    (4 + length, payload)
}

/// Append one length-prefixed frame to the buffer.
pub fn write_frame(stream: &mut BytesMut, payload: &[u8]) {
    stream.put_u32(payload.len() as u32);
    stream.put_slice(payload);
}

/// Encode a message as one JSON frame.
pub fn encode_message<T: Serialize>(message: &T) -> Result<BytesMut, ControlError> {
    let payload = serde_json::to_vec(message).map_err(|e| ControlError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ControlError::Codec(format!(
            "message too large: {} bytes",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(payload.len() + 4);
    write_frame(&mut frame, &payload);
    Ok(frame)
}

/// Decode a message from one frame payload.
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ControlError> {
    serde_json::from_slice(payload).map_err(|e| ControlError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{decode_message, encode_message, read_frame, write_frame};
    use crate::protocol::types::ControlRequest;

    /// Messages round-trip through the frame codec.
    #[test]
    fn test_message_round_trip() {
        let request = ControlRequest::ListActions;
        let frame = encode_message(&request).unwrap();
        let mut bytes = Bytes::from(frame.to_vec());
        let (consumed, payload) = read_frame(&mut bytes);
        assert_eq!(consumed, payload.len() + 4);
        let decoded: ControlRequest = decode_message(&payload).unwrap();
        assert_eq!(decoded, request);
    }

    /// A partial frame consumes nothing.
    #[test]
    fn test_partial_frame() {
        let mut full = BytesMut::new();
        write_frame(&mut full, b"hello");
        let mut truncated = Bytes::from(full[..6].to_vec());
        let (consumed, payload) = read_frame(&mut truncated);
        assert_eq!(consumed, 0);
        assert!(payload.is_empty());
        assert_eq!(truncated.len(), 6);
    }

    /// Several frames in one buffer come out one by one.
    #[test]
    fn test_multiple_frames() {
        let mut stream = BytesMut::new();
        write_frame(&mut stream, b"one");
        write_frame(&mut stream, b"three");
        let mut bytes = Bytes::from(stream.to_vec());
        let (_, first) = read_frame(&mut bytes);
        let (_, second) = read_frame(&mut bytes);
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"three");
        assert!(bytes.is_empty());
    }
}

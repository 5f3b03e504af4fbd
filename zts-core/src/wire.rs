//! Segment codec for overlay frames.
//!
//! Layout: `u32` LE payload length, then the bincode-encoded [`Packet`].
//! One overlay frame carries exactly one packet; a byte stream may carry
//! several back to back.

use crate::protocol::{Packet, PROTOCOL_VERSION};

const LEN_SIZE: usize = 4;

/// Largest accepted payload (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("segment encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame payload of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("declared frame length {0} exceeds the limit")]
    TooLarge(usize),
    #[error("{0} bytes after the packet")]
    Trailing(usize),
    #[error("unsupported segment protocol version {0}")]
    Version(u8),
    #[error("segment decoding failed: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = vec![0u8; LEN_SIZE];
    bincode::serialize_into(&mut out, packet)?;
    let len = out.len() - LEN_SIZE;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(len));
    }
    out[..LEN_SIZE].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(out)
}

/// Declared payload length, once the prefix is complete.
fn declared_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let prefix: [u8; LEN_SIZE] = bytes
        .get(..LEN_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode the frame at the front of `bytes`; returns the packet and the
/// bytes consumed. `NeedMore` means the caller should retry with more input.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let len = declared_len(bytes)?;
    let end = LEN_SIZE + len;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    let packet: Packet = bincode::deserialize(body)?;
    if packet.version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::Version(packet.version));
    }
    Ok((packet, end))
}

/// Decode a whole overlay frame, which must hold exactly one packet.
pub fn decode_exact(frame: &[u8]) -> Result<Packet, FrameDecodeError> {
    let (packet, used) = decode_frame(frame)?;
    match frame.len() - used {
        0 => Ok(packet),
        extra => Err(FrameDecodeError::Trailing(extra)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Segment;

    fn data(payload: &[u8]) -> Packet {
        Packet::new(
            "10.147.17.1".parse().unwrap(),
            "10.147.17.2".parse().unwrap(),
            Segment::Data {
                src_port: 49152,
                dst_port: 7000,
                payload: payload.to_vec(),
            },
        )
    }

    #[test]
    fn truncated_input_needs_more() {
        let frame = encode_frame(&data(b"hello")).unwrap();
        for cut in [0, 3, frame.len() - 1] {
            assert!(matches!(decode_frame(&frame[..cut]), Err(FrameDecodeError::NeedMore)));
        }
    }

    #[test]
    fn oversized_declaration_is_rejected_before_reading() {
        let mut bogus = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&bogus), Err(FrameDecodeError::TooLarge(_))));
    }

    #[test]
    fn stream_of_frames_splits_cleanly() {
        let a = data(b"first");
        let b = Packet::new(
            "fd80::1".parse().unwrap(),
            "fd80::2".parse().unwrap(),
            Segment::Fin {
                src_port: 1,
                dst_port: 2,
            },
        );
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend(encode_frame(&b).unwrap());
        let (p1, n1) = decode_frame(&buf).unwrap();
        assert_eq!((p1, n1), (a, first_len));
        let (p2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert_eq!(p2.segment.ports(), (1, 2));
    }

    #[test]
    fn exact_decode_rejects_trailing_bytes() {
        let mut frame = encode_frame(&data(b"x")).unwrap();
        assert!(decode_exact(&frame).is_ok());
        frame.push(0);
        assert!(matches!(decode_exact(&frame), Err(FrameDecodeError::Trailing(1))));
    }

    #[test]
    fn foreign_version_is_rejected() {
        let mut p = data(b"x");
        p.version = PROTOCOL_VERSION + 1;
        let frame = encode_frame(&p).unwrap();
        assert!(matches!(
            decode_exact(&frame),
            Err(FrameDecodeError::Version(v)) if v == PROTOCOL_VERSION + 1
        ));
    }
}

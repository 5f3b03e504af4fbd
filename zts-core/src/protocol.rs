//! Segments exchanged between virtual stacks, carried inside overlay frames.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Current segment protocol version. Frames with another version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Transport segment. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Open a stream. `window` is the opener's receive capacity.
    Syn {
        src_port: u16,
        dst_port: u16,
        window: u32,
    },
    /// Stream accepted.
    SynAck {
        src_port: u16,
        dst_port: u16,
        window: u32,
    },
    /// Refuse or abort a stream.
    Rst { src_port: u16, dst_port: u16 },
    /// Stream payload.
    Data {
        src_port: u16,
        dst_port: u16,
        payload: Vec<u8>,
    },
    /// Receiver consumed `consumed` bytes; sender may transmit that much more.
    Window {
        src_port: u16,
        dst_port: u16,
        consumed: u32,
    },
    /// Sender will transmit no more data.
    Fin { src_port: u16, dst_port: u16 },
    /// Unreliable datagram.
    Datagram {
        src_port: u16,
        dst_port: u16,
        payload: Vec<u8>,
    },
}

impl Segment {
    pub fn ports(&self) -> (u16, u16) {
        match *self {
            Segment::Syn {
                src_port, dst_port, ..
            }
            | Segment::SynAck {
                src_port, dst_port, ..
            }
            | Segment::Rst { src_port, dst_port }
            | Segment::Data {
                src_port, dst_port, ..
            }
            | Segment::Window {
                src_port, dst_port, ..
            }
            | Segment::Fin { src_port, dst_port }
            | Segment::Datagram {
                src_port, dst_port, ..
            } => (src_port, dst_port),
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Segment::Datagram { .. })
    }
}

/// A segment with its virtual IP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub segment: Segment,
}

impl Packet {
    pub fn new(src: IpAddr, dst: IpAddr, segment: Segment) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            src,
            dst,
            segment,
        }
    }
}

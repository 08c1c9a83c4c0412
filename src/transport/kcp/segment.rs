//! KCP segment wire codec.
//!
//! One segment per datagram:
//!
//! ```text
//! | conv u32 | cmd u8 | wnd u16 | sn u32 | una u32 | payload... |
//! ```
//!
//! `sn` is the sequence number of PUSH and BYE segments, or the
//! acknowledged sequence number of an ACK. `una` is the cumulative
//! acknowledgement: the next sequence number the sender of this segment
//! expects, acknowledging everything below it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Push,
    Ack,
    Ping,
    Bye,
}

impl Command {
    fn to_byte(self) -> u8 {
        match self {
            Command::Push => 0x01,
            Command::Ack => 0x02,
            Command::Ping => 0x03,
            Command::Bye => 0x04,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Command::Push),
            0x02 => Ok(Command::Ack),
            0x03 => Ok(Command::Ping),
            0x04 => Ok(Command::Bye),
            other => Err(Error::Protocol(format!("unknown KCP command: {:#x}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: Command,
    pub wnd: u16,
    pub sn: u32,
    pub una: u32,
    pub payload: Bytes,
}

impl Segment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.conv);
        buf.put_u8(self.cmd.to_byte());
        buf.put_u16(self.wnd);
        buf.put_u32(self.sn);
        buf.put_u32(self.una);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Segment> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Protocol("KCP segment too short".into()));
        }
        let conv = data.get_u32();
        let cmd = Command::from_byte(data.get_u8())?;
        let wnd = data.get_u16();
        let sn = data.get_u32();
        let una = data.get_u32();
        Ok(Segment {
            conv,
            cmd,
            wnd,
            sn,
            una,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let seg = Segment {
            conv: 0xdead_beef,
            cmd: Command::Push,
            wnd: 64,
            sn: 42,
            una: 40,
            payload: Bytes::from_static(b"payload bytes"),
        };
        let decoded = Segment::decode(seg.encode()).unwrap();
        assert_eq!(decoded.conv, seg.conv);
        assert_eq!(decoded.cmd, seg.cmd);
        assert_eq!(decoded.wnd, seg.wnd);
        assert_eq!(decoded.sn, seg.sn);
        assert_eq!(decoded.una, seg.una);
        assert_eq!(decoded.payload, seg.payload);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(Segment::decode(Bytes::from_static(b"short")).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut seg = Segment {
            conv: 1,
            cmd: Command::Push,
            wnd: 0,
            sn: 0,
            una: 0,
            payload: Bytes::new(),
        }
        .encode()
        .to_vec();
        seg[4] = 0x7f;
        assert!(Segment::decode(Bytes::from(seg)).is_err());
    }
}

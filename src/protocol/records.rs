use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::task::Task;

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 1;

/// protocol discriminator carried in handshake and acknowledgement messages
pub const PROTOCOL_ID: u16 = 17;

/// client -> server handshake message type
pub const MSG_TYPE_CLIENT_HELLO: u16 = 22;
/// server -> client acknowledgement message type
pub const MSG_TYPE_SERVER_ACK: u16 = 2;

/// server -> client task record type
pub const RECORD_TYPE_TASK: u16 = 1;
/// client -> server answer record type
pub const RECORD_TYPE_ANSWER: u16 = 2;

pub const ACK_OK: u32 = 1;
pub const ACK_NOT_OK: u32 = 2;

/// The 12-byte control record, all fields big-endian with no padding:
///
/// ```ascii
/// 0:  type: u16
/// 2:  message: u32
/// 6:  protocol: u16
/// 8:  major_version: u16
/// 10: minor_version: u16
/// ```
///
/// Clients send it as a handshake (`type=22, protocol=17`), the server sends it
///  as the final acknowledgement (`type=2, message=1|2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcMessage {
    pub msg_type: u16,
    pub message: u32,
    pub protocol: u16,
    pub major_version: u16,
    pub minor_version: u16,
}

impl CalcMessage {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn client_hello() -> CalcMessage {
        CalcMessage {
            msg_type: MSG_TYPE_CLIENT_HELLO,
            message: 1,
            protocol: PROTOCOL_ID,
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
        }
    }

    pub fn ack(ok: bool) -> CalcMessage {
        CalcMessage {
            msg_type: MSG_TYPE_SERVER_ACK,
            message: if ok { ACK_OK } else { ACK_NOT_OK },
            protocol: PROTOCOL_ID,
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
        }
    }

    pub fn version_matches(&self) -> bool {
        self.major_version == VERSION_MAJOR && self.minor_version == VERSION_MINOR
    }

    pub fn is_client_hello(&self) -> bool {
        self.msg_type == MSG_TYPE_CLIENT_HELLO && self.protocol == PROTOCOL_ID && self.version_matches()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.msg_type);
        buf.put_u32(self.message);
        buf.put_u16(self.protocol);
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
    }

    pub fn try_deser(datagram: &[u8]) -> anyhow::Result<CalcMessage> {
        if datagram.len() != Self::SERIALIZED_LEN {
            bail!("calc message must be exactly {} bytes, got {}", Self::SERIALIZED_LEN, datagram.len());
        }
        let buf = &mut &datagram[..];

        Ok(CalcMessage {
            msg_type: buf.try_get_u16()?,
            message: buf.try_get_u32()?,
            protocol: buf.try_get_u16()?,
            major_version: buf.try_get_u16()?,
            minor_version: buf.try_get_u16()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.to_vec()
    }
}

/// The 26-byte task / answer record, all fields big-endian with no padding:
///
/// ```ascii
/// 0:  type: u16
/// 2:  major_version: u16
/// 4:  minor_version: u16
/// 6:  id: u32
/// 10: op: u32
/// 14: v1: i32
/// 18: v2: i32
/// 22: result: i32
/// ```
///
/// The server sends it with `type=1` (task, result 0), clients send it back
///  with `type=2` and their result filled in. A client record with `id=0` is a
///  request for a (re)send rather than an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcProtocol {
    pub record_type: u16,
    pub major_version: u16,
    pub minor_version: u16,
    pub id: u32,
    pub op: u32,
    pub v1: i32,
    pub v2: i32,
    pub result: i32,
}

impl CalcProtocol {
    pub const SERIALIZED_LEN: usize = 26;

    pub fn task(task: &Task) -> CalcProtocol {
        CalcProtocol {
            record_type: RECORD_TYPE_TASK,
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            id: task.id,
            op: task.op.into(),
            v1: task.v1,
            v2: task.v2,
            result: 0,
        }
    }

    pub fn answer(id: u32, op: u32, v1: i32, v2: i32, result: i32) -> CalcProtocol {
        CalcProtocol {
            record_type: RECORD_TYPE_ANSWER,
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            id,
            op,
            v1,
            v2,
            result,
        }
    }

    pub fn version_matches(&self) -> bool {
        self.major_version == VERSION_MAJOR && self.minor_version == VERSION_MINOR
    }

    pub fn is_all_zero(&self) -> bool {
        self.record_type == 0
            && self.major_version == 0
            && self.minor_version == 0
            && self.id == 0
            && self.op == 0
            && self.v1 == 0
            && self.v2 == 0
            && self.result == 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.record_type);
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u32(self.id);
        buf.put_u32(self.op);
        buf.put_i32(self.v1);
        buf.put_i32(self.v2);
        buf.put_i32(self.result);
    }

    pub fn try_deser(datagram: &[u8]) -> anyhow::Result<CalcProtocol> {
        if datagram.len() != Self::SERIALIZED_LEN {
            bail!("calc protocol record must be exactly {} bytes, got {}", Self::SERIALIZED_LEN, datagram.len());
        }
        let buf = &mut &datagram[..];

        Ok(CalcProtocol {
            record_type: buf.try_get_u16()?,
            major_version: buf.try_get_u16()?,
            minor_version: buf.try_get_u16()?,
            id: buf.try_get_u32()?,
            op: buf.try_get_u32()?,
            v1: buf.try_get_u32()? as i32,
            v2: buf.try_get_u32()? as i32,
            result: buf.try_get_u32()? as i32,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.to_vec()
    }
}

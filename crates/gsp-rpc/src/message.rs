//! RPC function ids, result codes and the owned message type.

use core::fmt;

use crate::error::TransportFault;
use crate::layout::RpcHeader;

/// RPC function id as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Function(pub u32);

impl Function {
    pub const NOP: Self = Self(0);
    pub const SET_GUEST_SYSTEM_INFO: Self = Self(1);
    pub const ALLOC_ROOT: Self = Self(2);
    pub const ALLOC_MEMORY: Self = Self(4);
    pub const ALLOC_OBJECT: Self = Self(9);
    pub const FREE: Self = Self(10);
    pub const LOG: Self = Self(11);
    pub const MAP_MEMORY_DMA: Self = Self(14);
    pub const UNMAP_MEMORY_DMA: Self = Self(15);
    pub const UNLOADING_GUEST_DRIVER: Self = Self(47);
    pub const GSP_RM_CONTROL: Self = Self(76);
    pub const SAVE_HIBERNATION_DATA: Self = Self(137);
    pub const RESTORE_HIBERNATION_DATA: Self = Self(138);
    /// Tags every element after the first of a multi-record message.
    pub const CONTINUATION_RECORD: Self = Self(0xFFE);

    /// Peer-initiated events start here.
    pub const FIRST_EVENT: Self = Self(0x1000);
    pub const EVENT_POST_EVENT: Self = Self(0x1004);
    pub const EVENT_RC_TRIGGERED: Self = Self(0x1005);
    pub const EVENT_OS_ERROR_LOG: Self = Self(0x1006);
    pub const EVENT_GSP_LOCKDOWN_NOTICE: Self = Self(0x1020);

    pub fn is_event(self) -> bool {
        self.0 >= Self::FIRST_EVENT.0
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NOP => "NOP",
            Self::SET_GUEST_SYSTEM_INFO => "SET_GUEST_SYSTEM_INFO",
            Self::ALLOC_ROOT => "ALLOC_ROOT",
            Self::ALLOC_MEMORY => "ALLOC_MEMORY",
            Self::ALLOC_OBJECT => "ALLOC_OBJECT",
            Self::FREE => "FREE",
            Self::LOG => "LOG",
            Self::MAP_MEMORY_DMA => "MAP_MEMORY_DMA",
            Self::UNMAP_MEMORY_DMA => "UNMAP_MEMORY_DMA",
            Self::UNLOADING_GUEST_DRIVER => "UNLOADING_GUEST_DRIVER",
            Self::GSP_RM_CONTROL => "GSP_RM_CONTROL",
            Self::SAVE_HIBERNATION_DATA => "SAVE_HIBERNATION_DATA",
            Self::RESTORE_HIBERNATION_DATA => "RESTORE_HIBERNATION_DATA",
            Self::CONTINUATION_RECORD => "CONTINUATION_RECORD",
            Self::EVENT_POST_EVENT => "POST_EVENT",
            Self::EVENT_RC_TRIGGERED => "RC_TRIGGERED",
            Self::EVENT_OS_ERROR_LOG => "OS_ERROR_LOG",
            Self::EVENT_GSP_LOCKDOWN_NOTICE => "GSP_LOCKDOWN_NOTICE",
            _ => return None,
        })
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "FUNCTION({:#x})", self.0),
        }
    }
}

impl From<u32> for Function {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

pub const RESULT_SUCCESS: u32 = 0;
/// Written into requests; the peer overwrites it with the outcome.
pub const RESULT_PENDING: u32 = 0xFFFF_FFFF;
/// Codes at or above this value are reserved for the peer's own transport and
/// are collapsed into a generic failure.
pub const RESULT_RESERVED_BASE: u32 = 0xFF00_0000;

/// One RPC request, response or event with its own body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub function: Function,
    pub rpc_result: u32,
    pub rpc_result_private: u32,
    pub body: Vec<u8>,
}

impl RpcMessage {
    pub fn new(function: Function, body: impl Into<Vec<u8>>) -> Self {
        Self {
            function,
            rpc_result: RESULT_PENDING,
            rpc_result_private: RESULT_PENDING,
            body: body.into(),
        }
    }

    pub fn response(function: Function, rpc_result: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            function,
            rpc_result,
            rpc_result_private: rpc_result,
            body: body.into(),
        }
    }

    /// RPC header plus body.
    pub fn record_len(&self) -> usize {
        RpcHeader::SIZE_BYTES + self.body.len()
    }

    pub fn header(&self) -> RpcHeader {
        RpcHeader {
            function: self.function.0,
            length: self.record_len() as u32,
            rpc_result: self.rpc_result,
            rpc_result_private: self.rpc_result_private,
        }
    }

    pub fn encode_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record_len());
        out.extend_from_slice(bytemuck::bytes_of(&self.header()));
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a record, trusting `length` only within `bytes`.
    pub fn decode_record(bytes: &[u8]) -> Result<Self, TransportFault> {
        if bytes.len() < RpcHeader::SIZE_BYTES {
            return Err(TransportFault::Malformed("record shorter than the RPC header"));
        }
        let header: RpcHeader = bytemuck::pod_read_unaligned(&bytes[..RpcHeader::SIZE_BYTES]);
        let len = header.length as usize;
        if len < RpcHeader::SIZE_BYTES || len > bytes.len() {
            return Err(TransportFault::Malformed("record length out of range"));
        }
        Ok(Self {
            function: Function(header.function),
            rpc_result: header.rpc_result,
            rpc_result_private: header.rpc_result_private,
            body: bytes[RpcHeader::SIZE_BYTES..len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip_drops_padding() {
        let msg = RpcMessage::response(Function(42), RESULT_SUCCESS, b"AB".to_vec());
        let mut record = msg.encode_record();
        assert_eq!(record.len(), 18);
        record.extend_from_slice(&[0; 14]);
        assert_eq!(RpcMessage::decode_record(&record).unwrap(), msg);
    }

    #[test]
    fn record_length_is_validated() {
        let mut record = RpcMessage::new(Function::NOP, vec![1, 2, 3]).encode_record();
        record[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert!(RpcMessage::decode_record(&record).is_err());
        record[4..8].copy_from_slice(&8u32.to_le_bytes());
        assert!(RpcMessage::decode_record(&record).is_err());
    }

    #[test]
    fn function_display() {
        assert_eq!(Function::GSP_RM_CONTROL.to_string(), "GSP_RM_CONTROL");
        assert_eq!(Function(0x777).to_string(), "FUNCTION(0x777)");
        assert!(Function::EVENT_OS_ERROR_LOG.is_event());
        assert!(!Function::CONTINUATION_RECORD.is_event());
    }
}

//! Records whose size is only known at runtime.
//!
//! Both are flattened into one heap buffer sized to the whole record and sent
//! through the large-message path, so a nested array that would not fit one
//! element never has to be split by hand.

use crate::error::{Result, TransportFault};
use crate::layout::GSP_PAGE_SHIFT;
use crate::message::{Function, RpcMessage};
use crate::rpc::{RpcEngine, RpcTransport};

/// `GSP_RM_CONTROL` body: object handles, command and parameter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmControl {
    pub h_client: u32,
    pub h_object: u32,
    pub cmd: u32,
    pub params: Vec<u8>,
}

impl RmControl {
    pub const FIXED_BYTES: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::FIXED_BYTES + self.params.len());
        body.extend_from_slice(&self.h_client.to_le_bytes());
        body.extend_from_slice(&self.h_object.to_le_bytes());
        body.extend_from_slice(&self.cmd.to_le_bytes());
        body.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.params);
        body
    }

    pub fn decode(body: &[u8]) -> core::result::Result<Self, TransportFault> {
        let params_len = read_u32(body, 12)? as usize;
        let params = body
            .get(Self::FIXED_BYTES..Self::FIXED_BYTES + params_len)
            .ok_or(TransportFault::Malformed("control parameters truncated"))?;
        Ok(Self {
            h_client: read_u32(body, 0)?,
            h_object: read_u32(body, 4)?,
            cmd: read_u32(body, 8)?,
            params: params.to_vec(),
        })
    }
}

/// Page table entry list describing guest memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PteDesc {
    /// Indirection level; `0` means `entries` are frame numbers.
    pub idr: u32,
    pub entries: Vec<u64>,
}

impl PteDesc {
    pub const HEADER_BYTES: usize = 8;

    /// Frame numbers of arbitrary page addresses.
    pub fn from_pages(pages: &[u64]) -> Self {
        Self {
            idr: 0,
            entries: pages.iter().map(|addr| addr >> GSP_PAGE_SHIFT).collect(),
        }
    }

    /// Frame numbers of `count` pages starting at `base`.
    pub fn contiguous(base: u64, count: usize) -> Self {
        let first = base >> GSP_PAGE_SHIFT;
        Self {
            idr: 0,
            entries: (0..count as u64).map(|i| first + i).collect(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_BYTES + 8 * self.entries.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.idr.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for pte in &self.entries {
            out.extend_from_slice(&pte.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> core::result::Result<Self, TransportFault> {
        let idr = read_u32(bytes, 0)?;
        let count = read_u32(bytes, 4)? as usize;
        let table = bytes
            .get(Self::HEADER_BYTES..Self::HEADER_BYTES + 8 * count)
            .ok_or(TransportFault::Malformed("PTE list truncated"))?;
        let entries = table
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self { idr, entries })
    }
}

/// `ALLOC_MEMORY` body: handles and flags followed by a [`PteDesc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocMemory {
    pub h_client: u32,
    pub h_device: u32,
    pub h_memory: u32,
    pub h_class: u32,
    pub flags: u32,
    pub pte_desc: PteDesc,
}

impl AllocMemory {
    pub const FIXED_BYTES: usize = 20;

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::FIXED_BYTES + self.pte_desc.encoded_len());
        for word in [self.h_client, self.h_device, self.h_memory, self.h_class, self.flags] {
            body.extend_from_slice(&word.to_le_bytes());
        }
        self.pte_desc.encode_into(&mut body);
        body
    }

    pub fn decode(body: &[u8]) -> core::result::Result<Self, TransportFault> {
        let pte_desc = PteDesc::decode(
            body.get(Self::FIXED_BYTES..)
                .ok_or(TransportFault::Malformed("allocation record truncated"))?,
        )?;
        Ok(Self {
            h_client: read_u32(body, 0)?,
            h_device: read_u32(body, 4)?,
            h_memory: read_u32(body, 8)?,
            h_class: read_u32(body, 12)?,
            flags: read_u32(body, 16)?,
            pte_desc,
        })
    }
}

/// Full body length of a record, read from its first piece.
///
/// `None` for functions whose records always fit one element.
pub fn declared_body_len(function: Function, first_body: &[u8]) -> Option<usize> {
    match function {
        Function::GSP_RM_CONTROL => {
            let params = read_u32(first_body, 12).ok()? as usize;
            Some(RmControl::FIXED_BYTES + params)
        }
        Function::ALLOC_MEMORY => {
            let count = read_u32(first_body, AllocMemory::FIXED_BYTES + 4).ok()? as usize;
            Some(AllocMemory::FIXED_BYTES + PteDesc::HEADER_BYTES + 8 * count)
        }
        _ => None,
    }
}

fn read_u32(bytes: &[u8], off: usize) -> core::result::Result<u32, TransportFault> {
    bytes
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(TransportFault::Malformed("record truncated"))
}

impl<T: RpcTransport> RpcEngine<T> {
    /// Issues a control call; the peer answers with the updated parameters.
    pub fn rm_control(&mut self, ctrl: &RmControl) -> Result<RmControl> {
        let resp = self.call_large(RpcMessage::new(Function::GSP_RM_CONTROL, ctrl.encode()), true)?;
        Ok(RmControl::decode(&resp.body)?)
    }

    pub fn alloc_memory(&mut self, alloc: &AllocMemory) -> Result<()> {
        self.call_large(RpcMessage::new(Function::ALLOC_MEMORY, alloc.encode()), false)?;
        Ok(())
    }
}

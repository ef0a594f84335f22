//! Shared memory layout contract between the CPU driver and the GSP.
//!
//! The CPU allocates one region and splits it, page aligned, into:
//!
//! - a page table with one 64-bit entry per page of the whole region
//! - the command queue (CPU → GSP): one header page followed by entry slots
//! - the status queue (GSP → CPU): one header page followed by entry slots
//!
//! Each queue header page is written only by the producer of that queue. It
//! carries the producer's write pointer in its tx header and, in its rx
//! header, the producer's read pointer into the *other* queue.

use bytemuck::{Pod, Zeroable};
use core::mem::{offset_of, size_of};

use crate::error::ConfigError;

pub const GSP_PAGE_SHIFT: u32 = 12;
pub const GSP_PAGE_SIZE: usize = 1 << GSP_PAGE_SHIFT;

/// Smallest page (minimum element) size accepted by [`SharedLayout::new`].
///
/// Real hardware uses [`GSP_PAGE_SIZE`]; smaller pages keep tests tiny.
pub const MIN_PAGE_SIZE: usize = 64;

/// A logical element spans at most this many slots.
pub const MAX_ELEMENT_SLOTS: usize = 16;

pub const MSGQ_VERSION: u32 = 0;
pub const MSGQ_FLAGS_SWAP_RX: u32 = 1;

/// Header at the start of every queue element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MsgElementHeader {
    pub auth_tag: [u8; 16],
    pub aad: [u8; 16],
    pub checksum: u32,
    pub seq_num: u32,
    pub elem_count: u32,
}

impl MsgElementHeader {
    pub const SIZE_BYTES: usize = size_of::<Self>();
    pub const CHECKSUM_OFFSET: usize = offset_of!(MsgElementHeader, checksum);
}

/// RPC header that follows the element header.
///
/// `length` counts this header plus the body bytes carried in the same element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RpcHeader {
    pub function: u32,
    pub length: u32,
    pub rpc_result: u32,
    pub rpc_result_private: u32,
}

impl RpcHeader {
    pub const SIZE_BYTES: usize = size_of::<Self>();
}

/// Producer-owned part of a queue header page.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MsgqTxHeader {
    pub version: u32,
    pub size: u32,
    pub msg_size: u32,
    pub msg_count: u32,
    pub write_ptr: u32,
    pub flags: u32,
    pub rx_hdr_off: u32,
    pub entry_off: u32,
}

impl MsgqTxHeader {
    pub const SIZE_BYTES: usize = size_of::<Self>();
    pub const WRITE_PTR_OFFSET: usize = offset_of!(MsgqTxHeader, write_ptr);
}

/// Consumer state for the opposite queue, stored after the tx header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MsgqRxHeader {
    pub read_ptr: u32,
}

impl MsgqRxHeader {
    pub const OFFSET: usize = MsgqTxHeader::SIZE_BYTES;
    pub const READ_PTR_OFFSET: usize = Self::OFFSET + offset_of!(MsgqRxHeader, read_ptr);
}

/// One queue: header page plus `slots` entries of `page_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRegion {
    pub header_offset: usize,
    pub entries_offset: usize,
    pub slots: u32,
    pub size_bytes: usize,
}

impl QueueRegion {
    pub fn write_ptr_offset(&self) -> usize {
        self.header_offset + MsgqTxHeader::WRITE_PTR_OFFSET
    }

    /// Where the producer of *this* queue publishes its read pointer into the
    /// opposite queue.
    pub fn rx_read_ptr_offset(&self) -> usize {
        self.header_offset + MsgqRxHeader::READ_PTR_OFFSET
    }

    pub fn tx_header(&self, page_size: usize) -> MsgqTxHeader {
        MsgqTxHeader {
            version: MSGQ_VERSION,
            size: self.size_bytes as u32,
            msg_size: page_size as u32,
            msg_count: self.slots,
            write_ptr: 0,
            flags: MSGQ_FLAGS_SWAP_RX,
            rx_hdr_off: MsgqRxHeader::OFFSET as u32,
            entry_off: (self.entries_offset - self.header_offset) as u32,
        }
    }
}

/// Geometry of the whole shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLayout {
    pub page_size: usize,
    pub page_table_bytes: usize,
    pub cmdq: QueueRegion,
    pub statq: QueueRegion,
    pub total_bytes: usize,
}

impl SharedLayout {
    /// Computes the layout for two queues of the given sizes (header page
    /// included).
    pub fn new(page_size: usize, cmdq_bytes: usize, statq_bytes: usize) -> Result<Self, ConfigError> {
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::Invalid("page size must be a power of two of at least 64 bytes"));
        }
        for bytes in [cmdq_bytes, statq_bytes] {
            if bytes % page_size != 0 {
                return Err(ConfigError::Invalid("queue size must be page aligned"));
            }
            // Header page plus two slots: one usable, one always empty.
            if bytes < 3 * page_size {
                return Err(ConfigError::Invalid("queue needs a header page and at least two slots"));
            }
            if bytes / page_size > u32::MAX as usize {
                return Err(ConfigError::Invalid("queue size out of range"));
            }
        }

        let queue_pages = (cmdq_bytes + statq_bytes) / page_size;
        // The page table describes itself too.
        let mut pt_pages = 1;
        loop {
            let needed = ((pt_pages + queue_pages) * size_of::<u64>()).div_ceil(page_size);
            if needed <= pt_pages {
                break;
            }
            pt_pages = needed;
        }
        let page_table_bytes = pt_pages * page_size;

        let cmdq = queue_region(page_table_bytes, cmdq_bytes, page_size);
        let statq = queue_region(page_table_bytes + cmdq_bytes, statq_bytes, page_size);

        Ok(Self {
            page_size,
            page_table_bytes,
            cmdq,
            statq,
            total_bytes: page_table_bytes + cmdq_bytes + statq_bytes,
        })
    }

    pub fn page_count(&self) -> usize {
        self.total_bytes / self.page_size
    }

    /// Page table contents for a region mapped at `base_addr`.
    pub fn page_table(&self, base_addr: u64) -> Vec<u64> {
        (0..self.page_count())
            .map(|i| base_addr + (i * self.page_size) as u64)
            .collect()
    }

    /// Largest element that fits both the slot limit and the smaller queue.
    pub fn max_element_bytes(&self) -> usize {
        let slots = self.cmdq.slots.min(self.statq.slots) as usize - 1;
        MAX_ELEMENT_SLOTS.min(slots) * self.page_size
    }

    /// Largest record (RPC header plus body) one element can carry.
    pub fn max_record_bytes(&self) -> usize {
        self.max_element_bytes() - MsgElementHeader::SIZE_BYTES
    }
}

fn queue_region(offset: usize, bytes: usize, page_size: usize) -> QueueRegion {
    QueueRegion {
        header_offset: offset,
        entries_offset: offset + page_size,
        slots: (bytes / page_size - 1) as u32,
        size_bytes: bytes,
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

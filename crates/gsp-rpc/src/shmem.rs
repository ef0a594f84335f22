//! Byte region visible to both processors.
//!
//! Control words are only touched through [`SharedMemory::u32_at`]; payload
//! bytes are copied in and out with plain copies ordered by fences around the
//! control word updates.

use core::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::layout::SharedLayout;

/// In-memory stand-in for a DMA-coherent mapping.
pub struct SharedMemory {
    len: usize,
    data_ptr: *mut u8,
    // u64 backing keeps every control word naturally aligned.
    _storage: Box<[u64]>,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    pub fn new(len: usize) -> Self {
        let mut storage = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr().cast::<u8>();
        Self {
            len,
            data_ptr,
            _storage: storage,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomic view of the 32-bit word at `offset`.
    pub fn u32_at(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "control word out of bounds");
        // SAFETY: in bounds and 4-byte aligned; the storage outlives the borrow.
        unsafe { AtomicU32::from_ptr(self.data_ptr.add(offset).cast::<u32>()) }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write out of bounds");
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr.add(offset), data.len());
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "read out of bounds");
        unsafe {
            core::ptr::copy_nonoverlapping(self.data_ptr.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len, "fill out of bounds");
        unsafe {
            core::ptr::write_bytes(self.data_ptr.add(offset), byte, len);
        }
    }
}

/// The RPC region: page table plus both queues, initialised by the CPU.
#[derive(Clone)]
pub struct SharedRegion {
    mem: Arc<SharedMemory>,
    layout: SharedLayout,
}

impl SharedRegion {
    /// Allocates the region and writes the page table and both tx headers.
    pub fn new(layout: SharedLayout, base_addr: u64) -> Self {
        let mem = SharedMemory::new(layout.total_bytes);

        let mut off = 0;
        for pte in layout.page_table(base_addr) {
            mem.write(off, &pte.to_le_bytes());
            off += 8;
        }
        for queue in [layout.cmdq, layout.statq] {
            let tx = queue.tx_header(layout.page_size);
            mem.write(queue.header_offset, bytemuck::bytes_of(&tx));
        }

        tracing::debug!(
            total_bytes = layout.total_bytes,
            cmdq_slots = layout.cmdq.slots,
            statq_slots = layout.statq.slots,
            "initialised GSP shared region"
        );

        Self {
            mem: Arc::new(mem),
            layout,
        }
    }

    pub fn layout(&self) -> &SharedLayout {
        &self.layout
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MsgqTxHeader;
    use core::sync::atomic::Ordering;

    #[test]
    fn control_words_are_shared() {
        let mem = SharedMemory::new(64);
        mem.u32_at(8).store(7, Ordering::Release);
        let mut word = [0u8; 4];
        mem.read(8, &mut word);
        assert_eq!(u32::from_le_bytes(word), 7);
    }

    #[test]
    fn region_init_writes_headers_and_page_table() {
        let layout = SharedLayout::new(64, 4 * 64, 4 * 64).unwrap();
        let region = SharedRegion::new(layout, 0x10_0000);
        let mem = region.memory();

        let pte1 = u64::from_le_bytes(mem.read_vec(8, 8).try_into().unwrap());
        assert_eq!(pte1, 0x10_0040);

        let raw = mem.read_vec(layout.statq.header_offset, MsgqTxHeader::SIZE_BYTES);
        let tx: MsgqTxHeader = bytemuck::pod_read_unaligned(&raw);
        assert_eq!(tx.msg_count, 3);
        assert_eq!(tx.msg_size, 64);
        assert_eq!(tx.entry_off, 64);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_write_panics() {
        SharedMemory::new(16).write(12, &[0; 8]);
    }
}

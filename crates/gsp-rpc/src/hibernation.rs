//! Hibernation save/restore stream.
//!
//! A dedicated circular byte buffer with one `get`/`put` cursor pair per
//! direction and a "more data" flag per direction. Save moves the peer's
//! state to the CPU; restore moves it back. Both run inside the synchronous
//! `SAVE_HIBERNATION_DATA` / `RESTORE_HIBERNATION_DATA` calls: the request is
//! sent, the stream is pumped, then the call's response is awaited. The
//! status queue is watched while pumping, so a peer that refuses the call ends
//! it with its own result code instead of a stalled stream.

use core::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Result, RpcError};
use crate::message::{Function, RpcMessage};
use crate::poll::poll_until;
use crate::rpc::{RpcEngine, RpcTransport};
use crate::shmem::SharedMemory;

/// Byte offsets of the shared header words.
pub mod header {
    pub const SAVE_GET: usize = 0;
    pub const SAVE_PUT: usize = 4;
    pub const RESTORE_GET: usize = 8;
    pub const RESTORE_PUT: usize = 12;
    pub const SAVE_MORE: usize = 16;
    pub const RESTORE_MORE: usize = 20;
    pub const SIZE: usize = 24;
    pub const BYTES: usize = 64;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HibernationError {
    #[error("staging buffer would need {needed} bytes, limit is {max}")]
    StagingOverflow { needed: usize, max: usize },
    #[error("hibernation cursor out of range")]
    CursorOutOfRange,
}

/// Bytes the consumer can read.
pub fn available_bytes(get: u32, put: u32, size: u32) -> u32 {
    ((u64::from(size) + u64::from(put) - u64::from(get)) % u64::from(size)) as u32
}

/// Bytes the producer can write; one byte always stays free.
pub fn free_bytes(get: u32, put: u32, size: u32) -> u32 {
    ((u64::from(size) - 1 + u64::from(get) - u64::from(put)) % u64::from(size)) as u32
}

/// Host-side buffer for a saved blob; doubles on demand up to `max` bytes.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Vec<u8>,
    max: usize,
}

impl StagingBuffer {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial.min(max)),
            max,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) -> core::result::Result<(), HibernationError> {
        let needed = self.data.len() + bytes.len();
        if needed > self.max {
            return Err(HibernationError::StagingOverflow {
                needed,
                max: self.max,
            });
        }
        if needed > self.data.capacity() {
            let mut cap = self.data.capacity().max(1);
            while cap < needed {
                cap *= 2;
            }
            let cap = cap.min(self.max);
            self.data.reserve_exact(cap - self.data.len());
            tracing::trace!(capacity = cap, "grew hibernation staging buffer");
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub save_get: u32,
    pub save_put: u32,
    pub restore_get: u32,
    pub restore_put: u32,
}

struct Direction {
    get: usize,
    put: usize,
    more: usize,
}

const SAVE: Direction = Direction {
    get: header::SAVE_GET,
    put: header::SAVE_PUT,
    more: header::SAVE_MORE,
};

const RESTORE: Direction = Direction {
    get: header::RESTORE_GET,
    put: header::RESTORE_PUT,
    more: header::RESTORE_MORE,
};

/// Shared header plus data ring.
#[derive(Clone)]
pub struct HibernationBuffer {
    mem: Arc<SharedMemory>,
    size: u32,
}

impl HibernationBuffer {
    pub fn new(size: u32) -> Self {
        assert!(size >= 2, "hibernation buffer needs at least two bytes");
        let mem = SharedMemory::new(header::BYTES + size as usize);
        mem.u32_at(header::SIZE).store(size, Ordering::Relaxed);
        Self {
            mem: Arc::new(mem),
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn cursors(&self) -> Cursors {
        Cursors {
            save_get: self.word(header::SAVE_GET).load(Ordering::Acquire),
            save_put: self.word(header::SAVE_PUT).load(Ordering::Acquire),
            restore_get: self.word(header::RESTORE_GET).load(Ordering::Acquire),
            restore_put: self.word(header::RESTORE_PUT).load(Ordering::Acquire),
        }
    }

    fn word(&self, off: usize) -> &AtomicU32 {
        self.mem.u32_at(off)
    }

    fn data_offset(&self, pos: u32) -> usize {
        header::BYTES + pos as usize
    }

    fn set_more(&self, dir: &Direction, more: bool) {
        self.word(dir.more).store(u32::from(more), Ordering::Release);
    }

    /// Producer loop: writes all of `data`, waiting for free space.
    ///
    /// `watch` runs on every poll; an error from it ends the loop.
    fn push(
        &self,
        dir: &Direction,
        data: &[u8],
        timeout: Duration,
        mut watch: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        let size = self.size;
        let mut sent = 0;
        while sent < data.len() {
            let (get, put) = poll_until(timeout, || {
                watch()?;
                let get = self.word(dir.get).load(Ordering::Acquire);
                let put = self.word(dir.put).load(Ordering::Relaxed);
                if get >= size || put >= size {
                    return Err(RpcError::from(HibernationError::CursorOutOfRange));
                }
                Ok((free_bytes(get, put, size) > 0).then_some((get, put)))
            })?;
            let n = (data.len() - sent)
                .min(free_bytes(get, put, size) as usize)
                .min((size - put) as usize);
            self.mem.write(self.data_offset(put), &data[sent..sent + n]);
            self.word(dir.put).store((put + n as u32) % size, Ordering::Release);
            fence(Ordering::SeqCst);
            sent += n;
        }
        Ok(())
    }

    /// Consumer loop: reads until the ring is empty and the producer cleared
    /// the more-data flag.
    fn pull(
        &self,
        dir: &Direction,
        timeout: Duration,
        mut sink: impl FnMut(&[u8]) -> Result<()>,
        mut watch: impl FnMut() -> Result<()>,
    ) -> Result<usize> {
        let size = self.size;
        let mut moved = 0;
        loop {
            let (get, avail) = poll_until(timeout, || {
                watch()?;
                // Flag first: a cleared flag means the final put is visible.
                let more = self.word(dir.more).load(Ordering::Acquire) != 0;
                let put = self.word(dir.put).load(Ordering::Acquire);
                let get = self.word(dir.get).load(Ordering::Relaxed);
                if get >= size || put >= size {
                    return Err(RpcError::from(HibernationError::CursorOutOfRange));
                }
                let avail = available_bytes(get, put, size);
                Ok((avail > 0 || !more).then_some((get, avail)))
            })?;
            if avail == 0 {
                return Ok(moved);
            }
            let n = avail.min(size - get);
            let chunk = self.mem.read_vec(self.data_offset(get), n as usize);
            sink(&chunk)?;
            fence(Ordering::Acquire);
            self.word(dir.get).store((get + n) % size, Ordering::Release);
            moved += n as usize;
        }
    }
}

/// CPU end of the stream.
pub struct HibernationStream {
    buf: HibernationBuffer,
    timeout: Duration,
}

impl HibernationStream {
    pub fn new(buf: HibernationBuffer, timeout: Duration) -> Self {
        Self { buf, timeout }
    }

    pub fn buffer(&self) -> &HibernationBuffer {
        &self.buf
    }

    /// Copies the peer's save data into `staging` until the peer is done.
    pub fn drain_save(&self, staging: &mut StagingBuffer) -> Result<usize> {
        self.drain_save_watched(staging, || Ok(()))
    }

    /// Streams `blob` to the peer, then clears the restore more-data flag.
    pub fn fill_restore(&self, blob: &[u8]) -> Result<()> {
        self.fill_restore_watched(blob, || Ok(()))
    }

    fn drain_save_watched(
        &self,
        staging: &mut StagingBuffer,
        watch: impl FnMut() -> Result<()>,
    ) -> Result<usize> {
        self.buf
            .pull(&SAVE, self.timeout, |chunk| Ok(staging.extend(chunk)?), watch)
    }

    fn fill_restore_watched(&self, blob: &[u8], watch: impl FnMut() -> Result<()>) -> Result<()> {
        self.buf.push(&RESTORE, blob, self.timeout, watch)?;
        self.buf.set_more(&RESTORE, false);
        Ok(())
    }
}

/// Peer end of the stream.
pub struct HibernationPeer {
    buf: HibernationBuffer,
    timeout: Duration,
}

impl HibernationPeer {
    pub fn new(buf: HibernationBuffer, timeout: Duration) -> Self {
        Self { buf, timeout }
    }

    /// Writes a saved blob, then clears the save more-data flag.
    pub fn produce_save(&self, blob: &[u8]) -> Result<()> {
        self.buf.push(&SAVE, blob, self.timeout, || Ok(()))?;
        self.buf.set_more(&SAVE, false);
        Ok(())
    }

    pub fn consume_restore(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.buf.pull(
            &RESTORE,
            self.timeout,
            |chunk| {
                out.extend_from_slice(chunk);
                Ok(())
            },
            || Ok(()),
        )?;
        Ok(out)
    }
}

impl<T: RpcTransport> RpcEngine<T> {
    /// Runs `SAVE_HIBERNATION_DATA` and returns the peer's saved state.
    pub fn save_hibernation_data(&mut self, stream: &HibernationStream) -> Result<Vec<u8>> {
        self.ensure_callable()?;
        let function = Function::SAVE_HIBERNATION_DATA;
        let limits = &self.context().config().hibernation;
        let mut staging = StagingBuffer::new(limits.staging_initial_bytes, limits.staging_max_bytes);

        stream.buf.set_more(&SAVE, true);
        let req = RpcMessage::new(function, stream.buf.size().to_le_bytes().to_vec());
        self.send_request(&req)?;
        let mut early = None;
        let moved =
            stream.drain_save_watched(&mut staging, || self.watch_response(function, &mut early))?;
        let resp = match early {
            Some(resp) => resp,
            None => self.wait_for(function)?,
        };
        self.check_result(function, &resp)?;

        tracing::debug!(bytes = moved, "hibernation data saved");
        Ok(staging.into_inner())
    }

    /// Runs `RESTORE_HIBERNATION_DATA`, streaming `blob` back to the peer.
    pub fn restore_hibernation_data(&mut self, stream: &HibernationStream, blob: &[u8]) -> Result<()> {
        self.ensure_callable()?;
        let function = Function::RESTORE_HIBERNATION_DATA;

        stream.buf.set_more(&RESTORE, true);
        let req = RpcMessage::new(function, (blob.len() as u64).to_le_bytes().to_vec());
        self.send_request(&req)?;
        let mut early = None;
        stream.fill_restore_watched(blob, || self.watch_response(function, &mut early))?;
        let resp = match early {
            Some(resp) => resp,
            None => self.wait_for(function)?,
        };
        self.check_result(function, &resp)?;

        tracing::debug!(bytes = blob.len(), "hibernation data restored");
        Ok(())
    }
}

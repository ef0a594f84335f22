//! Per-direction message queues over the shared region.
//!
//! Slots are `page_size` bytes; one logical element occupies `elem_count`
//! consecutive slots modulo the ring and may straddle its end. One slot is
//! always left empty so `read == write` means empty.
//!
//! Each direction has exactly one [`QueueWriter`] and one [`QueueReader`]. The
//! writer only stores its own write pointer and the reader only stores its own
//! read pointer, each in the header page owned by its side.

use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::checksum;
use crate::config::TransportConfig;
use crate::doorbell::{Doorbell, DoorbellToken};
use crate::element;
use crate::error::{DequeueError, EnqueueError, Result, RpcError, TransportFault};
use crate::layout::{MsgElementHeader, QueueRegion, SharedLayout};
use crate::message::RpcMessage;
use crate::poll::poll_until;
use crate::rpc::RpcTransport;
use crate::shmem::{SharedMemory, SharedRegion};

/// Producer handle of one queue.
pub struct QueueWriter {
    mem: Arc<SharedMemory>,
    region: QueueRegion,
    page_size: usize,
    max_element: usize,
    peer_read_ptr: usize,
    seq: u32,
}

/// Consumer handle of one queue.
pub struct QueueReader {
    mem: Arc<SharedMemory>,
    region: QueueRegion,
    page_size: usize,
    own_read_ptr: usize,
    expected_seq: u32,
    accept_unstamped: bool,
}

/// The writer and reader one side of the link owns.
pub struct Endpoint {
    pub tx: QueueWriter,
    pub rx: QueueReader,
}

impl Endpoint {
    /// CPU side: writes the command queue, reads the status queue.
    pub fn cpu(region: &SharedRegion) -> Self {
        let layout = region.layout();
        Self::build(region.memory(), layout, layout.cmdq, layout.statq)
    }

    /// GSP side: writes the status queue, reads the command queue.
    pub fn gsp(region: &SharedRegion) -> Self {
        let layout = region.layout();
        Self::build(region.memory(), layout, layout.statq, layout.cmdq)
    }

    fn build(mem: &Arc<SharedMemory>, layout: &SharedLayout, own: QueueRegion, peer: QueueRegion) -> Self {
        Self {
            tx: QueueWriter {
                mem: mem.clone(),
                region: own,
                page_size: layout.page_size,
                max_element: layout.max_element_bytes(),
                peer_read_ptr: peer.rx_read_ptr_offset(),
                seq: 0,
            },
            rx: QueueReader {
                mem: mem.clone(),
                region: peer,
                page_size: layout.page_size,
                own_read_ptr: own.rx_read_ptr_offset(),
                expected_seq: 0,
                accept_unstamped: false,
            },
        }
    }
}

impl QueueWriter {
    pub fn slots(&self) -> u32 {
        self.region.slots
    }

    pub fn max_element_bytes(&self) -> usize {
        self.max_element
    }

    pub fn max_record_bytes(&self) -> usize {
        self.max_element - MsgElementHeader::SIZE_BYTES
    }

    /// Sequence number the next [`QueueWriter::send`] will use.
    pub fn next_seq(&self) -> u32 {
        self.seq
    }

    pub fn free_slots(&self) -> core::result::Result<u32, EnqueueError> {
        let write = self.write_ptr().load(Ordering::Relaxed);
        let read = self.mem.u32_at(self.peer_read_ptr).load(Ordering::Acquire);
        free_slots(read, write, self.region.slots)
    }

    /// Frames `msg` with the next sequence number and publishes it.
    pub fn send(&mut self, msg: &RpcMessage) -> core::result::Result<u32, EnqueueError> {
        let seq = self.seq;
        let element = element::encode(seq, msg, self.page_size);
        self.enqueue(&element)?;
        self.seq = seq.wrapping_add(1);
        Ok(seq)
    }

    /// Publishes an already stamped, slot-padded element image.
    pub fn enqueue(&mut self, element: &[u8]) -> core::result::Result<(), EnqueueError> {
        if element.is_empty() || element.len() % self.page_size != 0 {
            return Err(EnqueueError::Misaligned { len: element.len() });
        }
        if element.len() > self.max_element {
            return Err(EnqueueError::TooLarge {
                len: element.len(),
                max: self.max_element,
            });
        }

        let slots = self.region.slots;
        let needed = (element.len() / self.page_size) as u32;
        let write = self.write_ptr().load(Ordering::Relaxed);
        let read = self.mem.u32_at(self.peer_read_ptr).load(Ordering::Acquire);
        if needed > free_slots(read, write, slots)? {
            return Err(EnqueueError::Full);
        }

        let first_slots = needed.min(slots - write) as usize;
        let split = first_slots * self.page_size;
        self.mem.write(self.slot_offset(write), &element[..split]);
        if split < element.len() {
            self.mem.write(self.region.entries_offset, &element[split..]);
        }

        // Slot contents must be visible before the new write pointer.
        fence(Ordering::SeqCst);
        self.write_ptr().store((write + needed) % slots, Ordering::Release);
        Ok(())
    }

    fn write_ptr(&self) -> &core::sync::atomic::AtomicU32 {
        self.mem.u32_at(self.region.write_ptr_offset())
    }

    fn slot_offset(&self, slot: u32) -> usize {
        self.region.entries_offset + slot as usize * self.page_size
    }
}

struct Pending {
    bytes: Vec<u8>,
    next_read: u32,
}

impl QueueReader {
    /// Accept elements whose checksum field was left zero.
    ///
    /// Used when payloads are sealed and integrity is covered by the auth tag.
    pub fn set_accept_unstamped(&mut self, accept: bool) {
        self.accept_unstamped = accept;
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn occupied_slots(&self) -> core::result::Result<u32, TransportFault> {
        let write = self.mem.u32_at(self.region.write_ptr_offset()).load(Ordering::Acquire);
        let read = self.read_ptr().load(Ordering::Relaxed);
        occupied_slots(read, write, self.region.slots)
    }

    /// Consumes the next element and returns its verified image.
    pub fn dequeue(&mut self) -> core::result::Result<Vec<u8>, DequeueError> {
        let pending = self.peek()?;
        self.commit(pending.next_read);
        Ok(pending.bytes)
    }

    /// Consumes the next element and parses its record.
    ///
    /// A record that fails to parse leaves the read cursor in place.
    pub fn recv(&mut self) -> core::result::Result<RpcMessage, DequeueError> {
        let pending = self.peek()?;
        let (_, msg) = element::decode(&pending.bytes)?;
        self.commit(pending.next_read);
        Ok(msg)
    }

    fn peek(&self) -> core::result::Result<Pending, DequeueError> {
        let slots = self.region.slots;
        let write = self.mem.u32_at(self.region.write_ptr_offset()).load(Ordering::Acquire);
        let read = self.read_ptr().load(Ordering::Relaxed);
        let occupied = occupied_slots(read, write, slots)?;
        if occupied == 0 {
            return Err(DequeueError::Empty);
        }

        let first = self.mem.read_vec(self.slot_offset(read), self.page_size);
        let header = element::header(&first)?;
        let count = element::slot_count(&header, occupied)?;

        let len = count as usize * self.page_size;
        let mut bytes = vec![0u8; len];
        let first_slots = count.min(slots - read) as usize;
        let split = first_slots * self.page_size;
        self.mem.read(self.slot_offset(read), &mut bytes[..split]);
        if split < len {
            self.mem.read(self.region.entries_offset, &mut bytes[split..]);
        }

        let unstamped = self.accept_unstamped && header.checksum == 0;
        if !unstamped && !checksum::verify(&bytes) {
            return Err(TransportFault::CorruptChecksum { seq: header.seq_num }.into());
        }
        if header.seq_num != self.expected_seq {
            return Err(TransportFault::SequenceMismatch {
                expected: self.expected_seq,
                found: header.seq_num,
            }
            .into());
        }

        Ok(Pending {
            bytes,
            next_read: (read + count) % slots,
        })
    }

    fn commit(&mut self, next_read: u32) {
        self.expected_seq = self.expected_seq.wrapping_add(1);
        // Slot reads must complete before the slots are handed back.
        fence(Ordering::SeqCst);
        self.read_ptr().store(next_read, Ordering::Release);
    }

    fn read_ptr(&self) -> &core::sync::atomic::AtomicU32 {
        self.mem.u32_at(self.own_read_ptr)
    }

    fn slot_offset(&self, slot: u32) -> usize {
        self.region.entries_offset + slot as usize * self.page_size
    }
}

// Cursors come from shared memory and are range checked before any arithmetic.
fn free_slots(read: u32, write: u32, slots: u32) -> core::result::Result<u32, EnqueueError> {
    if read >= slots || write >= slots {
        return Err(EnqueueError::Desync);
    }
    Ok((slots - 1 + read - write) % slots)
}

fn occupied_slots(read: u32, write: u32, slots: u32) -> core::result::Result<u32, TransportFault> {
    if read >= slots || write >= slots {
        return Err(TransportFault::Desync("queue cursor out of range"));
    }
    Ok((slots + write - read) % slots)
}

/// [`RpcTransport`] over the command and status queues.
pub struct QueueTransport<D> {
    endpoint: Endpoint,
    doorbell: D,
    timeout: Duration,
}

impl<D: Doorbell> QueueTransport<D> {
    /// `timeout` bounds how long a send waits for the peer to free slots.
    pub fn new(endpoint: Endpoint, doorbell: D, timeout: Duration) -> Self {
        Self {
            endpoint,
            doorbell,
            timeout,
        }
    }

    /// Transport tuned by `config`: its timeout, and acceptance of unstamped
    /// elements when the link is encrypted.
    pub fn from_config(mut endpoint: Endpoint, doorbell: D, config: &TransportConfig) -> Self {
        endpoint.rx.set_accept_unstamped(config.encryption);
        Self::new(endpoint, doorbell, config.timeout())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }
}

impl<D: Doorbell> RpcTransport for QueueTransport<D> {
    fn max_record_size(&self) -> usize {
        self.endpoint.tx.max_record_bytes()
    }

    fn send(&mut self, msg: &RpcMessage) -> Result<()> {
        let tx = &mut self.endpoint.tx;
        let seq = poll_until(self.timeout, || match tx.send(msg) {
            Ok(seq) => Ok(Some(seq)),
            Err(EnqueueError::Full) => Ok(None),
            Err(err) => Err(RpcError::from(err)),
        })
        .map_err(|err| match err {
            RpcError::Timeout(_) => RpcError::Busy,
            err => err,
        })?;

        tracing::trace!(
            seq,
            function = %msg.function,
            len = msg.record_len(),
            "GSP RPC: send"
        );
        self.doorbell.ring(DoorbellToken::QueueHead);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<RpcMessage>> {
        match self.endpoint.rx.recv() {
            Ok(msg) => {
                tracing::trace!(
                    seq = self.endpoint.rx.expected_seq().wrapping_sub(1),
                    function = %msg.function,
                    len = msg.record_len(),
                    "GSP RPC: receive"
                );
                Ok(Some(msg))
            }
            Err(DequeueError::Empty) => Ok(None),
            Err(DequeueError::Fault(fault)) => Err(fault.into()),
        }
    }
}

//! Queue-less path to a vGPU host plugin over one control/response page pair
//! and the message buffer negotiated at setup.
//!
//! The CPU writes a request into the message buffer (the control page for the
//! setup request itself), bumps `request_id` behind a release fence and rings
//! the doorbell with a token. The plugin writes the response page and publishes
//! `response_id == request_id`. Request and response never share storage.

use bitflags::bitflags;
use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, Result, RpcError, TransportFault};
use crate::message::{Function, RpcMessage, RESULT_RESERVED_BASE};
use crate::poll::poll_until;
use crate::rpc::RpcTransport;
use crate::shmem::SharedMemory;

/// Notification sent to the peer after publishing work.
pub trait Doorbell: Send {
    fn ring(&self, token: DoorbellToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellToken {
    /// New command queue entries.
    QueueHead,
    Setup,
    Message,
}

impl DoorbellToken {
    pub fn as_u32(self) -> u32 {
        match self {
            DoorbellToken::QueueHead => 0,
            DoorbellToken::Setup => 1,
            DoorbellToken::Message => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => DoorbellToken::QueueHead,
            1 => DoorbellToken::Setup,
            2 => DoorbellToken::Message,
            _ => return None,
        })
    }
}

/// Doorbell for peers that poll instead of waiting for an interrupt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDoorbell;

impl Doorbell for NoDoorbell {
    fn ring(&self, _token: DoorbellToken) {}
}

impl Doorbell for std::sync::mpsc::Sender<DoorbellToken> {
    fn ring(&self, token: DoorbellToken) {
        // A peer that hung up just stops answering; the caller's poll times out.
        let _ = self.send(token);
    }
}

/// Byte offsets within the control page.
pub mod control_page {
    pub const REQUEST_ID: usize = 0;
    pub const TOKEN: usize = 4;
    pub const LENGTH: usize = 8;
    pub const PAYLOAD: usize = 16;
}

/// Byte offsets within the response page.
pub mod response_page {
    pub const RESPONSE_ID: usize = 0;
    pub const STATUS: usize = 4;
    pub const LENGTH: usize = 8;
    pub const PAYLOAD: usize = 16;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u64 {
        const VALID = 1 << 0;
        const APERTURE_FBMEM = 1 << 1;
    }
}

const SIZE_CLASS_SHIFT: u32 = 2;
const SIZE_CLASS_MASK: u64 = 0b11 << SIZE_CLASS_SHIFT;
const PFN_SHIFT: u32 = 12;
const ADDR_MASK: u64 = !((1 << PFN_SHIFT) - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aperture {
    SysMem,
    FbMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Size4K,
    Size128K,
    Size2M,
}

impl SizeClass {
    pub fn bytes(self) -> u64 {
        match self {
            SizeClass::Size4K => 4 << 10,
            SizeClass::Size128K => 128 << 10,
            SizeClass::Size2M => 2 << 20,
        }
    }

    fn bits(self) -> u64 {
        match self {
            SizeClass::Size4K => 0,
            SizeClass::Size128K => 1,
            SizeClass::Size2M => 2,
        }
    }
}

/// One buffer negotiated at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub addr: u64,
    pub aperture: Aperture,
    pub size: SizeClass,
    /// CPU-visible alias of a frame-buffer-resident buffer.
    pub alias_offset: u64,
}

impl BufferDescriptor {
    pub fn new(addr: u64, aperture: Aperture, size: SizeClass) -> core::result::Result<Self, ConfigError> {
        if addr & !ADDR_MASK != 0 {
            return Err(ConfigError::Invalid("buffer address must be 4 KiB aligned"));
        }
        Ok(Self {
            addr,
            aperture,
            size,
            alias_offset: 0,
        })
    }

    pub fn with_alias(mut self, alias_offset: u64) -> Self {
        self.alias_offset = alias_offset;
        self
    }

    pub fn encode(&self) -> u64 {
        let mut flags = DescriptorFlags::VALID;
        if self.aperture == Aperture::FbMem {
            flags |= DescriptorFlags::APERTURE_FBMEM;
        }
        flags.bits() | (self.size.bits() << SIZE_CLASS_SHIFT) | (self.addr & ADDR_MASK)
    }

    /// `None` for a descriptor without the valid bit.
    pub fn decode(raw: u64, alias_offset: u64) -> core::result::Result<Option<Self>, TransportFault> {
        let flags = DescriptorFlags::from_bits_truncate(raw);
        if !flags.contains(DescriptorFlags::VALID) {
            return Ok(None);
        }
        let size = match (raw & SIZE_CLASS_MASK) >> SIZE_CLASS_SHIFT {
            0 => SizeClass::Size4K,
            1 => SizeClass::Size128K,
            2 => SizeClass::Size2M,
            _ => return Err(TransportFault::Malformed("unknown buffer size class")),
        };
        let aperture = if flags.contains(DescriptorFlags::APERTURE_FBMEM) {
            Aperture::FbMem
        } else {
            Aperture::SysMem
        };
        Ok(Some(Self {
            addr: raw & ADDR_MASK,
            aperture,
            size,
            alias_offset,
        }))
    }
}

/// The four buffers exchanged by the setup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupBuffers {
    pub message_buffer: BufferDescriptor,
    pub shared_memory: BufferDescriptor,
    pub event_ring: BufferDescriptor,
    pub debug_buffer: BufferDescriptor,
}

impl SetupBuffers {
    pub const SIZE_BYTES: usize = 4 * 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE_BYTES);
        for desc in self.all() {
            out.extend_from_slice(&desc.encode().to_le_bytes());
            out.extend_from_slice(&desc.alias_offset.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> core::result::Result<Self, TransportFault> {
        if bytes.len() < Self::SIZE_BYTES {
            return Err(TransportFault::Malformed("setup payload too short"));
        }
        let mut descs = [None; 4];
        for (i, slot) in descs.iter_mut().enumerate() {
            let raw = read_u64(bytes, i * 16);
            let alias = read_u64(bytes, i * 16 + 8);
            *slot = BufferDescriptor::decode(raw, alias)?;
        }
        match descs {
            [Some(message_buffer), Some(shared_memory), Some(event_ring), Some(debug_buffer)] => {
                Ok(Self {
                    message_buffer,
                    shared_memory,
                    event_ring,
                    debug_buffer,
                })
            }
            _ => Err(TransportFault::Malformed("setup buffer without the valid bit")),
        }
    }

    fn all(&self) -> [BufferDescriptor; 4] {
        [
            self.message_buffer,
            self.shared_memory,
            self.event_ring,
            self.debug_buffer,
        ]
    }
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}

/// The control page, the response page and the message buffer.
///
/// Setup payloads travel in the control page. After setup, request records go
/// into the message buffer and the control page only carries the request id,
/// token and length.
#[derive(Clone)]
pub struct DoorbellPages {
    mem: Arc<SharedMemory>,
    page_size: usize,
    message_buffer: SizeClass,
}

impl DoorbellPages {
    /// Smallest page that still holds a setup payload.
    pub const MIN_PAGE_SIZE: usize = control_page::PAYLOAD + SetupBuffers::SIZE_BYTES;

    pub fn new(page_size: usize, message_buffer: SizeClass) -> core::result::Result<Self, ConfigError> {
        if page_size < Self::MIN_PAGE_SIZE || page_size % 8 != 0 {
            return Err(ConfigError::Invalid("doorbell page too small for the setup payload"));
        }
        Ok(Self {
            mem: Arc::new(SharedMemory::new(2 * page_size + message_buffer.bytes() as usize)),
            page_size,
            message_buffer,
        })
    }

    pub fn message_buffer_size(&self) -> SizeClass {
        self.message_buffer
    }

    /// Largest response record the response page holds.
    pub fn response_capacity(&self) -> usize {
        self.page_size - response_page::PAYLOAD
    }

    /// Largest record that fits both the message buffer and the response page.
    pub fn record_capacity(&self) -> usize {
        (self.message_buffer.bytes() as usize).min(self.response_capacity())
    }

    fn control_capacity(&self) -> usize {
        self.page_size - control_page::PAYLOAD
    }

    fn control(&self, off: usize) -> usize {
        off
    }

    fn response(&self, off: usize) -> usize {
        self.page_size + off
    }

    fn message(&self, off: usize) -> usize {
        2 * self.page_size + off
    }

    /// Where the payload for `token` lives and how large it may be.
    fn request_payload(&self, token: Option<DoorbellToken>) -> (usize, usize) {
        match token {
            Some(DoorbellToken::Message) => (self.message(0), self.message_buffer.bytes() as usize),
            _ => (self.control(control_page::PAYLOAD), self.control_capacity()),
        }
    }
}

struct Response {
    status: u32,
    payload: Vec<u8>,
}

/// CPU side of the doorbell path.
pub struct DoorbellChannel<D> {
    pages: DoorbellPages,
    doorbell: D,
    timeout: Duration,
    request_id: u32,
    /// Request id and function of the message awaiting its response.
    outstanding: Option<(u32, Function)>,
    message_buffer: Option<BufferDescriptor>,
}

impl<D: Doorbell> DoorbellChannel<D> {
    pub fn new(pages: DoorbellPages, doorbell: D, timeout: Duration) -> Self {
        Self {
            pages,
            doorbell,
            timeout,
            request_id: 0,
            outstanding: None,
            message_buffer: None,
        }
    }

    pub fn is_setup(&self) -> bool {
        self.message_buffer.is_some()
    }

    /// The message buffer agreed on at setup.
    pub fn message_buffer(&self) -> Option<&BufferDescriptor> {
        self.message_buffer.as_ref()
    }

    /// Hands the plugin the four shared buffers and waits for its verdict.
    ///
    /// The message buffer descriptor must describe the buffer these pages map.
    pub fn setup(&mut self, buffers: &SetupBuffers) -> Result<()> {
        if buffers.message_buffer.size != self.pages.message_buffer_size() {
            return Err(ConfigError::Invalid("message buffer size class does not match the mapped buffer").into());
        }
        self.drain_outstanding()?;
        let id = self.issue(DoorbellToken::Setup, &buffers.encode());
        let response = self.wait_response(id)?;
        if response.status != 0 {
            tracing::error!(status = response.status, "doorbell setup rejected");
            return Err(RpcError::SetupRejected {
                status: response.status,
            });
        }
        self.message_buffer = Some(buffers.message_buffer);
        tracing::debug!(
            request_id = id,
            message_buffer = buffers.message_buffer.addr,
            "doorbell setup complete"
        );
        Ok(())
    }

    fn issue(&mut self, token: DoorbellToken, payload: &[u8]) -> u32 {
        let mem = &self.pages.mem;
        let (offset, _) = self.pages.request_payload(Some(token));
        mem.write(offset, payload);
        mem.u32_at(self.pages.control(control_page::LENGTH))
            .store(payload.len() as u32, Ordering::Relaxed);
        mem.u32_at(self.pages.control(control_page::TOKEN))
            .store(token.as_u32(), Ordering::Relaxed);

        // Zero means "no request yet".
        self.request_id = match self.request_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        fence(Ordering::Release);
        mem.u32_at(self.pages.control(control_page::REQUEST_ID))
            .store(self.request_id, Ordering::Release);
        self.doorbell.ring(token);
        self.request_id
    }

    fn poll_response(&self, id: u32) -> Option<Response> {
        let mem = &self.pages.mem;
        if mem.u32_at(self.pages.response(response_page::RESPONSE_ID)).load(Ordering::Relaxed) != id {
            return None;
        }
        fence(Ordering::Acquire);
        let status = mem.u32_at(self.pages.response(response_page::STATUS)).load(Ordering::Relaxed);
        let len = mem.u32_at(self.pages.response(response_page::LENGTH)).load(Ordering::Relaxed) as usize;
        let len = len.min(self.pages.response_capacity());
        let payload = mem.read_vec(self.pages.response(response_page::PAYLOAD), len);
        Some(Response { status, payload })
    }

    fn wait_response(&self, id: u32) -> Result<Response> {
        poll_until(self.timeout, || Ok::<_, RpcError>(self.poll_response(id)))
    }

    /// The message buffer holds one request at a time; a previous request
    /// whose response nobody asked for is waited out before reuse.
    fn drain_outstanding(&mut self) -> Result<()> {
        if let Some((id, function)) = self.outstanding.take() {
            self.wait_response(id)?;
            tracing::trace!(request_id = id, %function, "discarded unclaimed doorbell response");
        }
        Ok(())
    }
}

impl<D: Doorbell> RpcTransport for DoorbellChannel<D> {
    fn max_record_size(&self) -> usize {
        self.pages.record_capacity()
    }

    fn send(&mut self, msg: &RpcMessage) -> Result<()> {
        if self.message_buffer.is_none() {
            return Err(RpcError::InvalidState("doorbell message before setup"));
        }
        let len = msg.record_len();
        if len > self.max_record_size() {
            return Err(TransportFault::RecordTooLarge {
                len,
                max: self.max_record_size(),
            }
            .into());
        }
        self.drain_outstanding()?;
        let id = self.issue(DoorbellToken::Message, &msg.encode_record());
        self.outstanding = Some((id, msg.function));
        tracing::trace!(request_id = id, function = %msg.function, len, "doorbell: send");
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<RpcMessage>> {
        let Some((id, function)) = self.outstanding else {
            return Ok(None);
        };
        let Some(response) = self.poll_response(id) else {
            return Ok(None);
        };
        self.outstanding = None;
        match response.status {
            0 => Ok(Some(RpcMessage::decode_record(&response.payload)?)),
            code if code < RESULT_RESERVED_BASE => Err(RpcError::Peer { function, code }),
            code => Err(RpcError::PeerGeneric { function, code }),
        }
    }
}

/// A request as seen by the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorbellRequest {
    pub id: u32,
    pub token: Option<DoorbellToken>,
    pub payload: Vec<u8>,
}

/// Plugin side of the doorbell path.
pub struct PluginEndpoint {
    pages: DoorbellPages,
    last_request: u32,
}

impl PluginEndpoint {
    pub fn new(pages: DoorbellPages) -> Self {
        Self {
            pages,
            last_request: 0,
        }
    }

    pub fn poll_request(&mut self) -> Option<DoorbellRequest> {
        let mem = &self.pages.mem;
        let id = mem
            .u32_at(self.pages.control(control_page::REQUEST_ID))
            .load(Ordering::Acquire);
        if id == self.last_request {
            return None;
        }
        self.last_request = id;
        let token = DoorbellToken::from_u32(mem.u32_at(self.pages.control(control_page::TOKEN)).load(Ordering::Relaxed));
        let len = mem.u32_at(self.pages.control(control_page::LENGTH)).load(Ordering::Relaxed) as usize;
        let (offset, capacity) = self.pages.request_payload(token);
        Some(DoorbellRequest {
            id,
            token,
            payload: mem.read_vec(offset, len.min(capacity)),
        })
    }

    pub fn respond(&self, id: u32, status: u32, payload: &[u8]) {
        let mem = &self.pages.mem;
        let len = payload.len().min(self.pages.response_capacity());
        mem.write(self.pages.response(response_page::PAYLOAD), &payload[..len]);
        mem.u32_at(self.pages.response(response_page::STATUS)).store(status, Ordering::Relaxed);
        mem.u32_at(self.pages.response(response_page::LENGTH)).store(len as u32, Ordering::Relaxed);
        fence(Ordering::Release);
        mem.u32_at(self.pages.response(response_page::RESPONSE_ID)).store(id, Ordering::Release);
    }
}

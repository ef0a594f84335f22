//! Software stand-ins for the far side of the link.
//!
//! [`GspPeer`] serves the command queue the way firmware does: it reassembles
//! continuation records, answers the version handshake, streams hibernation
//! data and echoes everything else. [`PluginPeer`] serves the doorbell path.
//! Either one can run on its own thread through [`spawn`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::chunk::{ChunkPlan, Reassembler};
use crate::config::TransportConfig;
use crate::doorbell::{DoorbellPages, DoorbellToken, PluginEndpoint, SetupBuffers};
use crate::error::{DequeueError, EnqueueError, Result, RpcError, TransportFault};
use crate::hibernation::{HibernationBuffer, HibernationPeer};
use crate::layout::RpcHeader;
use crate::message::{Function, RpcMessage, RESULT_SUCCESS};
use crate::poll::poll_until;
use crate::queue::Endpoint;
use crate::records;
use crate::shmem::SharedRegion;
use crate::version::{encode_version, GuestInfo, ProtocolVersion, CURRENT_VERSION};

/// `rpc_result_private` answer to a guest speaking another version.
pub const RESULT_VERSION_MISMATCH: u32 = 0x1;
/// `rpc_result` for requests the peer cannot serve.
pub const RESULT_NOT_SUPPORTED: u32 = 0x56;

/// What a custom handler wants done with a request.
pub enum Reply {
    /// Fall back to the built-in behaviour.
    Default,
    Respond(RpcMessage),
    /// Fail the request with this status and no body.
    Reject(u32),
    /// Send nothing back.
    Silent,
}

type Handler = Box<dyn FnMut(&RpcMessage) -> Reply + Send>;

/// Something a peer thread can drive.
pub trait Service {
    /// Handles at most one request; `Ok(false)` when there was nothing to do.
    fn service_one(&mut self) -> Result<bool>;

    fn idle(&mut self) {
        std::thread::yield_now();
    }
}

pub struct PeerHandle<P> {
    stop: Arc<AtomicBool>,
    join: JoinHandle<P>,
}

impl<P> PeerHandle<P> {
    /// Stops the loop and returns the peer for inspection.
    pub fn stop(self) -> std::thread::Result<P> {
        self.stop.store(true, Ordering::Release);
        self.join.join()
    }
}

/// Runs `peer` on a new thread until stopped or until it hits an error.
pub fn spawn<P: Service + Send + 'static>(peer: P) -> PeerHandle<P> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let join = std::thread::spawn(move || {
        let mut peer = peer;
        while !flag.load(Ordering::Acquire) {
            match peer.service_one() {
                Ok(true) => {}
                Ok(false) => peer.idle(),
                Err(err) => {
                    tracing::error!(%err, "peer stopped");
                    break;
                }
            }
        }
        peer
    });
    PeerHandle { stop, join }
}

/// Firmware side of the queue transport.
pub struct GspPeer {
    endpoint: Endpoint,
    version: ProtocolVersion,
    hibernation: Option<HibernationPeer>,
    saved_state: Vec<u8>,
    restored: Vec<u8>,
    handler: Option<Handler>,
    timeout: Duration,
    record_capacity: usize,
    served: Vec<Function>,
}

impl GspPeer {
    pub fn new(region: &SharedRegion, config: &TransportConfig) -> Result<Self> {
        let endpoint = Endpoint::gsp(region);
        let record_capacity = endpoint.tx.max_record_bytes().min(config.max_record_bytes()?);
        Ok(Self {
            endpoint,
            version: CURRENT_VERSION,
            hibernation: None,
            saved_state: Vec::new(),
            restored: Vec::new(),
            handler: None,
            timeout: config.timeout(),
            record_capacity,
            served: Vec::new(),
        })
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Serve hibernation requests over `buf`; a save hands out `saved_state`.
    pub fn with_hibernation(mut self, buf: HibernationBuffer, saved_state: Vec<u8>) -> Self {
        self.hibernation = Some(HibernationPeer::new(buf, self.timeout));
        self.saved_state = saved_state;
        self
    }

    pub fn with_handler(mut self, handler: impl FnMut(&RpcMessage) -> Reply + Send + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Functions of every request served so far, in order.
    pub fn served(&self) -> &[Function] {
        &self.served
    }

    /// Last blob received by a restore.
    pub fn restored(&self) -> &[u8] {
        &self.restored
    }

    /// Queues an unsolicited message for the CPU.
    pub fn post_event(&mut self, function: Function, body: impl Into<Vec<u8>>) -> Result<()> {
        self.send(&RpcMessage::response(function, RESULT_SUCCESS, body))
    }

    fn send(&mut self, msg: &RpcMessage) -> Result<()> {
        let tx = &mut self.endpoint.tx;
        poll_until(self.timeout, || match tx.send(msg) {
            Ok(_) => Ok(Some(())),
            Err(EnqueueError::Full) => Ok(None),
            Err(err) => Err(RpcError::from(err)),
        })
        .map_err(|err| match err {
            RpcError::Timeout(_) => RpcError::Busy,
            err => err,
        })
    }

    fn recv(&mut self) -> Result<Option<RpcMessage>> {
        match self.endpoint.rx.recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(DequeueError::Empty) => Ok(None),
            Err(DequeueError::Fault(fault)) => Err(fault.into()),
        }
    }

    /// Pulls the continuation records that complete `first`.
    fn gather(&mut self, first: RpcMessage) -> Result<RpcMessage> {
        let Some(total) = records::declared_body_len(first.function, &first.body) else {
            return Ok(first);
        };
        if total <= first.body.len() {
            return Ok(first);
        }

        let mut pieces = Reassembler::new(total, self.record_capacity, RpcHeader::SIZE_BYTES);
        pieces.push(first.record_len(), &first.body)?;
        while !pieces.is_complete() {
            let timeout = self.timeout;
            let next = poll_until(timeout, || self.recv())?;
            if next.function != Function::CONTINUATION_RECORD {
                return Err(TransportFault::Malformed("expected a continuation record").into());
            }
            pieces.push(next.record_len(), &next.body)?;
        }
        Ok(RpcMessage {
            body: pieces.into_inner(),
            ..first
        })
    }

    /// Sends `resp`, split into continuation records when it does not fit.
    fn reply(&mut self, resp: RpcMessage) -> Result<()> {
        let plan = ChunkPlan::new(resp.body.len(), self.record_capacity, RpcHeader::SIZE_BYTES)?;
        for (i, chunk) in plan.split(&resp.body).enumerate() {
            let function = if i == 0 {
                resp.function
            } else {
                Function::CONTINUATION_RECORD
            };
            self.send(&RpcMessage {
                function,
                rpc_result: resp.rpc_result,
                rpc_result_private: resp.rpc_result_private,
                body: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    fn default_reply(&mut self, req: &RpcMessage) -> Result<Option<RpcMessage>> {
        let ok = |body: Vec<u8>| Some(RpcMessage::response(req.function, RESULT_SUCCESS, body));
        let not_supported = Some(RpcMessage::response(req.function, RESULT_NOT_SUPPORTED, Vec::new()));

        Ok(match req.function {
            Function::SET_GUEST_SYSTEM_INFO => {
                let guest = GuestInfo::decode(&req.body)?;
                let private = if guest.version == self.version {
                    RESULT_SUCCESS
                } else {
                    RESULT_VERSION_MISMATCH
                };
                Some(RpcMessage {
                    function: req.function,
                    rpc_result: RESULT_SUCCESS,
                    rpc_result_private: private,
                    body: encode_version(self.version),
                })
            }
            Function::SAVE_HIBERNATION_DATA => match &self.hibernation {
                Some(hib) => {
                    hib.produce_save(&self.saved_state)?;
                    ok(Vec::new())
                }
                None => not_supported,
            },
            Function::RESTORE_HIBERNATION_DATA => match &self.hibernation {
                Some(hib) => {
                    self.restored = hib.consume_restore()?;
                    ok(Vec::new())
                }
                None => not_supported,
            },
            Function::ALLOC_MEMORY => ok(Vec::new()),
            Function::LOG => None,
            _ => ok(req.body.clone()),
        })
    }
}

impl Service for GspPeer {
    fn service_one(&mut self) -> Result<bool> {
        let Some(req) = self.recv()? else {
            return Ok(false);
        };
        if req.function == Function::CONTINUATION_RECORD {
            tracing::warn!(len = req.body.len(), "GSP peer: stray continuation record");
            return Ok(true);
        }
        let req = self.gather(req)?;
        self.served.push(req.function);
        tracing::trace!(function = %req.function, len = req.body.len(), "GSP peer: request");

        let reply = match self.handler.as_mut() {
            Some(handler) => handler(&req),
            None => Reply::Default,
        };
        let resp = match reply {
            Reply::Default => self.default_reply(&req)?,
            Reply::Respond(resp) => Some(resp),
            Reply::Reject(status) => Some(RpcMessage::response(req.function, status, Vec::new())),
            Reply::Silent => None,
        };
        if let Some(resp) = resp {
            self.reply(resp)?;
        }
        Ok(true)
    }
}

/// Host plugin side of the doorbell path.
pub struct PluginPeer {
    endpoint: PluginEndpoint,
    tokens: Receiver<DoorbellToken>,
    setup_status: u32,
    setup: Option<SetupBuffers>,
    handler: Option<Handler>,
    served: Vec<Function>,
}

impl PluginPeer {
    /// Returns the peer and the doorbell the CPU rings.
    pub fn new(pages: DoorbellPages) -> (Self, Sender<DoorbellToken>) {
        let (doorbell, tokens) = mpsc::channel();
        let peer = Self {
            endpoint: PluginEndpoint::new(pages),
            tokens,
            setup_status: 0,
            setup: None,
            handler: None,
            served: Vec::new(),
        };
        (peer, doorbell)
    }

    /// Answer every setup request with `status`.
    pub fn with_setup_status(mut self, status: u32) -> Self {
        self.setup_status = status;
        self
    }

    pub fn with_handler(mut self, handler: impl FnMut(&RpcMessage) -> Reply + Send + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn setup_buffers(&self) -> Option<&SetupBuffers> {
        self.setup.as_ref()
    }

    pub fn served(&self) -> &[Function] {
        &self.served
    }
}

impl Service for PluginPeer {
    fn service_one(&mut self) -> Result<bool> {
        let Some(req) = self.endpoint.poll_request() else {
            return Ok(false);
        };
        match req.token {
            Some(DoorbellToken::Setup) => match SetupBuffers::decode(&req.payload) {
                Ok(buffers) if self.setup_status == 0 => {
                    tracing::debug!(?buffers, "plugin: setup");
                    self.setup = Some(buffers);
                    self.endpoint.respond(req.id, 0, &[]);
                }
                Ok(_) => self.endpoint.respond(req.id, self.setup_status, &[]),
                Err(err) => {
                    tracing::warn!(%err, "plugin: bad setup payload");
                    self.endpoint.respond(req.id, RESULT_NOT_SUPPORTED, &[]);
                }
            },
            Some(DoorbellToken::Message) => {
                let msg = RpcMessage::decode_record(&req.payload)?;
                self.served.push(msg.function);
                let reply = match self.handler.as_mut() {
                    Some(handler) => handler(&msg),
                    None => Reply::Default,
                };
                let resp = match reply {
                    Reply::Default => RpcMessage::response(msg.function, RESULT_SUCCESS, msg.body),
                    Reply::Respond(resp) => resp,
                    Reply::Reject(status) => {
                        self.endpoint.respond(req.id, status, &[]);
                        return Ok(true);
                    }
                    // The channel still needs its response id; an empty NOP record stands in.
                    Reply::Silent => RpcMessage::response(Function::NOP, RESULT_SUCCESS, Vec::new()),
                };
                self.endpoint.respond(req.id, 0, &resp.encode_record());
            }
            _ => self.endpoint.respond(req.id, RESULT_NOT_SUPPORTED, &[]),
        }
        Ok(true)
    }

    fn idle(&mut self) {
        // Sleep until the doorbell rings; the request id is the source of truth.
        let _ = self.tokens.recv_timeout(Duration::from_millis(1));
    }
}

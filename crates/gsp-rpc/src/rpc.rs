//! Request/response engine on top of a message transport.
//!
//! A synchronous call moves through `IDLE → SENT → WAITING → DONE | FAILED`:
//! the expected function is cached, the request is sent, and the status side is
//! polled until a message with that function arrives. Anything else received
//! while waiting is an unsolicited event and goes to the [`EventSink`].
//! Asynchronous calls stop after the send.

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::event::{EventSink, LogEvents};
use crate::message::{Function, RpcMessage, RESULT_RESERVED_BASE, RESULT_SUCCESS};
use crate::meter::RpcMeter;
use crate::poll::poll_until;
use crate::version::HandshakeState;

/// Moves whole records between the CPU and its peer.
pub trait RpcTransport {
    /// Largest record (RPC header plus body) one `send` can carry.
    fn max_record_size(&self) -> usize;

    /// Publishes one record and notifies the peer. A queue that stays full is
    /// reported as [`RpcError::Busy`].
    fn send(&mut self, msg: &RpcMessage) -> Result<()>;

    /// Returns the next received record without blocking.
    fn try_recv(&mut self) -> Result<Option<RpcMessage>>;
}

/// Per-device state shared by every call on that device.
#[derive(Debug)]
pub struct RpcContext {
    config: TransportConfig,
    meter: RpcMeter,
    pub(crate) handshake: HandshakeState,
    broadcast: bool,
}

impl RpcContext {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            meter: RpcMeter::new(config.meter),
            config,
            handshake: HandshakeState::Pending,
            broadcast: false,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn meter(&self) -> &RpcMeter {
        &self.meter
    }

    pub fn meter_mut(&mut self) -> &mut RpcMeter {
        &mut self.meter
    }

    pub fn handshake(&self) -> &HandshakeState {
        &self.handshake
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// While set, every call is refused.
    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.broadcast = broadcast;
    }
}

pub struct RpcEngine<T> {
    transport: T,
    ctx: RpcContext,
    events: Box<dyn EventSink>,
    record_capacity: usize,
}

impl<T: RpcTransport> RpcEngine<T> {
    pub fn new(transport: T, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let record_capacity = transport
            .max_record_size()
            .min(config.max_record_bytes()?);
        Ok(Self {
            transport,
            ctx: RpcContext::new(config),
            events: Box::new(LogEvents),
            record_capacity,
        })
    }

    pub fn set_event_sink(&mut self, sink: impl EventSink + 'static) {
        self.events = Box::new(sink);
    }

    pub fn context(&self) -> &RpcContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RpcContext {
        &mut self.ctx
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Largest record a single element carries on this engine.
    pub fn record_capacity(&self) -> usize {
        self.record_capacity
    }

    /// Sends `req` and waits for the response with the same function.
    pub fn call(&mut self, req: RpcMessage) -> Result<RpcMessage> {
        self.ensure_callable()?;
        let function = req.function;
        let token = self.ctx.meter.start(function);
        let result = self.send_request(&req).and_then(|()| {
            let resp = self.wait_for(function)?;
            self.check_result(function, &resp)?;
            Ok(resp)
        });
        self.ctx.meter.finish(token);
        result
    }

    /// Sends `req` without waiting for a response.
    pub fn call_async(&mut self, req: &RpcMessage) -> Result<()> {
        self.ensure_callable()?;
        self.send_request(req)
    }

    pub(crate) fn ensure_callable(&self) -> Result<()> {
        if self.ctx.broadcast {
            return Err(RpcError::InvalidState("RPC issued in broadcast mode"));
        }
        if self.ctx.handshake.is_failed() {
            return Err(RpcError::HandshakeFailed);
        }
        Ok(())
    }

    pub(crate) fn send_request(&mut self, req: &RpcMessage) -> Result<()> {
        let result = self.transport.send(req);
        if let Err(err) = &result {
            self.log_failure(req.function, "send", err);
        }
        result
    }

    /// Polls until a message tagged `expected` arrives, routing everything else
    /// to the event sink.
    pub(crate) fn wait_for(&mut self, expected: Function) -> Result<RpcMessage> {
        let timeout = self.ctx.config.timeout();
        let result = poll_until(timeout, || self.poll_response(expected));
        if let Err(err) = &result {
            self.log_failure(expected, "receive", err);
        }
        result
    }

    /// Receives at most one message without blocking. Returns it if it is
    /// tagged `expected`; anything else goes to the event sink.
    pub(crate) fn poll_response(&mut self, expected: Function) -> Result<Option<RpcMessage>> {
        let Some(msg) = self.transport.try_recv()? else {
            return Ok(None);
        };
        if msg.function == expected {
            return Ok(Some(msg));
        }
        let function = msg.function;
        if let Err(err) = self.events.handle(msg) {
            tracing::warn!(%function, %err, "GSP event handler failed");
        }
        Ok(None)
    }

    /// Picks up a response that arrives while the call is still busy with
    /// something else, such as streaming. A failed response ends the call
    /// early; a successful one is parked in `slot`.
    pub(crate) fn watch_response(&mut self, expected: Function, slot: &mut Option<RpcMessage>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }
        if let Some(resp) = self.poll_response(expected)? {
            self.check_result(expected, &resp)?;
            *slot = Some(resp);
        }
        Ok(())
    }

    pub(crate) fn check_result(&self, function: Function, resp: &RpcMessage) -> Result<()> {
        let code = resp.rpc_result;
        if code == RESULT_SUCCESS {
            return Ok(());
        }
        let err = if code < RESULT_RESERVED_BASE {
            RpcError::Peer { function, code }
        } else {
            RpcError::PeerGeneric { function, code }
        };
        self.log_failure(function, "result", &err);
        Err(err)
    }

    fn log_failure(&self, function: Function, stage: &'static str, err: &RpcError) {
        if self.ctx.config.quiet {
            tracing::debug!(%function, stage, %err, "GSP RPC failed");
        } else {
            tracing::error!(%function, stage, %err, "GSP RPC failed");
        }
    }
}

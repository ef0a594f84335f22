//! Messages larger than one element.
//!
//! The first record carries the real function id and as much of the body as
//! fits. The rest follows in `CONTINUATION_RECORD`s of `capacity − header` body
//! bytes each. A bidirectional call gets its response back the same way and
//! the pieces are put back together under the original function id.

use crate::error::{Result, TransportFault};
use crate::layout::RpcHeader;
use crate::message::{Function, RpcMessage};
use crate::rpc::{RpcEngine, RpcTransport};

/// How a body of `total` bytes splits into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total: usize,
    first: usize,
    continuation: usize,
}

impl ChunkPlan {
    /// `capacity` is the record budget per element and `header` the part of it
    /// every record spends on its header.
    pub fn new(total: usize, capacity: usize, header: usize) -> core::result::Result<Self, TransportFault> {
        if capacity <= header {
            return Err(TransportFault::Malformed("record capacity does not exceed its header"));
        }
        let per_record = capacity - header;
        Ok(Self {
            total,
            first: total.min(per_record),
            continuation: per_record,
        })
    }

    pub fn first_len(&self) -> usize {
        self.first
    }

    pub fn continuation_len(&self) -> usize {
        self.continuation
    }

    pub fn continuation_count(&self) -> usize {
        (self.total - self.first).div_ceil(self.continuation)
    }

    pub fn record_count(&self) -> usize {
        1 + self.continuation_count()
    }

    /// Body slices in send order; always yields at least one (possibly empty)
    /// slice.
    pub fn split<'a>(&self, body: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        let (first, rest) = body.split_at(self.first.min(body.len()));
        std::iter::once(first).chain(rest.chunks(self.continuation))
    }
}

/// Collects response pieces until `total` bytes have arrived.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    total: usize,
    capacity: usize,
    header: usize,
}

impl Reassembler {
    pub fn new(total: usize, capacity: usize, header: usize) -> Self {
        Self {
            buf: Vec::with_capacity(total),
            total,
            capacity,
            header,
        }
    }

    /// Appends one record's body. `record_len` is the length the record
    /// declared and must lie in `[header, capacity]`.
    pub fn push(&mut self, record_len: usize, body: &[u8]) -> core::result::Result<(), TransportFault> {
        if record_len < self.header || record_len > self.capacity {
            return Err(TransportFault::Malformed("record length out of range"));
        }
        let take = self.remaining().min(body.len());
        self.buf.extend_from_slice(&body[..take]);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.total - self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() == self.total
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl<T: RpcTransport> RpcEngine<T> {
    /// Sends a message of any size and waits for the response.
    ///
    /// With `bidirectional`, a request that needed continuation records is
    /// answered with a response of the same total size, which is reassembled
    /// before returning.
    pub fn call_large(&mut self, req: RpcMessage, bidirectional: bool) -> Result<RpcMessage> {
        self.ensure_callable()?;
        let function = req.function;
        let token = self.context_mut().meter_mut().start(function);
        let result = self
            .send_records(&req)
            .and_then(|plan| self.receive_records(function, &plan, req.body.len(), bidirectional));
        self.context_mut().meter_mut().finish(token);
        result
    }

    /// Sends a message of any size without waiting.
    pub fn call_large_async(&mut self, req: &RpcMessage) -> Result<()> {
        self.ensure_callable()?;
        self.send_records(req).map(|_| ())
    }

    fn send_records(&mut self, req: &RpcMessage) -> Result<ChunkPlan> {
        let plan = ChunkPlan::new(req.body.len(), self.record_capacity(), RpcHeader::SIZE_BYTES)?;
        let zero_header = self.context().config().encryption;

        for (i, chunk) in plan.split(&req.body).enumerate() {
            let record = if i == 0 {
                RpcMessage {
                    function: req.function,
                    rpc_result: req.rpc_result,
                    rpc_result_private: req.rpc_result_private,
                    body: chunk.to_vec(),
                }
            } else if zero_header {
                RpcMessage {
                    function: Function::CONTINUATION_RECORD,
                    rpc_result: 0,
                    rpc_result_private: 0,
                    body: chunk.to_vec(),
                }
            } else {
                RpcMessage {
                    function: Function::CONTINUATION_RECORD,
                    rpc_result: req.rpc_result,
                    rpc_result_private: req.rpc_result_private,
                    body: chunk.to_vec(),
                }
            };
            self.send_request(&record)?;
        }

        if plan.continuation_count() > 0 {
            tracing::trace!(
                function = %req.function,
                len = req.body.len(),
                records = plan.record_count(),
                "GSP RPC: sent large message"
            );
        }
        Ok(plan)
    }

    fn receive_records(
        &mut self,
        function: Function,
        plan: &ChunkPlan,
        total: usize,
        bidirectional: bool,
    ) -> Result<RpcMessage> {
        let first = self.wait_for(function)?;
        self.check_result(function, &first)?;
        if !bidirectional || plan.continuation_count() == 0 {
            return Ok(first);
        }

        let mut pieces = Reassembler::new(total, self.record_capacity(), RpcHeader::SIZE_BYTES);
        pieces.push(first.record_len(), &first.body)?;
        while !pieces.is_complete() {
            let next = self.wait_for(Function::CONTINUATION_RECORD)?;
            pieces.push(next.record_len(), &next.body)?;
        }

        Ok(RpcMessage {
            function,
            rpc_result: first.rpc_result,
            rpc_result_private: first.rpc_result_private,
            body: pieces.into_inner(),
        })
    }
}

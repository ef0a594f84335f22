//! Per-GPU-instance RPC state, created at attach and dropped at detach.

use std::sync::{Mutex, MutexGuard};

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::meter::MeterEntry;
use crate::rpc::{RpcEngine, RpcTransport};

/// One attached GPU instance.
///
/// All calls go through [`Device::lock`]; the guard is held for the whole
/// call, so calls on one device never interleave.
pub struct Device<T> {
    instance: u32,
    rpc: Mutex<RpcEngine<T>>,
}

impl<T: RpcTransport> Device<T> {
    pub fn attach(instance: u32, transport: T, config: TransportConfig) -> Result<Self> {
        let engine = RpcEngine::new(transport, config)?;
        tracing::info!(instance, capacity = engine.record_capacity(), "GSP RPC device attached");
        Ok(Self {
            instance,
            rpc: Mutex::new(engine),
        })
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, RpcEngine<T>>> {
        self.rpc
            .lock()
            .map_err(|_| RpcError::InvalidState("device lock poisoned"))
    }

    /// Snapshot of the metered calls so far.
    pub fn meter_entries(&self) -> Result<Vec<MeterEntry>> {
        Ok(self.lock()?.context().meter().entries().to_vec())
    }

    /// Tears the instance down and hands back its transport.
    pub fn detach(self) -> Result<T> {
        let engine = self
            .rpc
            .into_inner()
            .map_err(|_| RpcError::InvalidState("device lock poisoned"))?;
        tracing::info!(
            instance = self.instance,
            metered = engine.context().meter().entries().len(),
            "GSP RPC device detached"
        );
        Ok(engine.into_transport())
    }
}

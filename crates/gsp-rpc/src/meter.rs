//! Per-device record of synchronous call timings.

use std::time::{Duration, Instant};

use crate::message::Function;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterEntry {
    pub function: Function,
    pub start: Instant,
    pub end: Option<Instant>,
}

impl MeterEntry {
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.duration_since(self.start))
    }
}

#[derive(Debug, Default)]
pub struct RpcMeter {
    enabled: bool,
    entries: Vec<MeterEntry>,
}

impl RpcMeter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns a token for [`RpcMeter::finish`], or `None` when disabled.
    pub fn start(&mut self, function: Function) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.entries.push(MeterEntry {
            function,
            start: Instant::now(),
            end: None,
        });
        Some(self.entries.len() - 1)
    }

    pub fn finish(&mut self, token: Option<usize>) {
        if let Some(entry) = token.and_then(|i| self.entries.get_mut(i)) {
            entry.end = Some(Instant::now());
        }
    }

    pub fn entries(&self) -> &[MeterEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_meter_records_nothing() {
        let mut meter = RpcMeter::new(false);
        let token = meter.start(Function::NOP);
        meter.finish(token);
        assert!(meter.entries().is_empty());
    }

    #[test]
    fn entries_are_closed_in_order() {
        let mut meter = RpcMeter::new(true);
        let a = meter.start(Function::ALLOC_ROOT);
        let b = meter.start(Function::FREE);
        meter.finish(b);
        assert!(meter.entries()[0].end.is_none());
        meter.finish(a);
        assert!(meter.entries().iter().all(|e| e.duration().is_some()));
        meter.clear();
        assert!(meter.entries().is_empty());
    }
}

//! Unsolicited peer messages received while a call waits for its response.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Result, RpcError};
use crate::message::RpcMessage;

pub trait EventSink: Send {
    fn handle(&mut self, event: RpcMessage) -> Result<()>;
}

/// Logs and drops every event.
#[derive(Debug, Default)]
pub struct LogEvents;

impl EventSink for LogEvents {
    fn handle(&mut self, event: RpcMessage) -> Result<()> {
        tracing::debug!(
            function = %event.function,
            len = event.body.len(),
            "dropping unsolicited GSP message"
        );
        Ok(())
    }
}

/// Keeps up to `limit` events for the owner to drain later.
///
/// Clones share the same backlog.
#[derive(Debug, Clone)]
pub struct EventBacklog {
    events: Arc<Mutex<VecDeque<RpcMessage>>>,
    limit: usize,
}

impl EventBacklog {
    pub fn new(limit: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            limit,
        }
    }

    pub fn drain(&self) -> Vec<RpcMessage> {
        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for EventBacklog {
    fn handle(&mut self, event: RpcMessage) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| RpcError::InvalidState("event backlog lock poisoned"))?;
        if events.len() >= self.limit {
            return Err(RpcError::InvalidState("event backlog full"));
        }
        events.push_back(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Function;

    #[test]
    fn backlog_is_bounded() {
        let mut backlog = EventBacklog::new(1);
        let reader = backlog.clone();
        backlog
            .handle(RpcMessage::new(Function::EVENT_POST_EVENT, vec![1]))
            .unwrap();
        assert!(backlog
            .handle(RpcMessage::new(Function::EVENT_POST_EVENT, vec![2]))
            .is_err());
        let drained = reader.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, vec![1]);
        assert!(reader.is_empty());
    }
}

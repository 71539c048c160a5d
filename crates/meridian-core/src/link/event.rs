//! Link event delivery
//!
//! Out-of-band notifications (errors, state changes, attentions) flow through
//! an explicit hub instead of registered callback pointers. Producers never
//! block: subscribers get bounded channels that drop on overflow, and a small
//! polled history ring is kept for applications that prefer polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use super::error::LinkError;
use super::net::LinkSessionState;
use super::packet::Packet;

/// Depth of the polled event history
const EVENT_HISTORY_MAX: usize = 64;

/// Default depth of subscriber channels
const SUBSCRIBER_DEPTH: usize = 64;

/// Out-of-band notification from a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// An error was observed; `node` names the node involved when known,
    /// `packet` carries the frame that triggered it when one exists.
    Error {
        /// Node involved, when known
        node: Option<u8>,
        /// The error observed
        error: LinkError,
        /// Frame that triggered the error, when one exists
        packet: Option<Packet>,
    },
    /// The link session state changed
    StateChanged {
        /// Previous state
        from: LinkSessionState,
        /// New state
        to: LinkSessionState,
    },
    /// The node inventory after recovery differs from the last known one;
    /// callers must re-enumerate.
    TopologyChanged {
        /// Node count before the fault
        was: usize,
        /// Node count found by recovery
        now: usize,
    },
    /// Recovery probing found no connectivity
    NodesOffline,
    /// A node raised an attention
    Attention {
        /// Raising node
        node: u8,
        /// Attention register bits
        bits: u32,
    },
    /// Attentions arrived faster than they were drained; some were lost
    AttentionOverrun,
    /// A data acquisition sample sequence was non-contiguous
    DataAcqGap {
        /// Node with the gap
        node: u8,
        /// Expected sequence number
        expected: u8,
        /// Received sequence number
        got: u8,
    },
    /// A node delivered network diagnostic counters
    DiagInfo {
        /// Reporting node
        node: u8,
        /// Raw diagnostic payload
        payload: Vec<u8>,
    },
}

/// Fan-out point for link events
pub struct EventHub {
    subscribers: Mutex<Vec<SyncSender<LinkEvent>>>,
    history: Mutex<VecDeque<LinkEvent>>,
    dropped: AtomicU64,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY_MAX)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; events overflowing its channel are dropped,
    /// never waited on.
    pub fn subscribe(&self) -> Receiver<LinkEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_DEPTH);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Pop the oldest event from the polled history
    pub fn poll(&self) -> Option<LinkEvent> {
        self.history.lock().unwrap().pop_front()
    }

    /// Events dropped due to subscriber back-pressure or history overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Push an event to history and all live subscribers without blocking
    pub(crate) fn publish(&self, event: LinkEvent) {
        {
            let mut history = self.history.lock().unwrap();
            if history.len() >= EVENT_HISTORY_MAX {
                history.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Convenience wrapper for error events
    pub(crate) fn publish_error(
        &self,
        node: Option<u8>,
        error: LinkError,
        packet: Option<Packet>,
    ) {
        self.publish(LinkEvent::Error {
            node,
            error,
            packet,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_poll() {
        let hub = EventHub::new();
        hub.publish(LinkEvent::NodesOffline);
        assert_eq!(hub.poll(), Some(LinkEvent::NodesOffline));
        assert_eq!(hub.poll(), None);
    }

    #[test]
    fn test_subscriber_receives() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        hub.publish_error(Some(3), LinkError::ResponseTimeout, None);
        match rx.try_recv().unwrap() {
            LinkEvent::Error { node, error, .. } => {
                assert_eq!(node, Some(3));
                assert_eq!(error, LinkError::ResponseTimeout);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_overflow_drops_without_blocking() {
        let hub = EventHub::new();
        let _rx = hub.subscribe();
        for _ in 0..(SUBSCRIBER_DEPTH + 10) {
            hub.publish(LinkEvent::NodesOffline);
        }
        assert!(hub.dropped() >= 10);
    }

    #[test]
    fn test_disconnected_subscriber_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe());
        hub.publish(LinkEvent::NodesOffline);
        assert_eq!(hub.subscribers.lock().unwrap().len(), 0);
    }
}

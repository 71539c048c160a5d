//! Send/receive trace rings

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Depth of the trace ring for sent commands
pub const SEND_TRACE_DEPTH: usize = 4096;

/// Depth of the trace ring for received frames
pub const RECV_TRACE_DEPTH: usize = SEND_TRACE_DEPTH;

/// One sent frame
#[derive(Debug, Clone, PartialEq)]
pub struct SendRecord {
    /// Milliseconds since the log was created
    pub timestamp_ms: f64,
    /// Send serial number (wrapping)
    pub serial: u32,
    /// Commands outstanding when this one was sent
    pub depth: u32,
    /// Copy of the wire frame
    pub frame: Vec<u8>,
    /// Trace code of the send outcome (0 = sent clean)
    pub error: u16,
}

/// One received frame (or receive failure)
#[derive(Debug, Clone, PartialEq)]
pub struct RecvRecord {
    /// Milliseconds since the log was created
    pub timestamp_ms: f64,
    /// Receive serial number (wrapping)
    pub serial: u32,
    /// Send serial of the matched command, if the frame retired one
    pub matched_send: Option<u32>,
    /// Per-queue response count at match time
    pub node_count: u32,
    /// Copy of the wire frame (empty on receive failure)
    pub frame: Vec<u8>,
    /// Trace code of the receive outcome (0 = clean)
    pub error: u16,
}

struct Ring<T> {
    records: VecDeque<T>,
    next_serial: u32,
    depth: usize,
}

impl<T> Ring<T> {
    fn new(depth: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(depth.min(256)),
            next_serial: 0,
            depth,
        }
    }

    fn push(&mut self, record: T) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.records.len() >= self.depth {
            self.records.pop_front();
        }
        self.records.push_back(record);
        serial
    }
}

/// Per-link trace state
pub struct TraceLog {
    started: Instant,
    send: Mutex<Ring<SendRecord>>,
    recv: Mutex<Ring<RecvRecord>>,
    enabled: AtomicBool,
    armed: AtomicBool,
}

impl TraceLog {
    /// Create an enabled, unarmed trace log
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            send: Mutex::new(Ring::new(SEND_TRACE_DEPTH)),
            recv: Mutex::new(Ring::new(RECV_TRACE_DEPTH)),
            enabled: AtomicBool::new(true),
            armed: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Enable/disable recording (serial numbers keep advancing regardless)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Recording state
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Arm automatic dump-file creation on link faults
    pub fn arm_dump(&self, armed: bool) {
        self.armed.store(armed, Ordering::Relaxed);
    }

    /// Whether a link fault should produce a dump file
    pub fn dump_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    /// Record a sent frame; returns its send serial number
    pub fn log_send(&self, frame: &[u8], depth: u32, error: u16) -> u32 {
        let mut ring = self.send.lock().unwrap();
        if !self.is_enabled() {
            let serial = ring.next_serial;
            ring.next_serial = ring.next_serial.wrapping_add(1);
            return serial;
        }
        let record = SendRecord {
            timestamp_ms: self.now_ms(),
            serial: ring.next_serial,
            depth,
            frame: frame.to_vec(),
            error,
        };
        ring.push(record)
    }

    /// Record a received frame; returns its receive serial number
    pub fn log_receive(
        &self,
        frame: &[u8],
        matched_send: Option<u32>,
        node_count: u32,
        error: u16,
    ) -> u32 {
        let mut ring = self.recv.lock().unwrap();
        if !self.is_enabled() {
            let serial = ring.next_serial;
            ring.next_serial = ring.next_serial.wrapping_add(1);
            return serial;
        }
        let record = RecvRecord {
            timestamp_ms: self.now_ms(),
            serial: ring.next_serial,
            matched_send,
            node_count,
            frame: frame.to_vec(),
            error,
        };
        ring.push(record)
    }

    /// Copy out both rings for a dump
    pub fn snapshot(&self) -> (Vec<SendRecord>, Vec<RecvRecord>) {
        let send = self.send.lock().unwrap().records.iter().cloned().collect();
        let recv = self.recv.lock().unwrap().records.iter().cloned().collect();
        (send, recv)
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}

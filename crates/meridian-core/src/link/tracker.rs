//! Command/response tracking
//!
//! Every command in flight owns one slot from a fixed arena and one position
//! in a FIFO pending queue (one queue per node address plus one for
//! high-priority control frames). The link guarantees per-node response
//! order, so the queue head is always the frame a response retires.
//!
//! The arena is index-addressed: queues hold slot indices, the free list is a
//! stack of indices, and slots are recycled for the life of the link. Nothing
//! here allocates per command beyond the payload copies themselves.
//!
//! Locking: one mutex (`state`) covers the arena and all queues. It is held
//! only for queue manipulation, never across I/O or a blocking wait; the
//! read engine must be able to retire a response while a caller is blocked.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::error::LinkError;
use super::packet::{Packet, MAX_NODES};

/// Hard upper bound on simultaneously outstanding commands; the slot arena
/// is sized to this so a pacing-limit change never invalidates slots.
pub const RING_CMDS_LIMIT: usize = 14;

/// Default number of simultaneous commands allowed on the link
pub const DEFAULT_CMDS_IN_FLIGHT: usize = 3;

/// Which pending queue a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueClass {
    /// Ordinary per-node traffic
    Node(u8),
    /// High-priority control frames (not node related)
    Control,
}

impl QueueClass {
    pub(crate) fn for_packet(pkt: &Packet) -> Self {
        if pkt.is_high_priority() {
            QueueClass::Control
        } else {
            QueueClass::Node(pkt.addr)
        }
    }
}

/// Timing statistics for one completed command
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionStats {
    /// Time spent transmitting the command
    pub send_time: Duration,
    /// Time from transmit completion to response match
    pub rx_time: Duration,
    /// Commands outstanding when this one was sent
    pub ring_depth: u32,
}

#[derive(Debug)]
pub(crate) enum SlotOutcome {
    Pending,
    Matched(Packet),
    Failed(LinkError),
}

#[derive(Debug)]
struct TrackingSlot {
    command: Packet,
    outcome: SlotOutcome,
    send_serial: u32,
    node_send_count: u32,
    sent_at: Instant,
    stats: CompletionStats,
}

#[derive(Debug, Default)]
struct PendingQueue {
    pending: VecDeque<usize>,
    send_count: u32,
    resp_count: u32,
}

struct TrackerState {
    slots: Vec<Option<TrackingSlot>>,
    free: Vec<usize>,
    nodes: Vec<PendingQueue>,
    control: PendingQueue,
    outstanding: usize,
}

impl TrackerState {
    fn queue_mut(&mut self, class: QueueClass) -> &mut PendingQueue {
        match class {
            QueueClass::Node(addr) => &mut self.nodes[addr as usize & (MAX_NODES - 1)],
            QueueClass::Control => &mut self.control,
        }
    }
}

/// Result of waiting for a command's completion
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// The read engine matched a response
    Matched(Packet, CompletionStats),
    /// The slot was failed by flush, shutdown, or send cleanup
    Failed(LinkError),
    /// Nothing arrived inside the caller's timeout
    TimedOut,
}

/// Information about a head retirement, for logging
#[derive(Debug)]
pub(crate) struct Retirement {
    /// Send serial of the retired command
    pub send_serial: u32,
    /// Per-queue response count at match time
    pub resp_count: u32,
    /// The response arrived for a different send count than the head's;
    /// the head is still authoritative, but worth a log line.
    pub serial_mismatch: bool,
    /// Queue entries still outstanding across the whole link
    pub remaining: usize,
}

/// Fixed-capacity command/response tracking arena
pub(crate) struct ResponseTracker {
    state: Mutex<TrackerState>,
    completions: Vec<Condvar>,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                slots: (0..RING_CMDS_LIMIT).map(|_| None).collect(),
                free: (0..RING_CMDS_LIMIT).rev().collect(),
                nodes: (0..MAX_NODES).map(|_| PendingQueue::default()).collect(),
                control: PendingQueue::default(),
                outstanding: 0,
            }),
            completions: (0..RING_CMDS_LIMIT).map(|_| Condvar::new()).collect(),
        }
    }

    /// Take a free slot for `command`. Unreachable under the pacing
    /// invariant; failure here is a resource-class assertion, not a
    /// recoverable path.
    pub fn claim(&self, command: &Packet) -> Result<usize, LinkError> {
        let mut st = self.state.lock().unwrap();
        let idx = st.free.pop().ok_or(LinkError::TrackerExhausted)?;
        st.slots[idx] = Some(TrackingSlot {
            command: command.clone(),
            outcome: SlotOutcome::Pending,
            send_serial: 0,
            node_send_count: 0,
            sent_at: Instant::now(),
            stats: CompletionStats::default(),
        });
        Ok(idx)
    }

    /// Append a claimed slot to its pending queue. Caller must guarantee the
    /// enqueue order matches the transmit order (hold the writer lock).
    pub fn enqueue(&self, idx: usize) -> QueueClass {
        let mut st = self.state.lock().unwrap();
        let class = QueueClass::for_packet(&st.slots[idx].as_ref().expect("claimed slot").command);
        st.outstanding += 1;
        let depth = st.outstanding as u32;
        let queue = st.queue_mut(class);
        queue.send_count = queue.send_count.wrapping_add(1);
        let count = queue.send_count;
        queue.pending.push_back(idx);
        if let Some(slot) = st.slots[idx].as_mut() {
            slot.node_send_count = count;
            slot.stats.ring_depth = depth;
            slot.sent_at = Instant::now();
        }
        class
    }

    /// Record the trace serial assigned to a sent command
    pub fn set_send_serial(&self, idx: usize, serial: u32) {
        let mut st = self.state.lock().unwrap();
        if let Some(slot) = st.slots[idx].as_mut() {
            slot.send_serial = serial;
        }
    }

    /// Record how long the transmit took
    pub fn set_send_time(&self, idx: usize, elapsed: Duration) {
        let mut st = self.state.lock().unwrap();
        if let Some(slot) = st.slots[idx].as_mut() {
            slot.stats.send_time = elapsed;
        }
    }

    /// Send failed after enqueue: unlink the slot and recycle it.
    /// The caller still owns (and must release) its pacing unit.
    pub fn abort_send(&self, idx: usize) -> usize {
        let mut st = self.state.lock().unwrap();
        let class = match st.slots[idx].as_ref() {
            Some(slot) => QueueClass::for_packet(&slot.command),
            None => return st.outstanding,
        };
        let queue = st.queue_mut(class);
        if let Some(pos) = queue.pending.iter().position(|&i| i == idx) {
            queue.pending.remove(pos);
            st.outstanding -= 1;
        }
        st.slots[idx] = None;
        st.free.push(idx);
        st.outstanding
    }

    /// Claimed but never enqueued (precondition failure): just recycle.
    pub fn release_unqueued(&self, idx: usize) {
        let mut st = self.state.lock().unwrap();
        st.slots[idx] = None;
        st.free.push(idx);
    }

    /// Block until the slot resolves or `timeout` passes.
    ///
    /// On timeout the slot is unlinked from wherever it sits in its queue
    /// (not necessarily the head) and recycled. In every case the slot is
    /// free when this returns; the caller then releases its pacing unit.
    pub fn wait(&self, idx: usize, timeout: Duration) -> WaitOutcome {
        // An unrepresentable deadline is an explicit infinite-timeout request
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.state.lock().unwrap();
        loop {
            match &st.slots[idx] {
                Some(slot) if matches!(slot.outcome, SlotOutcome::Pending) => {}
                Some(_) => break,
                None => return WaitOutcome::Failed(LinkError::Closed),
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Timed out: unlink out-of-order and recycle
                        let class = QueueClass::for_packet(
                            &st.slots[idx].as_ref().expect("pending slot").command,
                        );
                        let queue = st.queue_mut(class);
                        if let Some(pos) = queue.pending.iter().position(|&i| i == idx) {
                            queue.pending.remove(pos);
                            st.outstanding -= 1;
                        }
                        st.slots[idx] = None;
                        st.free.push(idx);
                        return WaitOutcome::TimedOut;
                    }
                    let (guard, _) = self.completions[idx]
                        .wait_timeout(st, deadline - now)
                        .unwrap();
                    st = guard;
                }
                None => {
                    st = self.completions[idx].wait(st).unwrap();
                }
            }
        }
        let slot = st.slots[idx].take().expect("resolved slot");
        st.free.push(idx);
        match slot.outcome {
            SlotOutcome::Matched(resp) => WaitOutcome::Matched(resp, slot.stats),
            SlotOutcome::Failed(err) => WaitOutcome::Failed(err),
            SlotOutcome::Pending => unreachable!(),
        }
    }

    /// Retire the head of `class` with `response`, waking its caller.
    /// Returns `None` when no command is pending there (unsolicited frame).
    pub fn complete_head(&self, class: QueueClass, response: Packet) -> Option<Retirement> {
        let mut st = self.state.lock().unwrap();
        let queue = st.queue_mut(class);
        queue.resp_count = queue.resp_count.wrapping_add(1);
        let resp_count = queue.resp_count;
        let idx = queue.pending.pop_front()?;
        st.outstanding -= 1;
        let remaining = st.outstanding;
        let slot = st.slots[idx].as_mut().expect("queued slot");
        let mismatch = slot.node_send_count != resp_count;
        slot.stats.rx_time = slot.sent_at.elapsed().saturating_sub(slot.stats.send_time);
        slot.outcome = SlotOutcome::Matched(response);
        let serial = slot.send_serial;
        self.completions[idx].notify_all();
        Some(Retirement {
            send_serial: serial,
            resp_count,
            serial_mismatch: mismatch,
            remaining,
        })
    }

    /// Fail every queued command (flush, shutdown). Waiting callers wake
    /// with `err` and recycle their own slots; returns how many were failed.
    pub fn fail_all(&self, err: &LinkError) -> usize {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let mut failed = 0;
        let mut indices: Vec<usize> = Vec::with_capacity(RING_CMDS_LIMIT);
        for queue in st.nodes.iter_mut().chain(std::iter::once(&mut st.control)) {
            indices.extend(queue.pending.drain(..));
        }
        for idx in indices {
            if let Some(slot) = st.slots[idx].as_mut() {
                slot.outcome = SlotOutcome::Failed(err.clone());
                self.completions[idx].notify_all();
                failed += 1;
            }
        }
        st.outstanding = 0;
        failed
    }

    /// Commands currently queued for a response
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }
}

/// Counting gate bounding total outstanding commands on the link.
///
/// Acquire blocks with no timeout; every acquire must pair with exactly one
/// release across the success, failure, timeout, and flush paths.
pub(crate) struct PacingGate {
    state: Mutex<PaceState>,
    available_cv: Condvar,
}

struct PaceState {
    available: isize,
    limit: usize,
    in_flight: usize,
    high_water: usize,
    closed: bool,
}

impl PacingGate {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(PaceState {
                available: limit as isize,
                limit,
                in_flight: 0,
                high_water: 0,
                closed: false,
            }),
            available_cv: Condvar::new(),
        }
    }

    /// Take one pacing unit, blocking while the link is at its cap
    pub fn acquire(&self) -> Result<(), LinkError> {
        let mut st = self.state.lock().unwrap();
        while st.available <= 0 && !st.closed {
            st = self.available_cv.wait(st).unwrap();
        }
        if st.closed {
            return Err(LinkError::Closed);
        }
        st.available -= 1;
        st.in_flight += 1;
        if st.in_flight > st.high_water {
            st.high_water = st.in_flight;
        }
        Ok(())
    }

    /// Return one pacing unit. Exactly one release must pair with every
    /// acquire; an underflow is a resource-class assertion.
    pub fn release(&self) -> Result<(), LinkError> {
        let mut st = self.state.lock().unwrap();
        if st.in_flight == 0 {
            debug_assert!(false, "pacing release without acquire");
            return Err(LinkError::PaceUnderflow);
        }
        st.available += 1;
        st.in_flight -= 1;
        self.available_cv.notify_one();
        Ok(())
    }

    /// Change the cap; commands already in flight are unaffected
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.clamp(1, RING_CMDS_LIMIT);
        let mut st = self.state.lock().unwrap();
        let delta = limit as isize - st.limit as isize;
        st.available += delta;
        st.limit = limit;
        if delta > 0 {
            self.available_cv.notify_all();
        }
    }

    pub fn limit(&self) -> usize {
        self.state.lock().unwrap().limit
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Highest simultaneous in-flight count seen (pacing invariant check)
    pub fn high_water(&self) -> usize {
        self.state.lock().unwrap().high_water
    }

    /// Wake every blocked acquirer with `Closed` (link teardown)
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        self.available_cv.notify_all();
    }
}

/// Gate that spins user commands out while recovery diagnostics run
pub(crate) struct CmdGate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl CmdGate {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }

    pub fn open(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cv.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    /// Wait up to `timeout` for the gate to open; false = still closed
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let open = self.open.lock().unwrap();
        let (open, _) = self
            .cv
            .wait_timeout_while(open, timeout, |open| !*open)
            .unwrap();
        *open
    }
}

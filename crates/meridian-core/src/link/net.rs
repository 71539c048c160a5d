//! Link session management
//!
//! Handles the per-link context: command dispatch, session state, node
//! inventory, and the lifecycle of the read and recovery threads.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::error::{LinkError, NodeErrorClass, NodeNetCode};
use super::event::{EventHub, LinkEvent};
use super::packet::{ext_high, Packet, PacketType, MAX_NODES};
use super::read::{read_loop, ReadControl};
use super::recovery::{recovery_loop, RecoveryControl};
use super::tracker::{
    CmdGate, PacingGate, ResponseTracker, WaitOutcome, DEFAULT_CMDS_IN_FLIGHT, RING_CMDS_LIMIT,
};
use super::transport::LinkTransport;
use super::{
    BREAK_DURATION, FRAME_READ_TIMEOUT, FRAME_WRITE_TIMEOUT, RESPONSE_TIMEOUT,
};
use crate::trace::{dump_next, DumpHeader, TraceLog};

/// Attempts at the address-assignment frame during enumeration
const SET_ADDR_ATTEMPTS: usize = 3;

/// Attention entries buffered before overrun
const ATTN_OVERFLOW_LVL: usize = 32;

/// Data acquisition samples buffered per node before overflow
const DATAACQ_OVERFLOW_LVL: usize = 2000;

/// Supported network rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetRate {
    /// 1x net speed; also the post-break rate every node falls back to
    Baud9600,
    /// 12x net speed
    Baud115200,
    /// 24x net speed
    Baud230400,
    /// 48x net speed
    Baud460800,
    /// 96x net speed
    Baud921600,
    /// 108x net speed
    Baud1036800,
}

impl NetRate {
    /// Rate in bits per second
    pub fn bps(self) -> u32 {
        match self {
            NetRate::Baud9600 => 9_600,
            NetRate::Baud115200 => 115_200,
            NetRate::Baud230400 => 230_400,
            NetRate::Baud460800 => 460_800,
            NetRate::Baud921600 => 921_600,
            NetRate::Baud1036800 => 1_036_800,
        }
    }

    /// Argument of the baud-rate control frame (multiple of the base rate)
    pub fn divider(self) -> u8 {
        (self.bps() / 9_600) as u8
    }
}

/// Link session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSessionState {
    /// Port closed, nothing running
    Closed,
    /// Port open, connectivity not (re)established yet
    Searching,
    /// Nodes enumerated, commands flowing
    Online,
    /// Port handed over for firmware flashing; protocol suspended
    Flashing,
}

/// Link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial port name
    pub port_name: String,
    /// Operating rate after bring-up
    pub rate: NetRate,
    /// Simultaneous commands allowed in the ring
    pub pacing_limit: usize,
    /// Default response timeout for `run_command`
    pub response_timeout: Duration,
    /// Arm the recovery engine on link-class errors
    pub auto_recovery: bool,
    /// Where automatic trace dumps go; `None` disables them
    pub dump_dir: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            rate: NetRate::Baud115200,
            pacing_limit: DEFAULT_CMDS_IN_FLIGHT,
            response_timeout: RESPONSE_TIMEOUT,
            auto_recovery: true,
            dump_dir: None,
        }
    }
}

/// Last-known nodes on the link, used to detect topology changes across a
/// recovery cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Device ID of each node, indexed by address
    pub device_ids: Vec<u16>,
}

impl Inventory {
    /// Nodes on the link
    pub fn node_count(&self) -> usize {
        self.device_ids.len()
    }
}

/// An asynchronous attention raised by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attention {
    /// Raising node
    pub node: u8,
    /// Attention register bits
    pub bits: u32,
}

/// One data acquisition sample from a node
#[derive(Debug, Clone, PartialEq)]
pub struct DataAcqSample {
    /// Originating node
    pub node: u8,
    /// Wrapping sequence number
    pub sequence: u8,
    /// Raw sample payload
    pub data: Vec<u8>,
}

pub(crate) struct SessionInner {
    pub state: LinkSessionState,
    pub root_error: Option<LinkError>,
    pub root_node: Option<u8>,
    pub inventory_now: Inventory,
    pub inventory_last: Inventory,
}

pub(crate) struct AttnState {
    pub queue: VecDeque<Attention>,
    pub overrun: bool,
}

#[derive(Default)]
pub(crate) struct DataAcqState {
    pub queue: VecDeque<DataAcqSample>,
    pub next_seq: u8,
    pub primed: bool,
    pub overflow: bool,
    pub sample_count: u64,
}

/// Shared per-link context; everything the three thread roles touch
pub(crate) struct LinkCore {
    pub config: LinkConfig,
    pub writer: Mutex<Box<dyn LinkTransport>>,
    pub tracker: ResponseTracker,
    pub pace: PacingGate,
    pub gate: CmdGate,
    pub session: Mutex<SessionInner>,
    pub events: EventHub,
    pub trace: TraceLog,
    pub read: ReadControl,
    pub recovery: RecoveryControl,
    pub terminate: AtomicBool,
    pub flush_epoch: AtomicU32,
    pub auto_recovery: AtomicBool,
    init_depth: AtomicU32,
    dump_counter: AtomicU32,
    read_thread: Mutex<Option<ThreadId>>,
    recovery_thread: Mutex<Option<ThreadId>>,
    pub attn: Mutex<AttnState>,
    pub dataacq: Mutex<Vec<DataAcqState>>,
    cmds_in_play: Mutex<usize>,
    cmds_idle: Condvar,
}

/// RAII guard counting callers inside `run_command`, so teardown can wait
/// for the link to quiesce
struct CmdsInPlay<'a> {
    core: &'a LinkCore,
}

impl<'a> CmdsInPlay<'a> {
    fn enter(core: &'a LinkCore) -> Self {
        *core.cmds_in_play.lock().unwrap() += 1;
        Self { core }
    }
}

impl Drop for CmdsInPlay<'_> {
    fn drop(&mut self) {
        let mut count = self.core.cmds_in_play.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.core.cmds_idle.notify_all();
        }
    }
}

/// RAII guard marking the link as initializing; commands are allowed while
/// at least one guard is alive even though the session is not `Online` yet.
pub(crate) struct InitGuard<'a> {
    core: &'a LinkCore,
}

impl<'a> InitGuard<'a> {
    pub fn new(core: &'a LinkCore) -> Self {
        core.init_depth.fetch_add(1, Ordering::SeqCst);
        Self { core }
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.core.init_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One pacing unit held for the duration of a dispatch path
struct PaceGuard<'a> {
    core: &'a LinkCore,
}

impl Drop for PaceGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.core.pace.release() {
            error!("pacing release failed: {err}");
            self.core.events.publish_error(None, err, None);
        }
    }
}

impl LinkCore {
    pub fn new(config: LinkConfig, writer: Box<dyn LinkTransport>) -> Self {
        let pacing = config.pacing_limit.clamp(1, RING_CMDS_LIMIT);
        let auto = config.auto_recovery;
        Self {
            config,
            writer: Mutex::new(writer),
            tracker: ResponseTracker::new(),
            pace: PacingGate::new(pacing),
            gate: CmdGate::new(),
            session: Mutex::new(SessionInner {
                state: LinkSessionState::Searching,
                root_error: None,
                root_node: None,
                inventory_now: Inventory::default(),
                inventory_last: Inventory::default(),
            }),
            events: EventHub::new(),
            trace: TraceLog::new(),
            read: ReadControl::new(),
            recovery: RecoveryControl::new(),
            terminate: AtomicBool::new(false),
            flush_epoch: AtomicU32::new(0),
            auto_recovery: AtomicBool::new(auto),
            init_depth: AtomicU32::new(0),
            dump_counter: AtomicU32::new(0),
            read_thread: Mutex::new(None),
            recovery_thread: Mutex::new(None),
            attn: Mutex::new(AttnState {
                queue: VecDeque::new(),
                overrun: false,
            }),
            dataacq: Mutex::new((0..MAX_NODES).map(|_| DataAcqState::default()).collect()),
            cmds_in_play: Mutex::new(0),
            cmds_idle: Condvar::new(),
        }
    }

    // ---------------------------------
    // Thread identity
    // ---------------------------------

    pub fn register_read_thread(&self) {
        *self.read_thread.lock().unwrap() = Some(thread::current().id());
    }

    pub fn register_recovery_thread(&self) {
        *self.recovery_thread.lock().unwrap() = Some(thread::current().id());
    }

    pub fn is_read_thread(&self) -> bool {
        *self.read_thread.lock().unwrap() == Some(thread::current().id())
    }

    pub fn is_recovery_thread(&self) -> bool {
        *self.recovery_thread.lock().unwrap() == Some(thread::current().id())
    }

    // ---------------------------------
    // Session state
    // ---------------------------------

    pub fn session_state(&self) -> LinkSessionState {
        self.session.lock().unwrap().state
    }

    pub fn set_session_state(&self, to: LinkSessionState) {
        let from = {
            let mut session = self.session.lock().unwrap();
            let from = session.state;
            session.state = to;
            if to == LinkSessionState::Online {
                session.root_error = None;
                session.root_node = None;
            }
            from
        };
        if from != to {
            self.events.publish(LinkEvent::StateChanged { from, to });
        }
    }

    /// Record the first error of an offline episode; later ones are kept
    /// only in the trace.
    pub fn set_root_error(&self, err: &LinkError, node: Option<u8>) {
        let mut session = self.session.lock().unwrap();
        if session.root_error.is_none() {
            session.root_error = Some(err.clone());
            session.root_node = node;
        }
    }

    pub fn root_error(&self) -> Option<(LinkError, Option<u8>)> {
        let session = self.session.lock().unwrap();
        session
            .root_error
            .clone()
            .map(|e| (e, session.root_node))
    }

    fn initializing(&self) -> bool {
        self.init_depth.load(Ordering::SeqCst) > 0
    }

    // ---------------------------------
    // Command dispatch
    // ---------------------------------

    /// Send `command` and block until its response, a failure, or `timeout`
    pub fn run_command(&self, command: &Packet, timeout: Duration) -> Result<Packet, LinkError> {
        if self.terminate.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let _in_play = CmdsInPlay::enter(self);

        let state = self.session_state();
        match state {
            LinkSessionState::Closed => return Err(LinkError::Closed),
            LinkSessionState::Flashing => return Err(LinkError::Flashing),
            _ => {}
        }
        if self.is_read_thread() {
            return Err(LinkError::FromReadThread);
        }
        let in_recovery = self.is_recovery_thread();

        // While recovery diagnostics run, user commands are cancelled after
        // a bounded wait instead of piling up behind the gate.
        if !in_recovery && !self.gate.wait_open(FRAME_WRITE_TIMEOUT) {
            return Err(LinkError::Canceled);
        }

        // Block here when too many commands are in the ring. Every exit path
        // below releases exactly once via the guard.
        self.pace.acquire()?;
        let _pace = PaceGuard { core: self };

        if !in_recovery && !self.initializing() && state != LinkSessionState::Online {
            self.trace.log_send(
                &command.encode(),
                self.tracker.outstanding() as u32,
                LinkError::Offline.trace_code(),
            );
            return Err(LinkError::Offline);
        }

        let idx = match self.tracker.claim(command) {
            Ok(idx) => idx,
            Err(err) => {
                // Unreachable while pacing holds; a real occurrence is a
                // driver bug, not a link condition.
                error!("tracking pool exhausted with pacing held: {err}");
                self.events.publish_error(None, err.clone(), Some(command.clone()));
                return Err(err);
            }
        };

        let frame = command.encode();
        let send_started = Instant::now();
        let send_result = {
            // The writer lock serializes transmit order; enqueueing under it
            // keeps queue order identical to wire order.
            let mut writer = self.writer.lock().unwrap();
            self.tracker.enqueue(idx);
            writer.write_all(&frame).and_then(|_| writer.flush())
        };
        let depth = self.tracker.outstanding() as u32;

        match send_result {
            Ok(()) => {
                let serial = self.trace.log_send(&frame, depth, 0);
                self.tracker.set_send_serial(idx, serial);
                self.tracker.set_send_time(idx, send_started.elapsed());
                self.read.start();

                match self.tracker.wait(idx, timeout) {
                    WaitOutcome::Matched(resp, _stats) => self.interpret_response(command, resp),
                    WaitOutcome::Failed(err) => Err(err),
                    WaitOutcome::TimedOut => {
                        debug!(
                            node = command.addr,
                            "response timeout after {:?}", timeout
                        );
                        self.trace.log_receive(
                            &[],
                            None,
                            0,
                            LinkError::ResponseTimeout.trace_code(),
                        );
                        if self.tracker.outstanding() > 0 {
                            self.read.start();
                        }
                        if state == LinkSessionState::Online {
                            self.report_link_error(
                                LinkError::ResponseTimeout,
                                Some(command.addr),
                                Some(command.clone()),
                            );
                        }
                        Err(LinkError::ResponseTimeout)
                    }
                }
            }
            Err(io_err) => {
                warn!("send failed: {io_err}");
                let remaining = self.tracker.abort_send(idx);
                self.trace
                    .log_send(&frame, depth, LinkError::SendFailed.trace_code());
                if remaining > 0 {
                    self.read.start();
                }
                self.report_link_error(
                    LinkError::SendFailed,
                    Some(command.addr),
                    Some(command.clone()),
                );
                Err(LinkError::SendFailed)
            }
        }
    }

    /// Transmit without expecting a response; logged but untracked and
    /// outside the pacing bound.
    pub fn send_command_no_wait(&self, command: &Packet) -> Result<(), LinkError> {
        if self.terminate.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        match self.session_state() {
            LinkSessionState::Closed => return Err(LinkError::Closed),
            LinkSessionState::Flashing => return Err(LinkError::Flashing),
            _ => {}
        }
        let frame = command.encode();
        let result = {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(&frame).and_then(|_| writer.flush())
        };
        match result {
            Ok(()) => {
                self.trace
                    .log_send(&frame, self.tracker.outstanding() as u32, 0);
                Ok(())
            }
            Err(err) => {
                warn!("untracked send failed: {err}");
                self.trace
                    .log_send(&frame, 0, LinkError::SendFailed.trace_code());
                Err(LinkError::SendFailed)
            }
        }
    }

    /// Translate a matched response into the caller-facing result
    fn interpret_response(&self, command: &Packet, resp: Packet) -> Result<Packet, LinkError> {
        match resp.pkt_type {
            PacketType::Command => {
                // Our own frame came back unexecuted; the node has reset and
                // dropped its address. A link problem, not a rejection.
                let err = LinkError::CommandEchoed { node: command.addr };
                self.report_link_error(err.clone(), Some(command.addr), Some(resp));
                Err(err)
            }
            PacketType::Error => {
                let class_byte = resp.payload.first().copied().unwrap_or(0);
                let code = class_byte & 0x1F;
                match NodeErrorClass::from_bits(class_byte) {
                    NodeErrorClass::Cmd => Err(LinkError::NodeCmdError {
                        node: resp.addr,
                        code,
                    }),
                    NodeErrorClass::Net => {
                        let err = LinkError::NodeNetError {
                            node: resp.addr,
                            code: NodeNetCode::from_code(code),
                        };
                        self.report_link_error(err.clone(), Some(resp.addr), Some(resp));
                        Err(err)
                    }
                    NodeErrorClass::Extended => Err(LinkError::RespFormat),
                }
            }
            _ => Ok(resp),
        }
    }

    /// Publish a link-class error and arm recovery once per episode
    pub fn report_link_error(&self, err: LinkError, node: Option<u8>, packet: Option<Packet>) {
        self.events.publish_error(node, err.clone(), packet);
        self.maybe_arm_recovery(&err, node);
    }

    pub fn maybe_arm_recovery(&self, err: &LinkError, node: Option<u8>) {
        if !err.is_link_class()
            || !self.auto_recovery.load(Ordering::SeqCst)
            || self.terminate.load(Ordering::SeqCst)
            || self.initializing()
            || self.is_recovery_thread()
        {
            return;
        }
        if self.session_state() != LinkSessionState::Online {
            return;
        }
        self.recovery.arm(err.clone(), node);
    }

    // ---------------------------------
    // Link maintenance operations
    // ---------------------------------

    /// Cancel all pending trackers, drain the transport, reset the parser
    pub fn flush(&self) {
        let failed = self.tracker.fail_all(&LinkError::Canceled);
        if failed > 0 {
            debug!("flush cancelled {failed} pending commands");
        }
        self.flush_epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.writer.lock().unwrap().purge() {
            warn!("transport purge failed: {err}");
        }
    }

    /// Drop to the base rate and break the ring so every node resets its
    /// channel. First step of both bring-up and recovery.
    pub fn reset_net_rate(&self) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().unwrap();
        writer.set_baud_rate(NetRate::Baud9600.bps())?;
        writer.send_break(BREAK_DURATION)?;
        writer.purge()?;
        Ok(())
    }

    /// Switch the ring and then the port to the configured rate
    pub fn restore_net_rate(&self) -> Result<(), LinkError> {
        let rate = self.config.rate;
        if rate != NetRate::Baud9600 {
            let cmd = Packet::extend_high(0, ext_high::BAUD_RATE, &[rate.divider()])?;
            self.run_command(&cmd, FRAME_READ_TIMEOUT)?;
        }
        self.writer.lock().unwrap().set_baud_rate(rate.bps())?;
        Ok(())
    }

    /// Re-address the ring and count the nodes answering.
    ///
    /// The address frame travels the ring once with each node taking the
    /// current address and incrementing it; what returns to the host names
    /// the node count (address 0 with the mode bit set means a full ring).
    pub fn set_addresses(&self) -> Result<usize, LinkError> {
        let cmd = Packet::set_address(0)?;
        let mut last_err = LinkError::NoNodesFound;
        for _ in 0..SET_ADDR_ATTEMPTS {
            match self.run_command(&cmd, FRAME_READ_TIMEOUT) {
                Ok(resp) => {
                    if resp.pkt_type != PacketType::SetAddr || !resp.payload.is_empty() {
                        last_err = LinkError::RespFormat;
                        continue;
                    }
                    if resp.mode && resp.addr > 0 {
                        return Err(LinkError::TooManyNodes);
                    }
                    let count = if resp.addr > 0 {
                        resp.addr as usize
                    } else if resp.mode {
                        MAX_NODES
                    } else {
                        0
                    };
                    if count == 0 {
                        return Err(LinkError::NoNodesFound);
                    }
                    return Ok(count);
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Read each node's device ID (probe-for-liveness + inventory build)
    pub fn read_inventory(&self, count: usize) -> Result<Inventory, LinkError> {
        let mut device_ids = Vec::with_capacity(count);
        for addr in 0..count {
            let probe = Packet::command(addr as u8, vec![0])?;
            let resp = self.run_command(&probe, FRAME_READ_TIMEOUT)?;
            if resp.pkt_type != PacketType::Response {
                return Err(LinkError::RespFormat);
            }
            let id = match resp.payload.as_slice() {
                [lo, hi, ..] => u16::from(*lo) | (u16::from(*hi) << 8),
                [lo] => u16::from(*lo),
                [] => 0,
            };
            device_ids.push(id);
        }
        Ok(Inventory { device_ids })
    }

    /// Probe every previously-known node address for liveness
    pub fn probe_known_nodes(&self) -> Result<(), LinkError> {
        let count = self.session.lock().unwrap().inventory_last.node_count();
        for addr in 0..count {
            let probe = Packet::command(addr as u8, vec![0])?;
            let resp = self.run_command(&probe, FRAME_READ_TIMEOUT)?;
            if resp.pkt_type != PacketType::Response {
                return Err(LinkError::CommandEchoed { node: addr as u8 });
            }
        }
        Ok(())
    }

    /// Full enumeration: re-address, then rebuild the inventory
    pub fn enumerate_nodes(&self) -> Result<Inventory, LinkError> {
        let count = self.set_addresses()?;
        let inventory = self.read_inventory(count)?;
        self.session.lock().unwrap().inventory_now = inventory.clone();
        Ok(inventory)
    }

    /// Write a trace dump into the configured dump directory
    pub fn dump_trace(&self) -> Option<PathBuf> {
        let dir = self.config.dump_dir.as_ref()?;
        let (send, recv) = self.trace.snapshot();
        let session = self.session.lock().unwrap();
        let mut node_types = [0u16; MAX_NODES];
        for (i, &id) in session.inventory_now.device_ids.iter().enumerate() {
            node_types[i] = id;
        }
        let header = DumpHeader {
            node_count: session.inventory_now.node_count() as u32,
            node_types,
            root_error: session
                .root_error
                .as_ref()
                .map(|e| e.trace_code())
                .unwrap_or(0),
        };
        drop(session);
        let counter = self.dump_counter.fetch_add(1, Ordering::SeqCst);
        match dump_next(dir, counter, &header, &send, &recv) {
            Ok(path) => Some(path),
            Err(err) => {
                // Diagnostics only; never let a dump failure become a link failure
                warn!("trace dump failed: {err}");
                None
            }
        }
    }

    // ---------------------------------
    // Teardown
    // ---------------------------------

    /// Wait until no caller is inside `run_command`
    pub fn wait_for_idle(&self) {
        let mut count = self.cmds_in_play.lock().unwrap();
        while *count > 0 {
            let (guard, _) = self
                .cmds_idle
                .wait_timeout(count, Duration::from_millis(100))
                .unwrap();
            count = guard;
        }
    }

    /// Stop all thread roles and force-fail everything blocked.
    /// Idempotent; the first call wins.
    pub fn shutdown(&self) {
        if self.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_session_state(LinkSessionState::Closed);
        // Blocked callers get a definite offline result, never a hang
        self.tracker.fail_all(&LinkError::Offline);
        self.pace.close();
        self.gate.open();
        self.recovery.terminate();
        self.read.request_shutdown();
        self.wait_for_idle();
    }
}

/// An open Meridian link
///
/// Thread-safe: any number of threads may call [`LinkHandle::run_command`]
/// concurrently; pacing bounds how many are actually in the ring.
pub struct LinkHandle {
    core: Arc<LinkCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkHandle {
    /// Open a link over an already-constructed transport.
    ///
    /// Spawns the read and recovery threads, resets the ring to the base
    /// rate, enumerates nodes, switches to the configured rate, and goes
    /// online. Useful directly for bridge/test transports; serial users go
    /// through [`crate::link::registry::LinkRegistry::open`].
    pub fn open_with_transport(
        transport: Box<dyn LinkTransport>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        let reader = transport.try_clone().map_err(LinkError::from)?;
        let core = Arc::new(LinkCore::new(config, transport));

        let read_handle = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name("meridian-read".into())
                .spawn(move || read_loop(core, reader))
                .map_err(LinkError::from)?
        };
        let recovery_handle = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name("meridian-recovery".into())
                .spawn(move || recovery_loop(core))
                .map_err(LinkError::from)?
        };
        let handle = Self {
            core,
            threads: Mutex::new(vec![read_handle, recovery_handle]),
        };

        handle.core.read.start();
        let bring_up = {
            let core = &handle.core;
            let _init = InitGuard::new(core);
            core.reset_net_rate()
                .and_then(|_| core.set_addresses())
                .and_then(|count| {
                    core.restore_net_rate()?;
                    core.read_inventory(count)
                })
        };
        match bring_up {
            Ok(inventory) => {
                {
                    let mut session = handle.core.session.lock().unwrap();
                    session.inventory_now = inventory.clone();
                    session.inventory_last = inventory;
                }
                handle.core.set_session_state(LinkSessionState::Online);
                Ok(handle)
            }
            Err(err) => {
                handle.close();
                Err(err)
            }
        }
    }

    /// Send `command` and wait for its response up to `timeout`
    pub fn run_command(&self, command: &Packet, timeout: Duration) -> Result<Packet, LinkError> {
        self.core.run_command(command, timeout)
    }

    /// Send `command` with the configured default timeout
    pub fn run_command_default(&self, command: &Packet) -> Result<Packet, LinkError> {
        self.core
            .run_command(command, self.core.config.response_timeout)
    }

    /// Fire-and-forget send; logged but untracked
    pub fn send_command_no_wait(&self, command: &Packet) -> Result<(), LinkError> {
        self.core.send_command_no_wait(command)
    }

    /// Cancel all pending commands and clear the channel
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Current session state
    pub fn session_state(&self) -> LinkSessionState {
        self.core.session_state()
    }

    /// Root cause of the current offline/searching episode, if any
    pub fn offline_root_error(&self) -> Option<(LinkError, Option<u8>)> {
        self.core.root_error()
    }

    /// Last enumerated inventory
    pub fn inventory(&self) -> Inventory {
        self.core.session.lock().unwrap().inventory_now.clone()
    }

    /// Bound on simultaneously outstanding commands
    pub fn set_pacing_limit(&self, limit: usize) {
        self.core.pace.set_limit(limit);
    }

    /// Current pacing bound
    pub fn get_pacing_limit(&self) -> usize {
        self.core.pace.limit()
    }

    /// Allow or inhibit automatic recovery on link-class errors
    pub fn enable_auto_recovery(&self, enabled: bool) {
        self.core.auto_recovery.store(enabled, Ordering::SeqCst);
    }

    /// Force an in-progress recovery episode to park
    pub fn halt_recovery(&self) {
        self.core.recovery.halt();
    }

    /// Start a recovery episode now (e.g. to resume after `halt_recovery`).
    /// Uses the retained root cause of the current offline episode.
    pub fn start_recovery(&self) {
        let (err, node) = self
            .core
            .root_error()
            .unwrap_or((LinkError::Offline, None));
        self.core.recovery.arm(err, node);
    }

    /// True while the recovery engine is probing
    pub fn is_recovering(&self) -> bool {
        self.core.recovery.is_active()
    }

    /// Hand the port over for firmware flashing (protocol suspended) or
    /// take it back
    pub fn set_flash_mode(&self, flashing: bool) {
        if flashing {
            self.core.set_session_state(LinkSessionState::Flashing);
            // Park the reader so the flasher owns the port
            self.core.read.stop_and_wait();
        } else {
            self.core.set_session_state(LinkSessionState::Online);
            self.core.read.start();
        }
    }

    /// Register for out-of-band events
    pub fn subscribe(&self) -> Receiver<LinkEvent> {
        self.core.events.subscribe()
    }

    /// Poll the event history
    pub fn poll_event(&self) -> Option<LinkEvent> {
        self.core.events.poll()
    }

    /// Pop the oldest undelivered attention
    pub fn poll_attention(&self) -> Option<Attention> {
        let mut attn = self.core.attn.lock().unwrap();
        attn.queue.pop_front()
    }

    /// Pop the oldest data acquisition sample from `node`
    pub fn poll_data_acq(&self, node: u8) -> Option<DataAcqSample> {
        let mut dataacq = self.core.dataacq.lock().unwrap();
        dataacq
            .get_mut(node as usize)?
            .queue
            .pop_front()
    }

    /// True when samples from `node` were lost to buffer overflow
    pub fn data_acq_overflowed(&self, node: u8) -> bool {
        let dataacq = self.core.dataacq.lock().unwrap();
        dataacq
            .get(node as usize)
            .map(|s| s.overflow)
            .unwrap_or(false)
    }

    /// Samples received from `node` since the link opened
    pub fn data_acq_sample_count(&self, node: u8) -> u64 {
        let dataacq = self.core.dataacq.lock().unwrap();
        dataacq
            .get(node as usize)
            .map(|s| s.sample_count)
            .unwrap_or(0)
    }

    /// The packet trace log
    pub fn trace(&self) -> &TraceLog {
        &self.core.trace
    }

    /// Write a trace dump now; returns the path written
    pub fn dump_trace(&self) -> Option<PathBuf> {
        self.core.dump_trace()
    }

    /// Shut the link down: cancel blocked callers, stop both threads, join
    /// them. Safe to call more than once.
    pub fn close(&self) {
        self.core.shutdown();
        let threads = {
            let mut threads = self.threads.lock().unwrap();
            std::mem::take(&mut *threads)
        };
        for t in threads {
            let _ = t.join();
        }
    }

    pub(crate) fn core(&self) -> &Arc<LinkCore> {
        &self.core
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Queue an attention, tracking overrun at the fixed depth
pub(crate) fn push_attention(core: &LinkCore, attention: Attention) {
    let first_overrun = {
        let mut attn = core.attn.lock().unwrap();
        let mut first = false;
        if attn.queue.len() >= ATTN_OVERFLOW_LVL {
            attn.queue.pop_front();
            first = !attn.overrun;
            attn.overrun = true;
        }
        attn.queue.push_back(attention);
        first
    };
    if first_overrun {
        core.events.publish(LinkEvent::AttentionOverrun);
    }
    core.events.publish(LinkEvent::Attention {
        node: attention.node,
        bits: attention.bits,
    });
}

pub(crate) fn push_data_acq(core: &LinkCore, sample: DataAcqSample) {
    let gap = {
        let mut dataacq = core.dataacq.lock().unwrap();
        let state = match dataacq.get_mut(sample.node as usize) {
            Some(state) => state,
            None => return,
        };
        let gap = if state.primed && state.next_seq != sample.sequence {
            Some((state.next_seq, sample.sequence))
        } else {
            None
        };
        state.primed = true;
        state.next_seq = sample.sequence.wrapping_add(1);
        state.sample_count += 1;
        if state.queue.len() >= DATAACQ_OVERFLOW_LVL {
            state.queue.pop_front();
            state.overflow = true;
        }
        state.queue.push_back(sample.clone());
        gap
    };
    if let Some((expected, got)) = gap {
        core.events.publish(LinkEvent::DataAcqGap {
            node: sample.node,
            expected,
            got,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{mock_link, ring_responder, MockRemote};
    use crate::link::packet::PacketSource;
    use std::sync::mpsc::RecvTimeoutError;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config(pacing: usize) -> LinkConfig {
        LinkConfig {
            port_name: "mock".into(),
            pacing_limit: pacing,
            response_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        }
    }

    /// Open a link over a mock ring of `ids.len()` nodes
    fn open_mock(ids: Vec<u16>, pacing: usize) -> (LinkHandle, MockRemote) {
        init_tracing();
        let (link, remote) = mock_link();
        remote.set_responder(ring_responder(ids));
        let handle =
            LinkHandle::open_with_transport(Box::new(link), test_config(pacing)).unwrap();
        // Bring-up traffic is not interesting to the tests
        remote.take_written_frames();
        (handle, remote)
    }

    fn response_for(cmd: &Packet) -> Packet {
        Packet::new(PacketType::Response, cmd.addr, cmd.payload.clone()).unwrap()
    }

    fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_open_enumerates_and_goes_online() {
        let (handle, remote) = open_mock(vec![0x2D01, 0x2D02, 0x2D03], 4);
        assert_eq!(handle.session_state(), LinkSessionState::Online);
        let inventory = handle.inventory();
        assert_eq!(inventory.node_count(), 3);
        assert_eq!(inventory.device_ids, vec![0x2D01, 0x2D02, 0x2D03]);
        // Bring-up switched the ring to the configured rate
        assert_eq!(remote.baud(), NetRate::Baud115200.bps());
        handle.close();
        assert_eq!(handle.session_state(), LinkSessionState::Closed);
    }

    #[test]
    fn test_single_command_to_node() {
        // Idle link, pacing limit 4: one command to node 3 takes exactly one
        // pacing unit and returns it with the response.
        let (handle, _remote) = open_mock(vec![1, 2, 3, 4], 4);
        let cmd = Packet::command(3, vec![0x05]).unwrap();
        let resp = handle.run_command_default(&cmd).unwrap();
        assert_eq!(resp.pkt_type, PacketType::Response);
        assert_eq!(resp.addr, 3);
        assert_eq!(resp.payload, vec![0x05]);
        assert_eq!(handle.core().pace.in_flight(), 0);
        assert_eq!(handle.core().tracker.outstanding(), 0);
        handle.close();
    }

    #[test]
    fn test_fifth_caller_blocks_at_pacing_cap() {
        let (handle, remote) = open_mock(vec![0; 5], 4);
        let handle = Arc::new(handle);
        remote.set_responder(|_| Vec::new());

        let mut workers = Vec::new();
        for addr in 0..5u8 {
            let handle = Arc::clone(&handle);
            workers.push(thread::spawn(move || {
                let cmd = Packet::command(addr, vec![addr]).unwrap();
                handle.run_command(&cmd, Duration::from_secs(5))
            }));
        }

        // Exactly four make it onto the wire; the fifth waits at the gate
        assert!(wait_until(Duration::from_secs(2), || {
            handle.core().pace.in_flight() == 4
        }));
        let mut sent = remote.take_written_frames();
        assert!(wait_until(Duration::from_millis(300), || {
            sent.extend(remote.take_written_frames());
            sent.len() == 4
        }));
        thread::sleep(Duration::from_millis(100));
        sent.extend(remote.take_written_frames());
        assert_eq!(sent.len(), 4, "fifth command must wait for pacing");

        // Complete one; the fifth proceeds
        remote.inject_frame(&response_for(&sent[0]));
        assert!(wait_until(Duration::from_secs(2), || {
            sent.extend(remote.take_written_frames());
            sent.len() == 5
        }));

        for cmd in &sent[1..] {
            remote.inject_frame(&response_for(cmd));
        }
        for worker in workers {
            assert!(worker.join().unwrap().is_ok());
        }
        assert_eq!(handle.core().pace.high_water(), 4);
        assert_eq!(handle.core().pace.in_flight(), 0);
        handle.close();
    }

    #[test]
    fn test_per_node_fifo_order() {
        let (handle, remote) = open_mock(vec![0; 2], 4);
        let handle = Arc::new(handle);
        remote.set_responder(|_| Vec::new());

        let first = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let cmd = Packet::command(1, vec![1]).unwrap();
                handle.run_command(&cmd, Duration::from_secs(5))
            })
        };
        assert!(wait_until(Duration::from_secs(1), || {
            handle.core().tracker.outstanding() == 1
        }));
        let second = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let cmd = Packet::command(1, vec![2]).unwrap();
                handle.run_command(&cmd, Duration::from_secs(5))
            })
        };
        assert!(wait_until(Duration::from_secs(1), || {
            handle.core().tracker.outstanding() == 2
        }));

        // The node answers in transmit order; each caller gets its own
        remote.inject_frame(&Packet::new(PacketType::Response, 1, vec![1]).unwrap());
        remote.inject_frame(&Packet::new(PacketType::Response, 1, vec![2]).unwrap());
        assert_eq!(first.join().unwrap().unwrap().payload, vec![1]);
        assert_eq!(second.join().unwrap().unwrap().payload, vec![2]);
        handle.close();
    }

    #[test]
    fn test_corrupted_response_times_out_with_one_checksum_event() {
        let (handle, remote) = open_mock(vec![0; 4], 4);
        handle.enable_auto_recovery(false);
        let events = handle.subscribe();

        // The ring answers, but the response arrives corrupted
        remote.corrupt_responses(1);
        let cmd = Packet::command(2, vec![7]).unwrap();
        let result = handle.run_command(&cmd, Duration::from_millis(400));

        // No retirement happens; the caller times out
        assert_eq!(result, Err(LinkError::ResponseTimeout));
        assert_eq!(handle.core().tracker.outstanding(), 0);

        // Exactly one checksum observation
        let mut checksum_events = 0;
        loop {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(LinkEvent::Error {
                    error: LinkError::ChecksumError { node },
                    ..
                }) => {
                    assert_eq!(node, 2);
                    checksum_events += 1;
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        assert_eq!(checksum_events, 1);
        handle.close();
    }

    #[test]
    fn test_no_pacing_leak_across_failure_paths() {
        let (handle, remote) = open_mock(vec![0; 2], 3);
        handle.enable_auto_recovery(false);

        // Success path
        let ok = handle.run_command_default(&Packet::command(0, vec![1]).unwrap());
        assert!(ok.is_ok());

        // Send-failure path
        remote.fail_writes(1);
        assert_eq!(
            handle.run_command_default(&Packet::command(0, vec![2]).unwrap()),
            Err(LinkError::SendFailed)
        );

        // Timeout path: the ring swallows one response
        remote.drop_responses(1);
        assert_eq!(
            handle.run_command(
                &Packet::command(1, vec![3]).unwrap(),
                Duration::from_millis(100)
            ),
            Err(LinkError::ResponseTimeout)
        );

        // Flush path: a blocked caller is cancelled
        remote.drop_responses(1);
        let blocked = {
            let core = Arc::clone(handle.core());
            thread::spawn(move || {
                core.run_command(&Packet::command(1, vec![4]).unwrap(), Duration::from_secs(5))
            })
        };
        assert!(wait_until(Duration::from_secs(1), || {
            handle.core().tracker.outstanding() == 1
        }));
        let purges_before = remote.purges();
        handle.flush();
        assert_eq!(blocked.join().unwrap(), Err(LinkError::Canceled));
        assert!(remote.purges() > purges_before);

        // Every acquire was paired with exactly one release
        assert_eq!(handle.core().pace.in_flight(), 0);
        assert_eq!(handle.core().tracker.outstanding(), 0);
        handle.close();
    }

    #[test]
    fn test_randomized_pacing_invariant() {
        use rand::{Rng, SeedableRng};

        let (handle, remote) = open_mock(vec![0; 8], 4);
        handle.enable_auto_recovery(false);
        let handle = Arc::new(handle);

        // The ring answers most commands and randomly stays silent
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x4D65726964);
        let seed: u64 = rng.gen();
        remote.set_responder(move |pkt| {
            let mut h = seed
                .wrapping_mul(0x9E3779B97F4A7C15)
                .wrapping_add(u64::from(pkt.payload.first().copied().unwrap_or(0)));
            h ^= h >> 33;
            if h % 5 == 0 {
                Vec::new() // silence, caller times out
            } else {
                let mut resp = pkt.clone();
                resp.pkt_type = PacketType::Response;
                vec![resp]
            }
        });

        let mut workers = Vec::new();
        for t in 0..8u8 {
            let handle = Arc::clone(&handle);
            workers.push(thread::spawn(move || {
                for i in 0..6u8 {
                    let cmd = Packet::command(t, vec![t.wrapping_mul(31).wrapping_add(i)])
                        .unwrap();
                    let _ = handle.run_command(&cmd, Duration::from_millis(150));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(handle.core().pace.high_water() <= 4);
        assert_eq!(handle.core().pace.in_flight(), 0);
        assert_eq!(handle.core().tracker.outstanding(), 0);
        handle.close();
    }

    #[test]
    fn test_node_command_rejection_is_not_link_class() {
        let (handle, remote) = open_mock(vec![0; 1], 3);
        // Node rejects with a command-class error packet (class bits 01)
        remote.set_responder(|pkt| {
            let mut resp =
                Packet::new(PacketType::Error, pkt.addr, vec![0x20 | 0x03]).unwrap();
            resp.src = PacketSource::Host;
            vec![resp]
        });
        let result = handle.run_command_default(&Packet::command(0, vec![9]).unwrap());
        assert_eq!(result, Err(LinkError::NodeCmdError { node: 0, code: 3 }));
        // Command-class errors never arm recovery
        assert!(!handle.is_recovering());
        assert_eq!(handle.session_state(), LinkSessionState::Online);
        handle.close();
    }

    #[test]
    fn test_command_echo_reports_link_class() {
        let (handle, remote) = open_mock(vec![0; 1], 3);
        handle.enable_auto_recovery(false);
        // A reset node forwards the command unexecuted
        remote.set_responder(|pkt| vec![pkt.clone()]);
        let result = handle.run_command_default(&Packet::command(0, vec![1]).unwrap());
        assert_eq!(result, Err(LinkError::CommandEchoed { node: 0 }));
        handle.close();
    }

    #[test]
    fn test_run_command_rejected_while_flashing() {
        let (handle, _remote) = open_mock(vec![0; 1], 3);
        handle.set_flash_mode(true);
        assert_eq!(
            handle.run_command_default(&Packet::command(0, vec![0]).unwrap()),
            Err(LinkError::Flashing)
        );
        handle.set_flash_mode(false);
        assert!(handle
            .run_command_default(&Packet::command(0, vec![0]).unwrap())
            .is_ok());
        handle.close();
    }

    #[test]
    fn test_close_wakes_blocked_caller_with_offline() {
        let (handle, remote) = open_mock(vec![0; 1], 3);
        handle.enable_auto_recovery(false);
        remote.set_responder(|_| Vec::new());
        let blocked = {
            let core = Arc::clone(handle.core());
            thread::spawn(move || {
                core.run_command(&Packet::command(0, vec![1]).unwrap(), Duration::from_secs(30))
            })
        };
        assert!(wait_until(Duration::from_secs(1), || {
            handle.core().tracker.outstanding() == 1
        }));
        handle.close();
        assert_eq!(blocked.join().unwrap(), Err(LinkError::Offline));
    }

    #[test]
    fn test_recovery_converges_after_transient_fault() {
        let (handle, remote) = open_mock(vec![0x2D01, 0x2D02], 4);
        let events = handle.subscribe();

        // The ring goes dead: a command times out and arms recovery
        remote.set_responder(|_| Vec::new());
        let result = handle.run_command(
            &Packet::command(0, vec![5]).unwrap(),
            Duration::from_millis(300),
        );
        assert_eq!(result, Err(LinkError::ResponseTimeout));
        assert!(wait_until(Duration::from_secs(2), || {
            handle.session_state() == LinkSessionState::Searching
        }));
        assert!(handle.is_recovering());
        assert_eq!(
            handle.offline_root_error().map(|(e, _)| e),
            Some(LinkError::ResponseTimeout)
        );

        // While searching, user commands fail fast instead of hanging
        let during = handle.run_command(
            &Packet::command(0, vec![6]).unwrap(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            during,
            Err(LinkError::Canceled) | Err(LinkError::Offline)
        ));

        // The cable comes back; the same ring answers again
        remote.set_responder(ring_responder(vec![0x2D01, 0x2D02]));
        assert!(wait_until(Duration::from_secs(15), || {
            handle.session_state() == LinkSessionState::Online
        }));
        assert!(wait_until(Duration::from_secs(2), || !handle.is_recovering()));

        // Recovery used the break sequence and restored the rate
        assert!(remote.breaks_sent() > 0);
        assert_eq!(remote.baud(), NetRate::Baud115200.bps());

        // Same topology: no topology-change event was published
        let mut saw_topology_change = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LinkEvent::TopologyChanged { .. }) {
                saw_topology_change = true;
            }
        }
        assert!(!saw_topology_change);

        // Pacing/tracking state identical to a link that never faulted
        assert_eq!(handle.core().pace.in_flight(), 0);
        assert_eq!(handle.core().tracker.outstanding(), 0);
        assert_eq!(handle.get_pacing_limit(), 4);
        assert!(handle
            .run_command_default(&Packet::command(1, vec![1]).unwrap())
            .is_ok());
        handle.close();
    }

    #[test]
    fn test_recovery_reports_topology_change() {
        let (handle, remote) = open_mock(vec![0x2D01, 0x2D02], 4);
        let events = handle.subscribe();

        remote.set_responder(|_| Vec::new());
        let _ = handle.run_command(
            &Packet::command(0, vec![5]).unwrap(),
            Duration::from_millis(300),
        );
        assert!(wait_until(Duration::from_secs(2), || handle.is_recovering()));

        // One node fell off the ring
        remote.set_responder(ring_responder(vec![0x2D01]));
        assert!(wait_until(Duration::from_secs(15), || {
            handle.session_state() == LinkSessionState::Online
        }));

        let mut change = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && change.is_none() {
            if let Ok(LinkEvent::TopologyChanged { was, now }) = events.try_recv() {
                change = Some((was, now));
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(change, Some((2, 1)));
        assert_eq!(handle.inventory().node_count(), 1);
        handle.close();
    }

    #[test]
    fn test_halt_recovery_parks_probing() {
        let (handle, remote) = open_mock(vec![0x2D01], 4);
        remote.set_responder(|_| Vec::new());
        let _ = handle.run_command(
            &Packet::command(0, vec![5]).unwrap(),
            Duration::from_millis(300),
        );
        assert!(wait_until(Duration::from_secs(2), || handle.is_recovering()));
        handle.halt_recovery();
        assert!(wait_until(Duration::from_secs(5), || !handle.is_recovering()));
        // Halted without going online; gate is open so callers fail fast
        assert_eq!(handle.session_state(), LinkSessionState::Searching);
        assert_eq!(
            handle.run_command_default(&Packet::command(0, vec![1]).unwrap()),
            Err(LinkError::Offline)
        );

        // Manual restart resumes probing once the ring answers again
        remote.set_responder(ring_responder(vec![0x2D01]));
        handle.start_recovery();
        assert!(wait_until(Duration::from_secs(15), || {
            handle.session_state() == LinkSessionState::Online
        }));
        handle.close();
    }

    #[test]
    fn test_attention_and_data_acq_routing() {
        let (handle, remote) = open_mock(vec![0; 6], 4);
        let events = handle.subscribe();

        // Node 5 raises an attention
        let mut attn = Packet::new(PacketType::AttnIrq, 5, vec![0x21, 0x01, 0, 0]).unwrap();
        attn.src = PacketSource::Node;
        remote.inject_frame(&attn);
        assert!(wait_until(Duration::from_secs(1), || {
            handle.poll_attention().is_some_and(|a| {
                a.node == 5 && a.bits == 0x0121
            })
        }));

        // Two contiguous samples, then a gap
        for seq in [7u8, 8, 10] {
            let mut sample =
                Packet::new(PacketType::ExtendLow, 2, vec![1, seq, 0xAA, 0xBB]).unwrap();
            sample.src = PacketSource::Node;
            remote.inject_frame(&sample);
        }
        assert!(wait_until(Duration::from_secs(1), || {
            handle.data_acq_sample_count(2) == 3
        }));
        let first = handle.poll_data_acq(2).unwrap();
        assert_eq!(first.sequence, 7);
        assert_eq!(first.data, vec![0xAA, 0xBB]);
        assert!(!handle.data_acq_overflowed(2));
        let mut saw_gap = false;
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline && !saw_gap {
            if let Ok(LinkEvent::DataAcqGap { node: 2, expected: 9, got: 10 }) = events.try_recv()
            {
                saw_gap = true;
            }
        }
        assert!(saw_gap);
        handle.close();
    }

    #[test]
    fn test_send_command_no_wait_is_untracked() {
        let (handle, remote) = open_mock(vec![0; 1], 3);
        remote.take_written_frames();
        let nop = Packet::extend_high(0, ext_high::NOP, &[]).unwrap();
        handle.send_command_no_wait(&nop).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            !remote.take_written_frames().is_empty()
        }));
        assert_eq!(handle.core().tracker.outstanding(), 0);
        assert_eq!(handle.core().pace.in_flight(), 0);
        handle.close();
    }

    #[test]
    fn test_pacing_limit_api() {
        let (handle, _remote) = open_mock(vec![0; 1], 3);
        assert_eq!(handle.get_pacing_limit(), 3);
        handle.set_pacing_limit(5);
        assert_eq!(handle.get_pacing_limit(), 5);
        // Clamped to the arena bound
        handle.set_pacing_limit(100);
        assert_eq!(handle.get_pacing_limit(), RING_CMDS_LIMIT);
        handle.close();
    }
}

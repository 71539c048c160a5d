//! Auto-recovery engine
//!
//! When a link-class error surfaces, this engine takes the session to
//! `Searching`, gates new user commands out, and probes until the network
//! answers again: break the ring back to the base rate, check each known
//! node for liveness, restore the operating rate, and re-enumerate. Only
//! when the inventory matches the last known-good snapshot (or a topology
//! change has been announced) does the session go back `Online`.
//!
//! The probe loop retries forever at a fixed interval; `halt()` parks it
//! immediately and link close terminates it.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::LinkError;
use super::event::LinkEvent;
use super::net::{InitGuard, LinkCore, LinkSessionState};
use super::packet::{ext_high, Packet};
use super::RECOVERY_WAIT;

/// Why the park loop woke up
enum Wake {
    /// Probe for the network with this root cause
    Armed(LinkError, Option<u8>),
    /// Thread must exit
    Terminate,
}

struct RecoveryInner {
    /// A fault is queued for probing
    armed: Option<(LinkError, Option<u8>)>,
    /// An episode is in progress
    active: bool,
    /// Park the probe loop as soon as possible
    halt: bool,
    /// Thread must exit
    terminate: bool,
}

/// Arm/halt interlock for the recovery thread
pub(crate) struct RecoveryControl {
    state: Mutex<RecoveryInner>,
    cv: Condvar,
}

impl RecoveryControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecoveryInner {
                armed: None,
                active: false,
                halt: false,
                terminate: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Queue a fault for recovery. Duplicate errors during an active episode
    /// are suppressed; only the first cause of an episode is kept.
    pub fn arm(&self, err: LinkError, node: Option<u8>) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.active || st.armed.is_some() || st.terminate {
            return false;
        }
        st.armed = Some((err, node));
        st.halt = false;
        self.cv.notify_all();
        true
    }

    /// True while an episode is probing
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Park the probe loop without waiting for the network
    pub fn halt(&self) {
        let mut st = self.state.lock().unwrap();
        st.halt = true;
        st.armed = None;
        self.cv.notify_all();
    }

    /// Ask the thread to exit
    pub fn terminate(&self) {
        let mut st = self.state.lock().unwrap();
        st.terminate = true;
        st.halt = true;
        self.cv.notify_all();
    }

    /// Park until armed or terminated
    fn wait_armed(&self) -> Wake {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.terminate {
                return Wake::Terminate;
            }
            if let Some((err, node)) = st.armed.take() {
                st.active = true;
                return Wake::Armed(err, node);
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    /// Sleep between probe cycles; wakes early on halt/terminate.
    /// Returns false when the episode must stop.
    fn wait_interval(&self, interval: Duration) -> bool {
        let deadline = std::time::Instant::now() + interval;
        let mut st = self.state.lock().unwrap();
        loop {
            if st.halt || st.terminate {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self.cv.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
    }

    fn should_stop(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.halt || st.terminate
    }

    fn finish_episode(&self) {
        let mut st = self.state.lock().unwrap();
        st.active = false;
        st.halt = false;
    }
}

/// Thread body of the recovery engine
pub(crate) fn recovery_loop(core: Arc<LinkCore>) {
    core.register_recovery_thread();
    debug!("recovery engine starting");
    loop {
        match core.recovery.wait_armed() {
            Wake::Terminate => break,
            Wake::Armed(cause, node) => {
                run_episode(&core, cause, node);
                core.recovery.finish_episode();
            }
        }
    }
    debug!("recovery engine exited");
}

/// One full offline-to-online episode
fn run_episode(core: &LinkCore, cause: LinkError, node: Option<u8>) {
    info!("recovery armed by {cause}");
    // Commands issued by this thread bypass the offline check while the
    // guard lives; everyone else waits at the gate.
    let _init = InitGuard::new(core);
    core.set_root_error(&cause, node);
    core.set_session_state(LinkSessionState::Searching);
    core.gate.close();
    if core.trace.dump_armed() {
        core.dump_trace();
    }

    let mut cycles = 0u32;
    let went_online = loop {
        // Give things time to settle out, then try a full probe pass
        if !core.recovery.wait_interval(RECOVERY_WAIT) {
            break false;
        }
        cycles += 1;
        if let Err(err) = core.writer.lock().unwrap().purge() {
            warn!("purge failed during recovery: {err}");
        }
        if core.recovery.should_stop() {
            break false;
        }

        if cause.is_link_class() {
            // Restore the ring to its base state and test basic continuity
            if let Err(err) = core.reset_net_rate() {
                debug!(cycles, "net rate reset failed: {err}");
                core.events.publish(LinkEvent::NodesOffline);
                continue;
            }
            // Each previously-known node must answer before going further
            if let Err(err) = core.probe_known_nodes() {
                debug!(cycles, "node probe failed: {err}");
                // Ask the ring to localize the fault; diagnostics come back
                // as node-initiated frames if anything is alive.
                if let Ok(diag) = Packet::extend_high(0, ext_high::NET_CHECK, &[]) {
                    let _ = core.send_command_no_wait(&diag);
                }
                core.events.publish_error(None, err, None);
                continue;
            }
            if core.recovery.should_stop() {
                break false;
            }
            if let Err(err) = core.restore_net_rate() {
                debug!(cycles, "rate restore failed: {err}");
                continue;
            }
            let inventory = match core.enumerate_nodes() {
                Ok(inventory) => inventory,
                Err(err) => {
                    debug!(cycles, "re-enumeration failed: {err}");
                    continue;
                }
            };
            let last = {
                let session = core.session.lock().unwrap();
                session.inventory_last.clone()
            };
            if inventory != last {
                // Network came back different; callers must re-enumerate
                warn!(
                    was = last.node_count(),
                    now = inventory.node_count(),
                    "topology changed across recovery"
                );
                core.events.publish(LinkEvent::TopologyChanged {
                    was: last.node_count(),
                    now: inventory.node_count(),
                });
                let mut session = core.session.lock().unwrap();
                session.inventory_last = inventory;
            }
            break true;
        } else {
            // Unclassified cause; assume a usage error and come back up
            debug!("root cause not link-class, resuming");
            break true;
        }
    };

    // Releasing the gate must restore exactly the normal invariants no
    // matter how many probe cycles ran.
    if went_online {
        info!(cycles, "link restored");
        core.set_session_state(LinkSessionState::Online);
    }
    core.gate.open();
}

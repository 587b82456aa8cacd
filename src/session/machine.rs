//! The session's transition function.
//!
//! `Machine` owns all mutable session state and never touches the radio or
//! the clock. It consumes two kinds of input:
//!
//! - [`Machine::submit`]: a caller request (or a bare re-evaluation)
//! - [`Machine::complete`]: the result of an effect it asked for earlier
//!
//! and answers each with a list of [`Effect`]s for the driver to carry out.
//!
//! Every state entry and every issued write takes a fresh ticket. Effects
//! carry the ticket they were issued under, and completions must echo it
//! back. A completion whose ticket is no longer current belongs to an
//! operation the session has moved past; it is dropped without touching
//! state.

use super::error::SessionError;
use super::request::Request;
use super::state::{Cause, SessionState, Transition};
use crate::config::SessionConfig;
use crate::radio::ScanFilter;
use crate::registry::{Observation, PeripheralRecord, PeripheralRegistry};
use crate::stats::SessionStats;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Operation generation counter.
pub type Ticket = u64;

/// What a timer reports when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// The scan window closed.
    ScanWindow,
    /// A backoff delay expired.
    Backoff,
    /// The operation timeout expired.
    Deadline,
}

impl Timer {
    /// The outcome to complete with when this timer fires.
    pub fn outcome(self) -> Outcome {
        match self {
            Self::ScanWindow => Outcome::ScanWindowElapsed,
            Self::Backoff => Outcome::DelayElapsed,
            Self::Deadline => Outcome::TimedOut,
        }
    }
}

/// Work the driver must carry out.
#[derive(Debug)]
pub enum Effect {
    /// Enable the adapter and start a bounded scan; report `ScanStarted` or
    /// the failure, and every advertisement as `Discovered`.
    StartScan { ticket: Ticket, filter: ScanFilter },
    /// Stop the running scan. Nothing is reported back, but later scan and
    /// connect steps must not start until it has finished.
    StopScan,
    /// Enable the adapter, drop any stale link, connect, then discover
    /// services and read the RSSI concurrently; report `Connected` or the
    /// first failure.
    Connect {
        ticket: Ticket,
        peripheral: PeripheralRecord,
    },
    /// Enable the adapter and write `payload` without response in chunks of
    /// `max_len`; report `Written` or the failure.
    Write {
        ticket: Ticket,
        peripheral: PeripheralRecord,
        payload: Vec<u8>,
        max_len: usize,
    },
    /// Complete with `timer.outcome()` after `delay`.
    ArmTimer {
        ticket: Ticket,
        delay: Duration,
        timer: Timer,
    },
    /// Run the request's completion callback.
    Deliver(Request),
    /// Publish a state change.
    Transitioned(Transition),
}

/// Result of an effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    ScanStarted,
    Discovered(Observation),
    ScanWindowElapsed,
    Connected { rssi: i16 },
    Written,
    DelayElapsed,
    TimedOut,
    Failed(SessionError),
}

impl Outcome {
    /// Whether this reports back from a radio operation (as opposed to a
    /// timer or an advertisement).
    fn is_radio_completion(&self) -> bool {
        matches!(
            self,
            Self::ScanStarted | Self::Connected { .. } | Self::Written | Self::Failed(_)
        )
    }
}

/// An outcome tagged with the ticket of the effect that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub ticket: Ticket,
    pub outcome: Outcome,
}

impl Completion {
    pub fn new(ticket: Ticket, outcome: Outcome) -> Self {
        Self { ticket, outcome }
    }
}

/// Sans-IO session state machine.
pub struct Machine {
    config: SessionConfig,
    state: SessionState,
    ticket: Ticket,
    registry: PeripheralRegistry,
    target: Option<PeripheralRecord>,
    pending: VecDeque<Request>,
    writing: bool,
    /// The current window's scan has been confirmed by the radio.
    scan_running: bool,
    active: bool,
    started: bool,
    stats: Arc<SessionStats>,
}

impl Machine {
    /// Create a machine in `Scanning`. Nothing happens until [`Machine::start`].
    pub fn new(config: SessionConfig, stats: Arc<SessionStats>) -> Self {
        let registry = PeripheralRegistry::new(config.service_id, config.characteristic_id);
        Self {
            config,
            state: SessionState::Scanning,
            ticket: 0,
            registry,
            target: None,
            pending: VecDeque::new(),
            writing: false,
            scan_running: false,
            active: false,
            started: false,
            stats,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current ticket. Completions carrying any other value are stale.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Requests not yet delivered, including one being written.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The peripheral being connected to or connected.
    pub fn target(&self) -> Option<&PeripheralRecord> {
        self.target.as_ref()
    }

    /// Enter `Scanning` for the first time. Later calls do nothing.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.started {
            return effects;
        }
        self.started = true;

        if let Some(command) = self.config.initial_command.clone() {
            info!("[session] Queueing initial command {:?}", command);
            self.enqueue(Request::new(command, || {}));
        }
        self.enter(SessionState::Scanning, Cause::Start, &mut effects);
        effects
    }

    /// Queue `request` (if any) and re-evaluate.
    ///
    /// Returns immediately in every state. Requests are written in order,
    /// one at a time, once the session is `Idle`.
    pub fn submit(&mut self, request: Option<Request>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(request) = request {
            debug!("[session] Queued {:?} in {}", request, self.state);
            self.enqueue(request);
        }
        if self.state == SessionState::Idle && !self.writing {
            self.begin_write(&mut effects);
        }
        effects
    }

    /// Apply the result of an earlier effect.
    pub fn complete(&mut self, completion: Completion) -> Vec<Effect> {
        let mut effects = Vec::new();
        if completion.ticket != self.ticket {
            if completion.outcome.is_radio_completion() {
                self.stats.record_stale();
                debug!(
                    "[session] Dropping stale {:?} (ticket {} != {}) in {}",
                    completion.outcome, completion.ticket, self.ticket, self.state
                );
            }
            return effects;
        }

        use SessionState::*;
        match (self.state, completion.outcome) {
            (Scanning, Outcome::ScanStarted) => {
                self.scan_running = true;
                effects.push(Effect::ArmTimer {
                    ticket: self.ticket,
                    delay: self.config.scan_window(),
                    timer: Timer::ScanWindow,
                });
            }
            (Scanning, Outcome::Discovered(observation)) => {
                self.registry.consider_candidate(&observation);
            }
            (Scanning, Outcome::ScanWindowElapsed) => {
                effects.push(Effect::StopScan);
                match self.registry.current_best().cloned() {
                    Some(best) => {
                        info!(
                            "[session] Using {} ({:?}) at {} dBm",
                            best.id, best.name, best.signal_strength
                        );
                        self.target = Some(best);
                        self.enter(Connecting, Cause::WindowClosed, &mut effects);
                    }
                    None => self.fail(RescanWait, SessionError::NoCandidate, &mut effects),
                }
            }
            (Scanning, Outcome::Failed(e @ SessionError::AdapterRefused(_))) => {
                self.fail(FailureWait, e, &mut effects)
            }
            (Scanning, Outcome::Failed(e)) => self.fail(RescanWait, e, &mut effects),
            // Bounds only the start; the window timer governs a running scan
            (Scanning, Outcome::TimedOut) if self.scan_running => {
                debug!("[session] Scan running, deadline superseded by window");
            }
            (Scanning, Outcome::TimedOut) => {
                self.fail(RescanWait, SessionError::Timeout, &mut effects)
            }

            (Connecting, Outcome::Connected { rssi }) => {
                if let Some(target) = self.target.as_mut() {
                    target.signal_strength = rssi;
                }
                self.enter(Idle, Cause::Connected, &mut effects);
            }
            (Connecting, Outcome::TimedOut) => {
                self.fail(Scanning, SessionError::Timeout, &mut effects)
            }
            (Connecting, Outcome::Failed(e @ SessionError::AdapterRefused(_))) => {
                self.fail(FailureWait, e, &mut effects)
            }
            (Connecting, Outcome::Failed(e)) => self.fail(Scanning, e, &mut effects),

            (RescanWait | FailureWait, Outcome::DelayElapsed) => {
                self.enter(Scanning, Cause::BackoffElapsed, &mut effects)
            }

            (Idle, Outcome::Written) if self.writing => {
                self.writing = false;
                self.set_active(true);
                self.stats.link.writes.fetch_add(1, Ordering::Relaxed);
                if let Some(request) = self.pending.pop_front() {
                    self.stats.link.queued.store(self.pending.len(), Ordering::Relaxed);
                    info!("[session] Delivered {:?}", request);
                    // Delivered before the next write is issued
                    effects.push(Effect::Deliver(request));
                }
                self.begin_write(&mut effects);
            }
            (Idle, Outcome::TimedOut) if self.writing => {
                self.fail(FailureWait, SessionError::Timeout, &mut effects)
            }
            (Idle, Outcome::Failed(e)) if self.writing => self.fail(FailureWait, e, &mut effects),

            (state, outcome) => {
                warn!("[session] Ignoring unexpected {:?} in {}", outcome, state);
            }
        }
        effects
    }

    fn enqueue(&mut self, request: Request) {
        self.pending.push_back(request);
        self.stats.link.queued.store(self.pending.len(), Ordering::Relaxed);
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
        self.stats.set_active(active);
    }

    fn next_ticket(&mut self) -> Ticket {
        self.ticket += 1;
        self.ticket
    }

    fn fail(&mut self, next: SessionState, error: SessionError, effects: &mut Vec<Effect>) {
        warn!("[session] {} in {}", error, self.state);
        self.stats.record_failure(&error);
        self.enter(next, Cause::Failure(error), effects);
    }

    /// Enter `next` and issue its entry effects.
    fn enter(&mut self, next: SessionState, cause: Cause, effects: &mut Vec<Effect>) {
        let from = self.state;
        let ticket = self.next_ticket();
        self.state = next;
        self.writing = false;
        self.scan_running = false;
        if next != SessionState::Idle {
            self.set_active(false);
        }
        self.stats.set_state(next);
        info!("[session] [STATE: {}] from {} ({})", next, from, cause);
        effects.push(Effect::Transitioned(Transition {
            from,
            to: next,
            cause,
        }));

        match next {
            SessionState::Scanning => {
                self.registry.reset();
                self.target = None;
                self.stats.link.scans.fetch_add(1, Ordering::Relaxed);
                effects.push(Effect::StartScan {
                    ticket,
                    filter: ScanFilter {
                        service: self.config.service_id,
                        duration: self.config.scan_window(),
                        allow_duplicates: self.config.allow_duplicates,
                    },
                });
                effects.push(Effect::ArmTimer {
                    ticket,
                    delay: self.config.operation_timeout(),
                    timer: Timer::Deadline,
                });
            }
            SessionState::Connecting => {
                let Some(peripheral) = self.target.clone() else {
                    // Only entered from a closed window with a candidate
                    return;
                };
                self.stats.link.connect_attempts.fetch_add(1, Ordering::Relaxed);
                effects.push(Effect::Connect { ticket, peripheral });
                effects.push(Effect::ArmTimer {
                    ticket,
                    delay: self.config.operation_timeout(),
                    timer: Timer::Deadline,
                });
            }
            SessionState::RescanWait => {
                info!("[session] Rescanning in {} ms", self.config.rescan_delay_ms);
                effects.push(Effect::ArmTimer {
                    ticket,
                    delay: self.config.rescan_delay(),
                    timer: Timer::Backoff,
                });
            }
            SessionState::FailureWait => {
                info!("[session] Retrying in {} ms", self.config.failure_retry_delay_ms);
                effects.push(Effect::ArmTimer {
                    ticket,
                    delay: self.config.failure_retry_delay(),
                    timer: Timer::Backoff,
                });
            }
            SessionState::Idle => {
                self.stats.record_connected();
                if self.pending.is_empty() {
                    self.set_active(true);
                } else {
                    self.begin_write(effects);
                }
            }
        }
    }

    /// Issue a write for the head request, if there is one.
    fn begin_write(&mut self, effects: &mut Vec<Effect>) {
        let Some(payload) = self.pending.front().map(|r| r.payload().to_vec()) else {
            return;
        };
        let Some(peripheral) = self.target.clone() else {
            return;
        };
        let ticket = self.next_ticket();
        self.writing = true;
        debug!("[session] Writing {} bytes to {}", payload.len(), peripheral.id);
        effects.push(Effect::Write {
            ticket,
            peripheral,
            payload,
            max_len: self.config.max_write_len,
        });
        effects.push(Effect::ArmTimer {
            ticket,
            delay: self.config.operation_timeout(),
            timer: Timer::Deadline,
        });
    }
}

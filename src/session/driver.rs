//! Async driver for the session machine.
//!
//! One tokio task owns the [`Machine`] and drains a single unbounded queue.
//! Caller requests, radio results, discoveries and timer expiries all arrive
//! through that queue, so every state mutation happens on that one task and
//! in arrival order. Radio steps and timers run as spawned tasks that post
//! their result back tagged with the ticket they were issued under.
//!
//! Stopping a scan reports nothing back, but the next scan or connect step
//! waits for it, so a slow stop can never end a window started after it.

use super::error::{SessionClosed, SessionError};
use super::machine::{Completion, Effect, Machine, Outcome, Ticket};
use super::request::Request;
use super::state::{SessionState, Transition};
use crate::config::{ConfigError, SessionConfig};
use crate::radio::{DiscoverySink, Radio, ScanFilter};
use crate::registry::PeripheralRecord;
use crate::stats::SessionStats;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the transition broadcast. Slow subscribers see `Lagged`.
const TRANSITION_CAPACITY: usize = 64;

enum Event {
    Submit(Option<Request>),
    Complete(Completion),
}

type EventTx = mpsc::UnboundedSender<Event>;

/// The session task. Create with [`Session::new`], then drive [`Session::run`].
pub struct Session {
    machine: Machine,
    radio: Arc<dyn Radio>,
    events_tx: EventTx,
    events_rx: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<SessionState>,
    active_tx: watch::Sender<bool>,
    transitions_tx: broadcast::Sender<Transition>,
    /// Flips to `true` when the last requested `stop_scan` has returned.
    scan_stopped: Option<watch::Receiver<bool>>,
    cancel: CancellationToken,
}

impl Session {
    /// Validate `config` and build a session over `radio`.
    ///
    /// Subscribe through the returned handle before spawning [`Session::run`]
    /// to observe the first transition.
    pub fn new(
        radio: Arc<dyn Radio>,
        config: SessionConfig,
    ) -> Result<(Self, SessionHandle), ConfigError> {
        config.validate()?;
        let stats = Arc::new(SessionStats::new(config.degraded_after));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Scanning);
        let (active_tx, active_rx) = watch::channel(false);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            events: events_tx.clone(),
            state: state_rx,
            active: active_rx,
            transitions: transitions_tx.clone(),
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        let session = Self {
            machine: Machine::new(config, stats),
            radio,
            events_tx,
            events_rx,
            state_tx,
            active_tx,
            transitions_tx,
            scan_stopped: None,
            cancel,
        };
        Ok((session, handle))
    }

    /// Build a session and spawn it on the current runtime.
    pub fn spawn(radio: Arc<dyn Radio>, config: SessionConfig) -> Result<SessionHandle, ConfigError> {
        let (session, handle) = Self::new(radio, config)?;
        tokio::spawn(session.run());
        Ok(handle)
    }

    /// Run until [`SessionHandle::shutdown`] is called.
    pub async fn run(mut self) {
        info!("[session] Starting");
        let effects = self.machine.start();
        self.apply(effects);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => event,
            };
            let Some(event) = event else { break };

            let effects = match event {
                Event::Submit(request) => self.machine.submit(request),
                Event::Complete(completion) => self.machine.complete(completion),
            };
            self.apply(effects);
        }
        info!("[session] Stopped in {}", self.machine.state());
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartScan { ticket, filter } => {
                    let radio = self.radio.clone();
                    let sink_tx = self.events_tx.clone();
                    let sink = DiscoverySink::new(move |observation| {
                        sink_tx
                            .send(Event::Complete(Completion::new(
                                ticket,
                                Outcome::Discovered(observation),
                            )))
                            .is_ok()
                    });
                    let stopped = self.scan_stopped.clone();
                    self.spawn_step(ticket, async move {
                        scan_stopped(stopped).await;
                        scan_step(radio.as_ref(), filter, sink).await
                    });
                }
                Effect::StopScan => {
                    let radio = self.radio.clone();
                    let (done_tx, done_rx) = watch::channel(false);
                    self.scan_stopped = Some(done_rx);
                    tokio::spawn(async move {
                        if let Err(e) = radio.stop_scan().await {
                            warn!("[session] Failed to stop scan: {}", e);
                        }
                        done_tx.send_replace(true);
                    });
                }
                Effect::Connect { ticket, peripheral } => {
                    let radio = self.radio.clone();
                    let stopped = self.scan_stopped.clone();
                    self.spawn_step(ticket, async move {
                        scan_stopped(stopped).await;
                        connect_step(radio.as_ref(), &peripheral).await
                    });
                }
                Effect::Write {
                    ticket,
                    peripheral,
                    payload,
                    max_len,
                } => {
                    let radio = self.radio.clone();
                    self.spawn_step(ticket, async move {
                        write_step(radio.as_ref(), &peripheral, &payload, max_len).await
                    });
                }
                Effect::ArmTimer {
                    ticket,
                    delay,
                    timer,
                } => {
                    self.spawn_step(ticket, async move {
                        tokio::time::sleep(delay).await;
                        Ok(timer.outcome())
                    });
                }
                Effect::Deliver(request) => request.complete(),
                Effect::Transitioned(transition) => {
                    self.state_tx.send_replace(transition.to);
                    // No subscribers is fine
                    let _ = self.transitions_tx.send(transition);
                }
            }
        }

        let active = self.machine.is_active();
        self.active_tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    /// Run `step` in its own task and post its result under `ticket`.
    fn spawn_step<F>(&self, ticket: Ticket, step: F)
    where
        F: Future<Output = Result<Outcome, SessionError>> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = step => {
                    let outcome = result.unwrap_or_else(Outcome::Failed);
                    let _ = tx.send(Event::Complete(Completion::new(ticket, outcome)));
                }
            }
        });
    }
}

/// Wait until the last requested `stop_scan` has returned.
async fn scan_stopped(stopped: Option<watch::Receiver<bool>>) {
    if let Some(mut stopped) = stopped {
        // Err means the stop task is gone, which also ends the wait
        let _ = stopped.wait_for(|done| *done).await;
    }
}

async fn scan_step(
    radio: &dyn Radio,
    filter: ScanFilter,
    sink: DiscoverySink,
) -> Result<Outcome, SessionError> {
    radio.enable_adapter().await.map_err(SessionError::AdapterRefused)?;
    radio
        .start_scan(&filter, sink)
        .await
        .map_err(SessionError::ScanFailure)?;
    Ok(Outcome::ScanStarted)
}

async fn connect_step(
    radio: &dyn Radio,
    peripheral: &PeripheralRecord,
) -> Result<Outcome, SessionError> {
    let id = peripheral.id.as_str();
    radio.enable_adapter().await.map_err(SessionError::AdapterRefused)?;
    if let Err(e) = radio.disconnect(id).await {
        debug!("[session] Pre-connect disconnect of {} ignored: {}", id, e);
    }
    radio.connect(id).await.map_err(SessionError::ConnectFailure)?;

    let ((), rssi) = tokio::try_join!(
        async {
            radio
                .discover_services(id)
                .await
                .map_err(SessionError::ServiceDiscoveryFailure)
        },
        async {
            radio
                .read_signal_strength(id)
                .await
                .map_err(SessionError::SignalReadFailure)
        },
    )?;
    Ok(Outcome::Connected { rssi })
}

async fn write_step(
    radio: &dyn Radio,
    peripheral: &PeripheralRecord,
    payload: &[u8],
    max_len: usize,
) -> Result<Outcome, SessionError> {
    radio.enable_adapter().await.map_err(SessionError::AdapterRefused)?;
    radio
        .write_command(
            &peripheral.id,
            peripheral.service_id,
            peripheral.characteristic_id,
            payload,
            max_len,
        )
        .await
        .map_err(SessionError::WriteFailure)?;
    Ok(Outcome::Written)
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: EventTx,
    state: watch::Receiver<SessionState>,
    active: watch::Receiver<bool>,
    transitions: broadcast::Sender<Transition>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Submit an optional request and return immediately.
    ///
    /// `None` only asks the session to re-evaluate. Requests are written in
    /// submission order; each callback runs once its payload is accepted.
    pub fn process(&self, request: Option<Request>) -> Result<(), SessionClosed> {
        self.events
            .send(Event::Submit(request))
            .map_err(|_| SessionClosed)
    }

    /// Submit `payload` and wait until it has been delivered.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), SessionClosed> {
        let (request, delivered) = Request::with_notify(payload);
        self.process(Some(request))?;
        delivered.await.map_err(|_| SessionClosed)
    }

    /// Whether the link is ready for commands.
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Watch the activity flag.
    pub fn activity(&self) -> watch::Receiver<bool> {
        self.active.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch the current state. Intermediate states may be skipped; use
    /// [`SessionHandle::subscribe`] to see every transition.
    pub fn states(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Stop the session task. Undelivered requests are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether the session task has stopped.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{Operation, RadioError, SimulatedRadio};
    use crate::registry::Observation;
    use crate::session::Cause;
    use std::time::Duration;
    use tokio::time::Instant;

    fn three_peripherals() -> Arc<SimulatedRadio> {
        Arc::new(SimulatedRadio::with_peripherals([
            Observation::new("a", "A", -80),
            Observation::new("b", "B", -60),
            Observation::new("c", "C", -70),
        ]))
    }

    fn start(
        radio: &Arc<SimulatedRadio>,
        config: SessionConfig,
    ) -> (SessionHandle, broadcast::Receiver<Transition>) {
        let (session, handle) = Session::new(radio.clone(), config).unwrap();
        let transitions = handle.subscribe();
        tokio::spawn(session.run());
        (handle, transitions)
    }

    async fn next(rx: &mut broadcast::Receiver<Transition>) -> (SessionState, SessionState) {
        let t = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("no transition within two minutes")
            .expect("transition channel closed");
        (t.from, t.to)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_connect_write_fail_recover() {
        use SessionState::*;
        let radio = three_peripherals();
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        assert_eq!(radio.connected().as_deref(), Some("b"));
        assert!(handle.is_active());
        assert_eq!(handle.state(), Idle);

        handle.send("mokaon").await.unwrap();
        assert!(handle.is_active());
        assert_eq!(radio.writes()[0].payload(), b"mokaon".to_vec());

        radio.fail_next(Operation::WriteCommand, RadioError::Backend("gatt busy".into()));
        let (request, delivered) = Request::with_notify("mokaoff");
        handle.process(Some(request)).unwrap();

        assert_eq!(next(&mut rx).await, (Idle, FailureWait));
        assert!(!handle.is_active());
        let waited_from = Instant::now();
        assert_eq!(next(&mut rx).await, (FailureWait, Scanning));
        assert!(waited_from.elapsed() >= Duration::from_millis(500));

        // The failed request is retried once reconnected
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        delivered.await.unwrap();
        assert_eq!(radio.writes().len(), 2);
        assert_eq!(radio.writes()[1].payload(), b"mokaoff".to_vec());
        assert_eq!(handle.stats().failures.write.load(std::sync::atomic::Ordering::Relaxed), 1);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_then_late_completion_is_stale() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.set_latency(Operation::Connect, Duration::from_secs(15));
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Scanning));
        radio.set_latency(Operation::Connect, Duration::ZERO);

        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        let stats = handle.stats();
        assert_eq!(stats.stale_completions(), 1);
        assert_eq!(stats.failures.timeout.load(std::sync::atomic::Ordering::Relaxed), 1);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_scan_start_times_out_and_rescans() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.set_latency(Operation::EnableAdapter, Duration::from_secs(3600));
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        let scan_began = Instant::now();
        let t = rx.recv().await.unwrap();
        assert_eq!((t.from, t.to), (Scanning, RescanWait));
        assert_eq!(t.cause, Cause::Failure(SessionError::Timeout));
        assert!(scan_began.elapsed() >= Duration::from_millis(10_000));
        assert!(scan_began.elapsed() < Duration::from_secs(60));
        radio.set_latency(Operation::EnableAdapter, Duration::ZERO);

        assert_eq!(next(&mut rx).await, (RescanWait, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        assert_eq!(handle.stats().failures.timeout.load(std::sync::atomic::Ordering::Relaxed), 1);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stop_does_not_end_next_window() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.set_latency(Operation::StopScan, Duration::from_secs(2));
        radio.fail_next(Operation::Connect, RadioError::PeripheralNotFound("b".into()));
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Scanning));

        // Well past the first stop, still inside the new window
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.state(), Scanning);
        assert!(radio.is_scanning());

        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        let stats = handle.stats();
        assert_eq!(stats.failures.no_candidate.load(std::sync::atomic::Ordering::Relaxed), 0);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_just_inside_window_wins() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.advertise_at(Duration::from_millis(4_999), Observation::new("late", "Late", -40));
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        assert_eq!(radio.connected().as_deref(), Some("late"));

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_after_window_is_ignored() {
        use SessionState::*;
        let radio = three_peripherals();
        // The radio keeps reporting until the stop returns at 6 s
        radio.set_latency(Operation::StopScan, Duration::from_secs(1));
        radio.advertise_at(Duration::from_millis(5_001), Observation::new("late", "Late", -40));
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));
        assert_eq!(radio.connected().as_deref(), Some("b"));
        assert_eq!(handle.stats().stale_completions(), 0);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_step_failure_rescans() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.fail_next(
            Operation::ReadSignalStrength,
            RadioError::Backend("rssi unavailable".into()),
        );
        let (handle, mut rx) = start(&radio, SessionConfig::default());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Scanning));
        assert_eq!(next(&mut rx).await, (Scanning, Connecting));
        assert_eq!(next(&mut rx).await, (Connecting, Idle));

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_refused_waits_then_rescans() {
        use SessionState::*;
        let radio = three_peripherals();
        radio.fail_next(
            Operation::EnableAdapter,
            RadioError::AdapterUnavailable("powered off".into()),
        );
        let (session, handle) = Session::new(radio.clone(), SessionConfig::default()).unwrap();
        let mut rx = handle.subscribe();
        tokio::spawn(session.run());

        assert_eq!(next(&mut rx).await, (Scanning, Scanning));
        let refused_at = Instant::now();
        assert_eq!(next(&mut rx).await, (Scanning, FailureWait));
        assert_eq!(next(&mut rx).await, (FailureWait, Scanning));
        assert!(refused_at.elapsed() >= Duration::from_millis(500));
        assert_eq!(handle.stats().consecutive_failures(), 1);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peripherals_rescans_with_cause() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = Session::new(radio.clone(), SessionConfig::default()).unwrap();
        let mut rx = handle.subscribe();
        tokio::spawn(session.run());

        rx.recv().await.unwrap();
        let t = rx.recv().await.unwrap();
        assert_eq!(t.to, SessionState::RescanWait);
        assert_eq!(t.cause, Cause::Failure(SessionError::NoCandidate));
        assert_eq!(radio.call_count(Operation::Connect), 0);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_before_connect_is_delivered_after() {
        let radio = three_peripherals();
        let (handle, _rx) = start(&radio, SessionConfig::default());

        assert!(!handle.is_active());
        handle.send("early").await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
        assert!(handle.is_active());
        assert_eq!(radio.writes().len(), 1);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_payload_is_chunked() {
        let radio = three_peripherals();
        let (handle, _rx) = start(&radio, SessionConfig::default());

        let payload = vec![0x5a; 40];
        handle.send(payload.clone()).await.unwrap();

        let writes = radio.writes();
        assert_eq!(writes[0].chunks.len(), 3);
        assert_eq!(writes[0].payload(), payload);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_watch_follows_idle() {
        let radio = three_peripherals();
        let (handle, _rx) = start(&radio, SessionConfig::default());
        let mut activity = handle.activity();

        activity.wait_for(|active| *active).await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let radio = three_peripherals();
        let (session, handle) = Session::new(radio, SessionConfig::default()).unwrap();
        let task = tokio::spawn(session.run());

        handle.shutdown();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert_eq!(handle.process(None), Err(SessionClosed));
        assert_eq!(handle.send("late").await, Err(SessionClosed));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            max_write_len: 0,
            ..SessionConfig::default()
        };
        assert!(Session::new(Arc::new(SimulatedRadio::new()), config).is_err());
    }
}

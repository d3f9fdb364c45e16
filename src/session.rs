//! Session Supervisor (component H): owns the lifecycle of D+E+F+G for one
//! `(device, optional guest, duration)` triple, enforces the safety timer,
//! and shuts everything down in the order that keeps `pressed` authoritative
//! through teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use kbd_proto::{Event, Keystroke, RelayIntent, Selection, SessionId, SessionMode, SessionStatus};

use crate::correlator::Correlator;
use crate::events::EventBus;
use crate::host_tap::{CorrelatorGate, HostTap, TapAction};
use crate::stream::{DeviceStream, HidSource};

/// Supervisor state machine from §4.H. `Preparing` exists only for the
/// duration of `start`; callers only ever observe `Active`, `Draining`, or
/// the absence of a session (`Idle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Draining,
}

/// Whether D, E, both, or neither started cleanly (§4.H "partial start").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub device_stream_started: bool,
    pub host_tap_started: bool,
}

impl StartOutcome {
    fn degraded(&self) -> bool {
        !(self.device_stream_started && self.host_tap_started)
    }
}

/// A live Session: the owned threads, shared Correlator, and bookkeeping
/// the supervisor needs to answer `session_status`/`stop_session`.
pub struct Session {
    pub id: SessionId,
    pub target: Selection,
    pub mode: SessionMode,
    started_at_millis: u64,
    deadline_millis: Option<u64>,
    state: Mutex<SessionState>,
    correlator: Arc<Correlator>,
    keystroke_log: Arc<Mutex<Vec<Keystroke>>>,
    device_thread: Mutex<Option<JoinHandle<()>>>,
    host_thread: Mutex<Option<JoinHandle<()>>>,
    hid_source: Arc<dyn HidSource>,
    host_tap: Arc<dyn HostTap>,
    relay_tx: Option<SyncSender<RelayIntent>>,
    stop_requested: Arc<AtomicBool>,
    janitor_thread: Mutex<Option<JoinHandle<()>>>,
    event_bus: Arc<EventBus>,
}

impl Session {
    /// `Idle → Preparing → Active`: starts D and E, arms the safety timer.
    /// Degraded (partial) start is not an error — the session proceeds with
    /// whichever of D/E came up, per §4.H.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        id: SessionId,
        target: Selection,
        mode: SessionMode,
        duration: Option<Duration>,
        correlator: Arc<Correlator>,
        hid_source: Arc<dyn HidSource>,
        host_tap: Arc<dyn HostTap>,
        relay_tx: Option<SyncSender<RelayIntent>>,
        janitor_interval: Duration,
        now_millis: u64,
        event_bus: Arc<EventBus>,
    ) -> (Arc<Session>, StartOutcome) {
        // Dry-open verifies tap permission before committing to Active.
        let host_tap_started = host_tap.dry_open().is_ok();

        let session = Arc::new(Session {
            id,
            target: target.clone(),
            mode: mode.clone(),
            started_at_millis: now_millis,
            deadline_millis: duration.map(|d| now_millis + d.as_millis() as u64),
            state: Mutex::new(SessionState::Active),
            correlator: Arc::clone(&correlator),
            keystroke_log: Arc::new(Mutex::new(Vec::new())),
            device_thread: Mutex::new(None),
            host_thread: Mutex::new(None),
            hid_source: Arc::clone(&hid_source),
            host_tap: Arc::clone(&host_tap),
            relay_tx,
            stop_requested: Arc::new(AtomicBool::new(false)),
            janitor_thread: Mutex::new(None),
            event_bus,
        });

        let device_stream_started = session.spawn_device_thread();
        if host_tap_started {
            session.spawn_host_thread();
        } else {
            warn!("host tap failed to start, session {} running capture-only", id.0);
        }
        session.spawn_janitor(janitor_interval);

        let outcome = StartOutcome { device_stream_started, host_tap_started };
        if outcome.degraded() {
            warn!("session {} started in degraded mode: {outcome:?}", id.0);
        }

        (session, outcome)
    }

    fn spawn_device_thread(&self) -> bool {
        let selection_keys = self.target.device_keys();
        let stream = DeviceStream::new(selection_keys, Arc::clone(&self.correlator));
        let hid_source = Arc::clone(&self.hid_source);
        let relay_tx = self.relay_tx.clone();
        let keystroke_log = Arc::clone(&self.keystroke_log);
        let event_bus = Arc::clone(&self.event_bus);
        let target_guest = match &self.mode {
            SessionMode::Relay(guest) => Some(guest.clone()),
            SessionMode::CaptureOnly => None,
        };

        let handle = std::thread::spawn(move || {
            let result = stream.run(
                hid_source.as_ref(),
                crate::utils::monotonic_millis,
                target_guest.as_ref(),
                |keystroke| {
                    event_bus.publish(Event::KeystrokeCaptured(keystroke.clone()));
                    keystroke_log.lock().unwrap().push(keystroke);
                },
                relay_tx.as_ref(),
            );
            if let Err(err) = result {
                warn!("device stream exited: {err}");
            }
        });

        *self.device_thread.lock().unwrap() = Some(handle);
        true
    }

    fn spawn_host_thread(&self) {
        let host_tap = Arc::clone(&self.host_tap);
        let gate = CorrelatorGate::new(Arc::clone(&self.correlator));

        let handle = std::thread::spawn(move || {
            let result = host_tap.run(&mut |event| gate.decide(event));
            if let Err(err) = result {
                warn!("host tap exited: {err}");
            }
        });

        *self.host_thread.lock().unwrap() = Some(handle);
    }

    fn spawn_janitor(&self, interval: Duration) {
        let correlator = Arc::clone(&self.correlator);
        let stop_requested = Arc::clone(&self.stop_requested);

        // Polls `stop_requested` in short ticks rather than one long sleep,
        // so `stop()` doesn't block for up to a whole janitor interval.
        const POLL: Duration = Duration::from_millis(50);
        let handle = std::thread::spawn(move || 'outer: loop {
            let mut waited = Duration::ZERO;
            while waited < interval {
                if stop_requested.load(Ordering::Acquire) {
                    break 'outer;
                }
                std::thread::sleep(POLL);
                waited += POLL;
            }
            correlator.run_janitor(crate::utils::monotonic_millis());
        });

        *self.janitor_thread.lock().unwrap() = Some(handle);
    }

    pub fn status(&self, now_millis: u64) -> SessionStatus {
        let active = *self.state.lock().unwrap() == SessionState::Active;
        let time_remaining = self
            .deadline_millis
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_millis)));
        SessionStatus {
            active,
            events_captured: self.keystroke_log.lock().unwrap().len() as u64,
            time_remaining,
        }
    }

    pub fn keystroke_log(&self) -> Vec<Keystroke> {
        self.keystroke_log.lock().unwrap().clone()
    }

    /// Whether the safety deadline has passed, checked by the engine's
    /// periodic sweep (§5 "a scheduled task flips the supervisor to
    /// Draining when it fires").
    pub fn deadline_elapsed(&self, now_millis: u64) -> bool {
        self.deadline_millis.map(|d| now_millis >= d).unwrap_or(false)
    }

    /// `Active → Draining → Idle`. Tears down E before D so in-flight host
    /// events still see an authoritative `pressed` set (§4.H), then stops
    /// the janitor. Outstanding G jobs are left to the forwarder to drain
    /// (§5: "no cancellation").
    pub fn stop(&self) {
        *self.state.lock().unwrap() = SessionState::Draining;

        self.host_tap.request_stop();
        if let Some(handle) = self.host_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.hid_source.request_stop();
        if let Some(handle) = self.device_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.janitor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_tap::MockHostTap;
    use crate::stream::MockHidSource;
    use kbd_proto::{Device, GuestId, Transport};

    fn selection() -> Selection {
        Selection {
            devices: vec![Device {
                device_key: "05ac:0250:00000001".into(),
                physical_id: "05ac-0250-0".into(),
                name: "Test".into(),
                manufacturer: "Test".into(),
                transport: Transport::Usb,
                vendor_id: 0x05ac,
                product_id: 0x0250,
            }],
        }
    }

    fn correlator() -> Arc<Correlator> {
        Arc::new(Correlator::new(
            Duration::from_secs(10),
            Duration::from_millis(80),
            Duration::from_secs(30),
            50,
        ))
    }

    fn event_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[test]
    fn start_with_working_tap_and_source_is_not_degraded() {
        let hid = Arc::new(MockHidSource::new(Vec::new()));
        let tap = Arc::new(MockHostTap::new(Vec::new()));
        let (session, outcome) = Session::start(
            SessionId(1),
            selection(),
            SessionMode::CaptureOnly,
            None,
            correlator(),
            hid,
            tap,
            None,
            Duration::from_secs(5),
            0,
            event_bus(),
        );
        assert!(!outcome.degraded());
        session.stop();
    }

    #[test]
    fn start_with_failing_dry_open_runs_degraded_capture_only() {
        let hid = Arc::new(MockHidSource::new(Vec::new()));
        let tap = Arc::new(MockHostTap::failing_dry_open());
        let (session, outcome) = Session::start(
            SessionId(2),
            selection(),
            SessionMode::CaptureOnly,
            None,
            correlator(),
            hid,
            tap,
            None,
            Duration::from_secs(5),
            0,
            event_bus(),
        );
        assert!(outcome.degraded());
        assert!(outcome.device_stream_started);
        assert!(!outcome.host_tap_started);
        session.stop();
    }

    #[test]
    fn deadline_elapsed_reports_true_past_the_configured_duration() {
        let hid = Arc::new(MockHidSource::new(Vec::new()));
        let tap = Arc::new(MockHostTap::new(Vec::new()));
        let (session, _) = Session::start(
            SessionId(3),
            selection(),
            SessionMode::CaptureOnly,
            Some(Duration::from_millis(100)),
            correlator(),
            hid,
            tap,
            None,
            Duration::from_secs(5),
            1_000,
            event_bus(),
        );
        assert!(!session.deadline_elapsed(1_050));
        assert!(session.deadline_elapsed(1_150));
        session.stop();
    }

    #[test]
    fn relay_mode_targets_the_configured_guest() {
        let hid = Arc::new(MockHidSource::new(Vec::new()));
        let tap = Arc::new(MockHostTap::new(Vec::new()));
        let mode = SessionMode::Relay(GuestId("vm-x".into()));
        let (session, _) = Session::start(
            SessionId(4),
            selection(),
            mode.clone(),
            None,
            correlator(),
            hid,
            tap,
            None,
            Duration::from_secs(5),
            0,
            event_bus(),
        );
        assert_eq!(session.mode, mode);
        session.stop();
    }
}

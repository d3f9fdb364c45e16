//! Top-level `Engine`: the "core exposes" API from §6, wiring the Device
//! Enumerator (A), Identity Detector (B), and Session Supervisor (H) behind
//! the operator control surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbd_config::Config;
use kbd_proto::{Device, EngineError, Event, Guest, Keystroke, Selection, SessionId, SessionMode, SessionStatus};

use crate::correlator::Correlator;
use crate::device::DeviceBackend;
use crate::events::EventBus;
use crate::guest::{self, GuestController, GuestForwarder};
use crate::host_tap::HostTap;
use crate::identity::{self, IdentitySource};
use crate::session::Session;
use crate::stream::HidSource;

/// Everything the engine needs from the platform, gathered so `--mock` and
/// real macOS runs construct an `Engine` the same way (mirrors the teacher
/// compositor's backend-selection split in `main.rs`).
pub struct Platform {
    pub device_backend: Arc<dyn DeviceBackend>,
    pub identity_source: Arc<dyn IdentitySource>,
    pub hid_source_factory: Arc<dyn Fn() -> Arc<dyn HidSource> + Send + Sync>,
    pub host_tap_factory: Arc<dyn Fn() -> Arc<dyn HostTap> + Send + Sync>,
    pub guest_controller: Arc<dyn GuestController>,
}

struct LiveSession {
    session: Arc<Session>,
    forwarder: Option<Arc<GuestForwarder>>,
}

/// The engine instance a daemon process owns for its whole lifetime.
pub struct Engine {
    config: Config,
    platform: Platform,
    sessions: Mutex<HashMap<u64, LiveSession>>,
    next_session_id: AtomicU64,
    event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(config: Config, platform: Platform) -> Self {
        Self {
            config,
            platform,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            event_bus: Arc::new(EventBus::new()),
        }
    }

    /// Component A: `enumerate_devices() → list<Device>`.
    pub fn enumerate_devices(&self) -> Result<Vec<Device>, EngineError> {
        self.platform.device_backend.enumerate()
    }

    /// Component B: `detect_identity(stop_predicate) → Selection`.
    pub fn detect_identity(&self, stop_after: u32) -> Result<Selection, EngineError> {
        let available = self.enumerate_devices()?;
        identity::detect(
            self.platform.identity_source.as_ref(),
            &available,
            identity::at_least_n_devices(stop_after.max(1) as usize),
        )
    }

    /// Starts a Session for `(selection, mode, duration)`, per §4.H.
    pub fn start_session(
        &self,
        selection: Selection,
        mode: SessionMode,
        duration: Option<Duration>,
    ) -> Result<SessionId, EngineError> {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));

        let correlator = Arc::new(Correlator::new(
            self.config.hold_ttl(),
            self.config.initial_window(),
            self.config.janitor_max_age(),
            self.config.janitor_cap,
        ));

        let forwarder = match &mode {
            SessionMode::Relay(_) => Some(Arc::new(GuestForwarder::spawn(
                Arc::clone(&self.platform.guest_controller),
                self.config.guest_max_in_flight,
                Arc::clone(&self.event_bus),
            ))),
            SessionMode::CaptureOnly => None,
        };
        let relay_tx = forwarder.as_ref().map(|f| f.sender());

        let hid_source = (self.platform.hid_source_factory)();
        let host_tap = (self.platform.host_tap_factory)();

        let (session, outcome) = Session::start(
            id,
            selection,
            mode,
            duration,
            correlator,
            hid_source,
            host_tap,
            relay_tx,
            self.config.janitor_interval(),
            crate::utils::monotonic_millis(),
            Arc::clone(&self.event_bus),
        );

        self.publish(Event::StateTransitioned { session: id, state: "Active" });
        if !(outcome.device_stream_started && outcome.host_tap_started) {
            warn!("session {} active in degraded mode: {outcome:?}", id.0);
        }

        self.sessions.lock().unwrap().insert(id.0, LiveSession { session, forwarder });
        Ok(id)
    }

    /// `Active → Draining → Idle`: stops D/E/the janitor in order, then
    /// drains G's outstanding jobs (§4.H, §5).
    pub fn stop_session(&self, id: SessionId) -> Result<(), EngineError> {
        let live = self.sessions.lock().unwrap().remove(&id.0).ok_or(EngineError::SessionNotFound(id))?;
        live.session.stop();
        self.publish(Event::StateTransitioned { session: id, state: "Idle" });
        if let Some(forwarder) = live.forwarder {
            if let Ok(forwarder) = Arc::try_unwrap(forwarder) {
                forwarder.shutdown();
            }
        }
        Ok(())
    }

    pub fn session_status(&self, id: SessionId) -> Result<SessionStatus, EngineError> {
        let sessions = self.sessions.lock().unwrap();
        let live = sessions.get(&id.0).ok_or(EngineError::SessionNotFound(id))?;
        Ok(live.session.status(crate::utils::monotonic_millis()))
    }

    pub fn copy_keystroke_log(&self, id: SessionId) -> Result<Vec<Keystroke>, EngineError> {
        let sessions = self.sessions.lock().unwrap();
        let live = sessions.get(&id.0).ok_or(EngineError::SessionNotFound(id))?;
        Ok(live.session.keystroke_log())
    }

    pub fn list_guests(&self) -> Result<Vec<Guest>, EngineError> {
        guest::list_guests(self.platform.guest_controller.as_ref())
    }

    /// Sweeps all live sessions for an elapsed safety deadline, stopping
    /// any that have fired (§5: "a scheduled task flips the supervisor to
    /// Draining when it fires"). Intended to be called periodically from
    /// the daemon's main loop.
    pub fn sweep_deadlines(&self) {
        let now = crate::utils::monotonic_millis();
        let expired: Vec<u64> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, live)| live.session.deadline_elapsed(now))
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            info!("session {id} safety deadline elapsed, stopping");
            let _ = self.stop_session(SessionId(id));
        }
    }

    /// Registers a new `Event` subscriber for `Request::EventStream`.
    pub fn subscribe_events(&self) -> Receiver<Event> {
        self.event_bus.subscribe()
    }

    fn publish(&self, event: Event) {
        self.event_bus.publish(event);
    }
}

//! Device Stream (component D): a per-selected-device HID reader that turns
//! raw state reports into press/release transitions, keeps the Correlator's
//! timestamps current, and — in Relay mode — enqueues intents for the Guest
//! Forwarder.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use std::sync::Arc;

use kbd_proto::{Direction, GuestId, Keystroke, RelayDirection, RelayIntent};

use crate::codes::{is_rollover, key_code_to_scan_code, usage_to_key_code};
use crate::correlator::Correlator;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::IoHidStreamSource;

/// One raw HID value report, as delivered by the platform's per-handle
/// input-value callback (§6: `{usage_page, usage, integer_value,
/// reporting_handle}`).
#[derive(Debug, Clone)]
pub struct RawValue {
    pub usage_page: u32,
    pub usage: u32,
    pub integer_value: i64,
    pub reporting_device_key: String,
}

const USAGE_PAGE_KEYBOARD: u32 = 0x07;

/// Platform seam for component D.
pub trait HidSource: Send + Sync {
    /// Runs until the session is torn down, invoking `on_value` for every
    /// raw HID value report observed on the selected interface(s). Returning
    /// from this call means the underlying callback has been uninstalled.
    fn run(&self, on_value: &mut dyn FnMut(RawValue)) -> Result<(), kbd_proto::EngineError>;

    /// Unblocks a concurrently running `run` call from another thread, so
    /// the Session Supervisor can tear D down on `stop_session` (§4.H). The
    /// default suits sources whose `run` returns on its own (e.g. a scripted
    /// mock); a real run-loop-backed source overrides this.
    fn request_stop(&self) {}
}

/// Keeps `prev_state: map<key_code → bool>` per §4.D and drives the
/// transition filter, correlator updates, and relay enqueueing for one
/// Session.
pub struct DeviceStream {
    selection_keys: HashSet<String>,
    prev_state: Mutex<HashMap<i32, bool>>,
    correlator: Arc<Correlator>,
    events_captured: std::sync::atomic::AtomicU64,
}

/// What the stream does with each emitted Keystroke, handed back to the
/// caller for logging / relay enqueueing. The stream itself never blocks on
/// I/O, matching the "no blocking callbacks" requirement in §5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub keystroke: Keystroke,
    pub relay_intent: Option<RelayIntent>,
}

impl DeviceStream {
    pub fn new(selection_keys: HashSet<String>, correlator: Arc<Correlator>) -> Self {
        Self {
            selection_keys,
            prev_state: Mutex::new(HashMap::new()),
            correlator,
            events_captured: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn events_captured(&self) -> u64 {
        self.events_captured.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Processes one raw HID value report, returning the resulting
    /// `Emission` if the transition filter produced a Keystroke.
    ///
    /// `target` is `Some(GuestId)` when the Session is in Relay mode, so the
    /// caller should enqueue the returned `RelayIntent`; `None` in
    /// CaptureOnly mode, in which case `relay_intent` is always `None`.
    pub fn process(&self, value: RawValue, at_millis: u64, target: Option<&GuestId>) -> Option<Emission> {
        // Multi-interface managers share a callback; drop values from a
        // device outside this Session's Selection (§4.D).
        if !self.selection_keys.contains(&value.reporting_device_key) {
            return None;
        }
        if value.usage_page != USAGE_PAGE_KEYBOARD {
            return None;
        }
        if is_rollover(value.usage) {
            return None;
        }

        let key_code = usage_to_key_code(value.usage);
        let cur = value.integer_value > 0;

        let mut prev_state = self.prev_state.lock().unwrap();
        let prev = prev_state.get(&key_code).copied().unwrap_or(false);

        let direction = match (prev, cur) {
            (false, true) => Direction::Down,
            (true, false) => Direction::Up,
            _ => return None, // steady state: no transition, no Keystroke
        };
        prev_state.insert(key_code, cur);
        drop(prev_state);

        let keystroke = Keystroke {
            key_code,
            direction,
            at_millis,
            source_device_key: value.reporting_device_key,
        };

        match direction {
            Direction::Down => self.correlator.record_hid_down(key_code, at_millis),
            Direction::Up => self.correlator.record_hid_up(key_code, at_millis),
        }

        self.events_captured.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let relay_intent = target.map(|guest| RelayIntent {
            scan_code: key_code_to_scan_code(key_code),
            direction: match direction {
                Direction::Down => RelayDirection::Press,
                Direction::Up => RelayDirection::Release,
            },
            target: guest.clone(),
        });

        Some(Emission { keystroke, relay_intent })
    }

    /// Drives `source` for the lifetime of the Session, forwarding every
    /// emitted Keystroke's log entry and relay intent to the caller-supplied
    /// sinks.
    pub fn run(
        &self,
        source: &dyn HidSource,
        now: impl Fn() -> u64,
        target: Option<&GuestId>,
        mut on_keystroke: impl FnMut(Keystroke),
        relay_tx: Option<&SyncSender<RelayIntent>>,
    ) -> Result<(), kbd_proto::EngineError> {
        source.run(&mut |value| {
            if let Some(emission) = self.process(value, now(), target) {
                if let Some(intent) = emission.relay_intent {
                    if let Some(tx) = relay_tx {
                        if let Err(err) = tx.try_send(intent) {
                            let dropped = match err {
                                std::sync::mpsc::TrySendError::Full(intent) => intent,
                                std::sync::mpsc::TrySendError::Disconnected(intent) => intent,
                            };
                            warn!("guest relay queue full, dropping {dropped:?}");
                        }
                    }
                }
                on_keystroke(emission.keystroke);
            }
        })
    }
}

/// In-memory `HidSource` driven by a fixed script, for tests and for
/// `--mock` runs off-macOS.
pub struct MockHidSource {
    script: Vec<RawValue>,
}

impl MockHidSource {
    pub fn new(script: Vec<RawValue>) -> Self {
        Self { script }
    }
}

impl HidSource for MockHidSource {
    fn run(&self, on_value: &mut dyn FnMut(RawValue)) -> Result<(), kbd_proto::EngineError> {
        for value in self.script.clone() {
            on_value(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn correlator() -> Arc<Correlator> {
        Arc::new(Correlator::new(
            Duration::from_secs(10),
            Duration::from_millis(80),
            Duration::from_secs(30),
            50,
        ))
    }

    fn selection_of(key: &str) -> HashSet<String> {
        let mut s = HashSet::new();
        s.insert(key.to_owned());
        s
    }

    fn value(usage: u32, integer_value: i64, device_key: &str) -> RawValue {
        RawValue {
            usage_page: USAGE_PAGE_KEYBOARD,
            usage,
            integer_value,
            reporting_device_key: device_key.to_owned(),
        }
    }

    #[test]
    fn down_then_up_emits_two_keystrokes() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        let down = stream.process(value(0x1A, 1, "a"), 100, None).unwrap();
        assert_eq!(down.keystroke.direction, Direction::Down);
        assert_eq!(down.keystroke.key_code, 13);

        let up = stream.process(value(0x1A, 0, "a"), 200, None).unwrap();
        assert_eq!(up.keystroke.direction, Direction::Up);
    }

    #[test]
    fn steady_state_report_emits_nothing() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        stream.process(value(0x1A, 1, "a"), 100, None).unwrap();
        assert!(stream.process(value(0x1A, 1, "a"), 150, None).is_none());
    }

    #[test]
    fn value_from_unselected_device_is_dropped() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        assert!(stream.process(value(0x1A, 1, "b"), 100, None).is_none());
    }

    #[test]
    fn rollover_sentinel_emits_nothing() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        assert!(stream.process(value(crate::codes::ROLLOVER_SENTINEL, 1, "a"), 100, None).is_none());
    }

    #[test]
    fn relay_mode_produces_matching_intent() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        let guest = GuestId("vm-x".into());
        let down = stream.process(value(0x1A, 1, "a"), 100, Some(&guest)).unwrap();
        let intent = down.relay_intent.unwrap();
        assert_eq!(intent.scan_code, 17);
        assert_eq!(intent.direction, RelayDirection::Press);
        assert_eq!(intent.target, guest);
    }

    #[test]
    fn capture_only_mode_never_produces_an_intent() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        let down = stream.process(value(0x1A, 1, "a"), 100, None).unwrap();
        assert!(down.relay_intent.is_none());
    }

    #[test]
    fn events_captured_counts_each_emitted_keystroke() {
        let stream = DeviceStream::new(selection_of("a"), correlator());
        stream.process(value(0x1A, 1, "a"), 100, None);
        stream.process(value(0x1A, 0, "a"), 200, None);
        assert_eq!(stream.events_captured(), 2);
    }
}

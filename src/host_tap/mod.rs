//! Host Stream Tap (component E): the system-wide key-event interceptor.
//! Its callback is the only place the Correlator's decision functions are
//! invoked from outside the HID thread, and it must never block — the
//! decision functions are O(1) for exactly this reason.

use std::sync::Arc;

use kbd_proto::{Direction, EngineError, HostEvent};

use crate::correlator::{Correlator, Decision};

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::CgEventHostTap;

/// What the tap does with an intercepted event, mirroring §4.E's "drop the
/// event (consumed, nothing downstream sees it)" / "pass (continues to the
/// host)" outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapAction {
    Drop,
    Pass,
}

/// Platform seam for component E.
pub trait HostTap: Send + Sync {
    /// Installs the interceptor and runs until uninstalled, calling
    /// `decide` synchronously for every intercepted `HostEvent` and acting
    /// on its `TapAction` before the call returns. Fails with
    /// `PermissionDenied` if the host blocks installation without an
    /// explicit user grant.
    fn run(&self, decide: &mut dyn FnMut(HostEvent) -> TapAction) -> Result<(), EngineError>;

    /// Attempts to install and immediately uninstall the tap, to verify
    /// permission without running a full session (§4.H: "verifies
    /// permissions via E's dry-open").
    fn dry_open(&self) -> Result<(), EngineError>;

    /// Unblocks a concurrently running `run` call from another thread. The
    /// shutdown ordering in §4.H requires this to complete *before* D is
    /// torn down.
    fn request_stop(&self) {}
}

/// Drives a `Correlator`'s decision functions from intercepted `HostEvent`s;
/// the piece of glue both the real and mock `HostTap` impls call into.
pub struct CorrelatorGate {
    correlator: Arc<Correlator>,
}

impl CorrelatorGate {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self { correlator }
    }

    pub fn decide(&self, event: HostEvent) -> TapAction {
        let decision = match event.direction {
            Direction::Down => self.correlator.should_block_down(event.key_code, event.at_millis),
            Direction::Up => self.correlator.should_block_up(event.key_code),
        };
        match decision {
            Decision::Block => TapAction::Drop,
            Decision::Pass => TapAction::Pass,
        }
    }
}

/// In-memory `HostTap` driven by a fixed script of events, for tests and
/// for `--mock` runs off-macOS.
pub struct MockHostTap {
    script: Vec<HostEvent>,
    fail_dry_open: bool,
}

impl MockHostTap {
    pub fn new(script: Vec<HostEvent>) -> Self {
        Self { script, fail_dry_open: false }
    }

    pub fn failing_dry_open() -> Self {
        Self { script: Vec::new(), fail_dry_open: true }
    }
}

impl HostTap for MockHostTap {
    fn run(&self, decide: &mut dyn FnMut(HostEvent) -> TapAction) -> Result<(), EngineError> {
        for event in &self.script {
            decide(*event);
        }
        Ok(())
    }

    fn dry_open(&self) -> Result<(), EngineError> {
        if self.fail_dry_open {
            Err(EngineError::PermissionDenied("mock tap denied".into()))
        } else {
            Ok(())
        }
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

    #[test]
    fn gate_blocks_down_claimed_within_initial_window() {
        let correlator = correlator();
        correlator.record_hid_down(13, 100);
        let gate = CorrelatorGate::new(correlator);
        let action = gate.decide(HostEvent { key_code: 13, direction: Direction::Down, at_millis: 110 });
        assert_eq!(action, TapAction::Drop);
    }

    #[test]
    fn gate_passes_down_with_no_hid_evidence() {
        let correlator = correlator();
        let gate = CorrelatorGate::new(correlator);
        let action = gate.decide(HostEvent { key_code: 99, direction: Direction::Down, at_millis: 0 });
        assert_eq!(action, TapAction::Pass);
    }

    #[test]
    fn mock_dry_open_reports_permission_denied_when_configured() {
        let tap = MockHostTap::failing_dry_open();
        assert!(matches!(tap.dry_open(), Err(EngineError::PermissionDenied(_))));
    }

    #[test]
    fn mock_run_replays_script_through_decide() {
        let tap = MockHostTap::new(vec![
            HostEvent { key_code: 1, direction: Direction::Down, at_millis: 0 },
            HostEvent { key_code: 1, direction: Direction::Up, at_millis: 10 },
        ]);
        let mut seen = Vec::new();
        tap.run(&mut |event| {
            seen.push(event);
            TapAction::Pass
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
    }
}

//! Correlator (component F): the only component that sees both the Device
//! Stream's HID-backed transitions and the Host Stream Tap's events, and the
//! only owner of `CorrelatorState`. Its two decision functions are O(1) and
//! must never block, since the host tap callback that calls them runs on the
//! system's event-dispatch thread.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Block/pass outcome of a decision function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Block,
    Pass,
}

/// `pressed`, `last_hid_down`, `last_hid_up` from the data model (§3),
/// behind the single mutex both D and E synchronize on.
#[derive(Debug, Default)]
struct Maps {
    pressed: std::collections::HashSet<i32>,
    last_hid_down: HashMap<i32, u64>,
    last_hid_up: HashMap<i32, u64>,
}

/// Owns `CorrelatorState` for one Session. `hold_ttl_millis` and
/// `initial_window_millis` are loaded from configuration (§4.F: "10s"/"80ms"
/// are the defaults, not hard-coded constants).
pub struct Correlator {
    maps: Mutex<Maps>,
    hold_ttl_millis: u64,
    initial_window_millis: u64,
    janitor_max_age_millis: u64,
    janitor_cap: usize,
}

impl Correlator {
    pub fn new(hold_ttl: Duration, initial_window: Duration, janitor_max_age: Duration, janitor_cap: usize) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            hold_ttl_millis: hold_ttl.as_millis() as u64,
            initial_window_millis: initial_window.as_millis() as u64,
            janitor_max_age_millis: janitor_max_age.as_millis() as u64,
            janitor_cap,
        }
    }

    /// Called by Device Stream (component D) on every emitted Keystroke
    /// (§4.D) to record when the target device itself last transitioned.
    /// Only the decision functions below mutate `pressed` — if D set it
    /// directly here, every host Down arriving within `HOLD_TTL` (10s)
    /// of a HID Down would block via the "already pressed" branch, which
    /// would wrongly swallow the `INITIAL_WINDOW` (80ms) boundary that
    /// tells a same-key-code host event from a *different* device apart.
    pub fn record_hid_down(&self, key_code: i32, at_millis: u64) {
        let mut maps = self.maps.lock().unwrap();
        maps.last_hid_down.insert(key_code, at_millis);
    }

    pub fn record_hid_up(&self, key_code: i32, at_millis: u64) {
        let mut maps = self.maps.lock().unwrap();
        maps.last_hid_up.insert(key_code, at_millis);
    }

    /// `should_block_down` from §4.F, driven by the Host Stream Tap.
    pub fn should_block_down(&self, key_code: i32, at_millis: u64) -> Decision {
        let mut maps = self.maps.lock().unwrap();

        if maps.pressed.contains(&key_code) {
            let last_down = maps.last_hid_down.get(&key_code).copied().unwrap_or(0);
            if at_millis.saturating_sub(last_down) > self.hold_ttl_millis {
                warn!("stale correlation entry for key {key_code}, passing through");
                maps.pressed.remove(&key_code);
                return Decision::Pass;
            }
            return Decision::Block;
        }

        if let Some(&last_down) = maps.last_hid_down.get(&key_code) {
            if at_millis.saturating_sub(last_down) <= self.initial_window_millis {
                maps.pressed.insert(key_code);
                return Decision::Block;
            }
        }

        Decision::Pass
    }

    /// `should_block_up` from §4.F.
    pub fn should_block_up(&self, key_code: i32) -> Decision {
        let mut maps = self.maps.lock().unwrap();
        if maps.pressed.remove(&key_code) {
            Decision::Block
        } else {
            Decision::Pass
        }
    }

    /// Prunes entries older than `janitor_max_age` and enforces the hard
    /// size cap, pruning the oldest entries first (§4.F).
    pub fn run_janitor(&self, now_millis: u64) {
        let mut maps = self.maps.lock().unwrap();

        maps.last_hid_down.retain(|_, &mut at| now_millis.saturating_sub(at) <= self.janitor_max_age_millis);
        maps.last_hid_up.retain(|_, &mut at| now_millis.saturating_sub(at) <= self.janitor_max_age_millis);

        prune_to_cap(&mut maps.last_hid_down, self.janitor_cap);
        prune_to_cap(&mut maps.last_hid_up, self.janitor_cap);
    }

    /// Size of `pressed`, for tests and for `SessionStatus`-adjacent
    /// diagnostics; never read on the hot decision path.
    pub fn pressed_len(&self) -> usize {
        self.maps.lock().unwrap().pressed.len()
    }
}

fn prune_to_cap(map: &mut HashMap<i32, u64>, cap: usize) {
    if map.len() <= cap {
        return;
    }
    let mut by_age: Vec<(i32, u64)> = map.iter().map(|(&k, &v)| (k, v)).collect();
    by_age.sort_by_key(|&(_, at)| at);
    let excess = map.len() - cap;
    for (key, _) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
}

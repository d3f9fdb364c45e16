//! Identity Detector (component B): infers which physical keyboard the user
//! is typing on by watching a brief window of raw HID presses, then matches
//! the observed device identities against an enumeration snapshot.

use std::collections::HashSet;

use kbd_proto::{Device, EngineError, Selection};

use crate::codes::is_rollover;
use crate::device::{device_key, physical_id};

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::IoHidIdentitySource;

/// One observed press, as read straight off a HID value callback — before
/// any usage-page or key-code mapping is applied. Only the identity of the
/// reporting device matters here.
#[derive(Debug, Clone, Copy)]
pub struct ObservedPress {
    pub vendor_id: u32,
    pub product_id: u32,
    pub location_id: u32,
    pub usage: u32,
    pub is_down: bool,
}

/// Read-only platform seam for component B: a short-lived listener across
/// every matched keyboard/keypad handle, independent of any `Session`.
pub trait IdentitySource: Send + Sync {
    /// Runs until `stop` returns `true` for the accumulated observed
    /// `device_key`s, invoking `on_press` for every HID value report seen in
    /// the meantime (including releases and rollover — filtering is the
    /// caller's job, matching Device Stream's own contract in §4.D).
    fn listen(
        &self,
        on_press: &mut dyn FnMut(ObservedPress),
        stop: &mut dyn FnMut(&HashSet<String>) -> bool,
    ) -> Result<(), EngineError>;
}

/// Accumulates observed `device_key`s from a sequence of raw HID presses,
/// exactly as an `IdentitySource` impl is expected to drive it.
#[derive(Debug, Default)]
pub struct Accumulator {
    observed: HashSet<String>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observed press. Releases and the rollover sentinel are
    /// ignored, matching §4.B ("ignoring releases and the all-FFFFFFFF
    /// rollover sentinel").
    pub fn observe(&mut self, press: ObservedPress) {
        if !press.is_down || is_rollover(press.usage) {
            return;
        }
        self.observed.insert(device_key(press.vendor_id, press.product_id, press.location_id));
    }

    pub fn observed_keys(&self) -> &HashSet<String> {
        &self.observed
    }
}

/// Stop predicate: halt once at least `n` distinct device keys have
/// produced a press. One of the two typical predicates named in §4.B; the
/// other ("operator stop") is a caller-supplied closure ignoring its input
/// entirely, e.g. `|_| operator_requested_stop.load(Ordering::Relaxed)`.
pub fn at_least_n_devices(n: usize) -> impl FnMut(&HashSet<String>) -> bool {
    move |observed: &HashSet<String>| observed.len() >= n
}

/// Runs `source` to accumulate observed device keys, then resolves them
/// against `available` per §4.B's two-pass match.
pub fn detect(
    source: &dyn IdentitySource,
    available: &[Device],
    mut stop_predicate: impl FnMut(&HashSet<String>) -> bool,
) -> Result<Selection, EngineError> {
    let mut accumulator = Accumulator::new();
    source.listen(
        &mut |press| accumulator.observe(press),
        &mut |observed| stop_predicate(observed),
    )?;
    resolve(accumulator.observed_keys(), available)
}

/// The two-pass match from §4.B, factored out so it is independently
/// testable against a fixed `observed` set without a real or mock listener.
pub fn resolve(observed: &HashSet<String>, available: &[Device]) -> Result<Selection, EngineError> {
    let mut matched_physical_ids = HashSet::new();

    for key in observed {
        if let Some(device) = available.iter().find(|d| &d.device_key == key) {
            matched_physical_ids.insert(device.physical_id.clone());
            continue;
        }
        // No exact `device_key` match: derive the physical_id an observed
        // key *would* have had, and match against the enumeration by that
        // instead (recovers all interfaces from evidence on only one).
        if let Some(derived) = derive_physical_id(key) {
            if available.iter().any(|d| d.physical_id == derived) {
                matched_physical_ids.insert(derived);
            }
        }
    }

    if matched_physical_ids.is_empty() {
        return Err(EngineError::NoMatch);
    }

    let mut devices: Vec<Device> = available
        .iter()
        .filter(|d| matched_physical_ids.contains(&d.physical_id))
        .cloned()
        .collect();

    // Dedup so no two Devices with both `physical_id` and `transport` equal
    // appear twice; different transports of the same physical_id stay.
    let mut seen = HashSet::new();
    devices.retain(|d| seen.insert((d.physical_id.clone(), d.transport)));

    Ok(Selection { devices })
}

/// Recovers `physical_id` from a `device_key` string (`vendor:product:location`
/// in lowercase hex) without re-deriving it from raw integers.
fn derive_physical_id(observed_key: &str) -> Option<String> {
    let mut parts = observed_key.split(':');
    let vendor_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let location_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some(physical_id(vendor_id, product_id, location_id))
}

/// In-memory `IdentitySource` driven by a fixed script of presses, for
/// tests and for `--mock` runs off-macOS.
pub struct MockIdentitySource {
    script: Vec<ObservedPress>,
}

impl MockIdentitySource {
    pub fn new(script: Vec<ObservedPress>) -> Self {
        Self { script }
    }
}

impl IdentitySource for MockIdentitySource {
    fn listen(
        &self,
        on_press: &mut dyn FnMut(ObservedPress),
        stop: &mut dyn FnMut(&HashSet<String>) -> bool,
    ) -> Result<(), EngineError> {
        let mut observed = HashSet::new();
        for press in &self.script {
            on_press(*press);
            if press.is_down && !is_rollover(press.usage) {
                observed.insert(device_key(press.vendor_id, press.product_id, press.location_id));
            }
            if stop(&observed) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbd_proto::Transport;

    fn device(vendor: u32, product: u32, location: u32, transport: Transport) -> Device {
        Device {
            device_key: device_key(vendor, product, location),
            physical_id: physical_id(vendor, product, location),
            name: "Test Keyboard".into(),
            manufacturer: "Test".into(),
            transport,
            vendor_id: vendor,
            product_id: product,
        }
    }

    #[test]
    fn exact_device_key_match_wins_first() {
        let usb = device(0x05ac, 0x0250, 0x1410_0001, Transport::Usb);
        let available = vec![usb.clone()];
        let mut observed = HashSet::new();
        observed.insert(usb.device_key.clone());

        let selection = resolve(&observed, &available).unwrap();
        assert_eq!(selection.devices, vec![usb]);
    }

    #[test]
    fn physical_id_fallback_recovers_all_interfaces() {
        let usb = device(0x05ac, 0x0250, 0x1410_0001, Transport::Usb);
        let bt = device(0x05ac, 0x0250, 0x1410_00ff, Transport::Bluetooth);
        let available = vec![usb.clone(), bt.clone()];

        // Evidence only on the USB interface's device_key, which differs
        // from `usb.device_key` (stale enumeration) but shares physical_id.
        let mut observed = HashSet::new();
        observed.insert(device_key(0x05ac, 0x0250, 0x1410_0002));

        let selection = resolve(&observed, &available).unwrap();
        let mut keys: Vec<_> = selection.device_keys().into_iter().collect();
        keys.sort();
        let mut expected = vec![usb.device_key, bt.device_key];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn no_match_when_observed_keys_are_unresolvable() {
        let available = vec![device(0x05ac, 0x0250, 0x1410_0001, Transport::Usb)];
        let mut observed = HashSet::new();
        observed.insert(device_key(0x046d, 0xc33a, 0x1410_0001));

        assert_eq!(resolve(&observed, &available), Err(EngineError::NoMatch));
    }

    #[test]
    fn dedup_keeps_distinct_transports_of_same_physical_id() {
        let usb = device(0x05ac, 0x0250, 0x1410_0001, Transport::Usb);
        let bt = device(0x05ac, 0x0250, 0x1410_00ff, Transport::Bluetooth);
        let available = vec![usb.clone(), bt.clone()];
        let mut observed = HashSet::new();
        observed.insert(usb.device_key.clone());
        observed.insert(bt.device_key.clone());

        let selection = resolve(&observed, &available).unwrap();
        assert_eq!(selection.devices.len(), 2);
    }

    #[test]
    fn accumulator_ignores_releases_and_rollover() {
        let mut acc = Accumulator::new();
        acc.observe(ObservedPress {
            vendor_id: 0x05ac,
            product_id: 0x0250,
            location_id: 0x1410_0001,
            usage: 0x1A,
            is_down: false,
        });
        acc.observe(ObservedPress {
            vendor_id: 0x05ac,
            product_id: 0x0250,
            location_id: 0x1410_0001,
            usage: crate::codes::ROLLOVER_SENTINEL,
            is_down: true,
        });
        assert!(acc.observed_keys().is_empty());
    }

    #[test]
    fn detect_drives_mock_source_to_a_selection() {
        let usb = device(0x05ac, 0x0250, 0x1410_0001, Transport::Usb);
        let available = vec![usb.clone()];
        let source = MockIdentitySource::new(vec![
            ObservedPress {
                vendor_id: 0x05ac,
                product_id: 0x0250,
                location_id: 0x1410_0001,
                usage: 0x1A,
                is_down: true,
            },
            ObservedPress {
                vendor_id: 0x05ac,
                product_id: 0x0250,
                location_id: 0x1410_0001,
                usage: 0x1A,
                is_down: false,
            },
        ]);

        let selection = detect(&source, &available, at_least_n_devices(1)).unwrap();
        assert_eq!(selection.devices, vec![usb]);
    }

    #[test]
    fn at_least_n_devices_predicate_fires_at_threshold() {
        let mut predicate = at_least_n_devices(2);
        let mut observed = HashSet::new();
        observed.insert("a".to_owned());
        assert!(!predicate(&observed));
        observed.insert("b".to_owned());
        assert!(predicate(&observed));
    }
}

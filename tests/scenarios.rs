//! End-to-end scenarios, wiring the mock HID/tap backends and a real
//! `Correlator`/`DeviceStream`/`GuestForwarder`/`Session`/`Engine` together
//! for Selection = `{external keyboard A}`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbd_interposer::correlator::Correlator;
use kbd_interposer::device::{MockBackend, device_key, physical_id};
use kbd_interposer::engine::{Engine, Platform};
use kbd_interposer::guest::{ControllerOutcome, GuestController};
use kbd_interposer::host_tap::{CorrelatorGate, MockHostTap, TapAction};
use kbd_interposer::identity::{self, MockIdentitySource, ObservedPress};
use kbd_interposer::stream::{DeviceStream, MockHidSource, RawValue};
use kbd_config::Config;
use kbd_proto::{
    Device, Direction, GuestId, HostEvent, RelayDirection, SessionMode, Transport,
};

const USAGE_PAGE_KEYBOARD: u32 = 0x07;
const HID_W: u32 = 0x1A;
const HID_D: u32 = 0x07;
const HID_SPACE: u32 = 0x2C;

fn correlator() -> Arc<Correlator> {
    Arc::new(Correlator::new(
        Duration::from_secs(10),
        Duration::from_millis(80),
        Duration::from_secs(30),
        50,
    ))
}

fn raw(usage: u32, down: bool) -> RawValue {
    RawValue {
        usage_page: USAGE_PAGE_KEYBOARD,
        usage,
        integer_value: if down { 1 } else { 0 },
        reporting_device_key: "a".into(),
    }
}

fn selection_keys() -> HashSet<String> {
    let mut s = HashSet::new();
    s.insert("a".to_owned());
    s
}

#[test]
fn scenario_1_basic_tap_through() {
    let guest = GuestId("vm-x".into());
    let correlator = correlator();
    let stream = DeviceStream::new(selection_keys(), Arc::clone(&correlator));
    let gate = CorrelatorGate::new(Arc::clone(&correlator));

    // HID Down(W) at t=100, host Down(W) 20ms later: within INITIAL_WINDOW.
    let down = stream.process(raw(HID_W, true), 100, Some(&guest)).unwrap();
    let intent = down.relay_intent.unwrap();
    assert_eq!(intent.scan_code, 17);
    assert_eq!(intent.direction, RelayDirection::Press);

    assert_eq!(
        gate.decide(HostEvent { key_code: 13, direction: Direction::Down, at_millis: 120 }),
        TapAction::Drop
    );

    // HID Up(W), then host Up(W): both blocked.
    let up = stream.process(raw(HID_W, false), 300, Some(&guest)).unwrap();
    assert_eq!(up.relay_intent.unwrap().direction, RelayDirection::Release);
    assert_eq!(
        gate.decide(HostEvent { key_code: 13, direction: Direction::Up, at_millis: 320 }),
        TapAction::Drop
    );

    assert_eq!(correlator.pressed_len(), 0);
}

#[test]
fn scenario_2_held_key_host_auto_repeat() {
    let guest = GuestId("vm-x".into());
    let correlator = correlator();
    let stream = DeviceStream::new(selection_keys(), Arc::clone(&correlator));
    let gate = CorrelatorGate::new(Arc::clone(&correlator));

    let down = stream.process(raw(HID_D, true), 0, Some(&guest)).unwrap();
    let press_intent = down.relay_intent.unwrap();
    assert_eq!(press_intent.scan_code, 32);
    assert_eq!(press_intent.direction, RelayDirection::Press);

    // Ten host auto-repeats, all blocked; D emits nothing further (held, no
    // new HID transition), so exactly one press intent total.
    for t in (10..2_000).step_by(200).take(10) {
        assert_eq!(
            gate.decide(HostEvent { key_code: 2, direction: Direction::Down, at_millis: t as u64 }),
            TapAction::Drop
        );
    }

    let up = stream.process(raw(HID_D, false), 2_000, Some(&guest)).unwrap();
    assert_eq!(up.relay_intent.unwrap().direction, RelayDirection::Release);
    assert_eq!(
        gate.decide(HostEvent { key_code: 2, direction: Direction::Up, at_millis: 2_010 }),
        TapAction::Drop
    );

    assert_eq!(correlator.pressed_len(), 0);
}

#[test]
fn scenario_3_built_in_keyboard_passes_through() {
    // No HID event ever arrives from the selected external keyboard A.
    let correlator = correlator();
    let gate = CorrelatorGate::new(Arc::clone(&correlator));

    let action = gate.decide(HostEvent { key_code: 12, direction: Direction::Down, at_millis: 500 });
    assert_eq!(action, TapAction::Pass);
    assert_eq!(correlator.pressed_len(), 0);
}

#[test]
fn scenario_4_stale_held_key_cleanup() {
    let guest = GuestId("vm-x".into());
    let correlator = correlator();
    let stream = DeviceStream::new(selection_keys(), Arc::clone(&correlator));
    let gate = CorrelatorGate::new(Arc::clone(&correlator));

    stream.process(raw(HID_SPACE, true), 0, Some(&guest)).unwrap();
    assert_eq!(
        gate.decide(HostEvent { key_code: 49, direction: Direction::Down, at_millis: 5 }),
        TapAction::Drop
    );
    assert_eq!(correlator.pressed_len(), 1);

    // No HID Up ever arrives; 11s later, a host auto-repeat shows up past
    // HOLD_TTL. The stale entry heals: pass through, `pressed` drained.
    assert_eq!(
        gate.decide(HostEvent { key_code: 49, direction: Direction::Down, at_millis: 11_000 }),
        TapAction::Pass
    );
    assert_eq!(correlator.pressed_len(), 0);
}

#[test]
fn scenario_5_identity_detection_with_two_interfaces() {
    let dev1 = Device {
        device_key: device_key(0x05ac, 0x0250, 0x1410_0001),
        physical_id: physical_id(0x05ac, 0x0250, 0x1410_0001),
        name: "Keyboard A (USB)".into(),
        manufacturer: "Test".into(),
        transport: Transport::Usb,
        vendor_id: 0x05ac,
        product_id: 0x0250,
    };
    let dev2 = Device {
        device_key: device_key(0x05ac, 0x0250, 0x1410_00ff),
        physical_id: physical_id(0x05ac, 0x0250, 0x1410_00ff),
        name: "Keyboard A (Bluetooth)".into(),
        manufacturer: "Test".into(),
        transport: Transport::Bluetooth,
        vendor_id: 0x05ac,
        product_id: 0x0250,
    };
    let dev3 = Device {
        device_key: device_key(0x046d, 0xc33a, 0x2000_0001),
        physical_id: physical_id(0x046d, 0xc33a, 0x2000_0001),
        name: "Keyboard B".into(),
        manufacturer: "Test".into(),
        transport: Transport::Usb,
        vendor_id: 0x046d,
        product_id: 0xc33a,
    };
    assert_eq!(dev1.physical_id, dev2.physical_id);
    assert_ne!(dev1.physical_id, dev3.physical_id);

    let available = vec![dev1.clone(), dev2.clone(), dev3.clone()];

    // Three presses observed only via Dev1's handle.
    let press = ObservedPress {
        vendor_id: 0x05ac,
        product_id: 0x0250,
        location_id: 0x1410_0001,
        usage: HID_W,
        is_down: true,
    };
    let source = MockIdentitySource::new(vec![press, press, press]);

    let selection = identity::detect(&source, &available, identity::at_least_n_devices(1)).unwrap();
    let mut keys: Vec<_> = selection.device_keys().into_iter().collect();
    keys.sort();
    let mut expected = vec![dev1.device_key, dev2.device_key];
    expected.sort();
    assert_eq!(keys, expected);
}

struct RecordingController {
    calls: Mutex<Vec<(String, i32, RelayDirection)>>,
}

impl RecordingController {
    fn new() -> Self {
        Self { calls: Mutex::new(Vec::new()) }
    }
}

impl GuestController for RecordingController {
    fn send_key_event(
        &self,
        target: &GuestId,
        scan_code: i32,
        direction: RelayDirection,
    ) -> std::io::Result<ControllerOutcome> {
        self.calls.lock().unwrap().push((target.0.clone(), scan_code, direction));
        Ok(ControllerOutcome { success: true, stdout: String::new(), stderr: String::new() })
    }

    fn list_guests(&self) -> std::io::Result<ControllerOutcome> {
        Ok(ControllerOutcome { success: true, stdout: "UUID STATUS NAME\n".into(), stderr: String::new() })
    }
}

#[test]
fn scenario_6_safety_timer_stops_session_regardless_of_activity() {
    let config = Config::default();
    let controller = Arc::new(RecordingController::new());
    let platform = Platform {
        device_backend: Arc::new(MockBackend::new(Vec::new())),
        identity_source: Arc::new(MockIdentitySource::new(Vec::new())),
        hid_source_factory: Arc::new(|| {
            Arc::new(MockHidSource::new(Vec::new())) as Arc<dyn kbd_interposer::stream::HidSource>
        }),
        host_tap_factory: Arc::new(|| {
            Arc::new(MockHostTap::new(Vec::new())) as Arc<dyn kbd_interposer::host_tap::HostTap>
        }),
        guest_controller: controller,
    };
    let engine = Engine::new(config, platform);

    let selection = kbd_proto::Selection {
        devices: vec![Device {
            device_key: "05ac:0250:00000001".into(),
            physical_id: "05ac-0250-0".into(),
            name: "Test".into(),
            manufacturer: "Test".into(),
            transport: Transport::Usb,
            vendor_id: 0x05ac,
            product_id: 0x0250,
        }],
    };

    let id = engine
        .start_session(selection, SessionMode::CaptureOnly, Some(Duration::from_millis(50)))
        .unwrap();
    assert!(engine.session_status(id).unwrap().active);

    std::thread::sleep(Duration::from_millis(120));
    engine.sweep_deadlines();

    // The supervisor transitioned to Draining and the session was removed;
    // the engine now reports it as gone rather than still active.
    assert!(engine.session_status(id).is_err());
}

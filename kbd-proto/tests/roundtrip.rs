use kbd_proto::{
    Device, EngineError, GuestId, Request, Response, Selection, SessionMode, Transport,
};

fn sample_device(suffix: &str) -> Device {
    Device {
        device_key: format!("05ac:0250:{suffix}"),
        physical_id: "05ac-0250-0".into(),
        name: "Sample Keyboard".into(),
        manufacturer: "Sample Inc".into(),
        transport: Transport::Usb,
        vendor_id: 0x05ac,
        product_id: 0x0250,
    }
}

#[test]
fn request_round_trips_through_json() {
    let req = Request::StartSession {
        selection: Selection { devices: vec![sample_device("00000001")] },
        mode: SessionMode::Relay(GuestId("vm-x".into())),
        duration: Some(std::time::Duration::from_secs(5)),
    };
    let json = serde_json::to_string(&req).unwrap();
    let back: Request = serde_json::from_str(&json).unwrap();
    match back {
        Request::StartSession { selection, mode, duration } => {
            assert_eq!(selection.devices.len(), 1);
            assert_eq!(mode, SessionMode::Relay(GuestId("vm-x".into())));
            assert_eq!(duration, Some(std::time::Duration::from_secs(5)));
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn response_round_trips_through_json() {
    let resp = Response::Devices(vec![sample_device("00000001"), sample_device("00000002")]);
    let json = serde_json::to_string(&resp).unwrap();
    let back: Response = serde_json::from_str(&json).unwrap();
    match back {
        Response::Devices(devices) => assert_eq!(devices.len(), 2),
        _ => panic!("wrong variant"),
    }
}

#[test]
fn engine_error_displays_human_readable() {
    let err = EngineError::GuestInvocationFailed {
        scan_code: 17,
        guest: GuestId("vm-x".into()),
        stderr: "no such guest".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("17"));
    assert!(msg.contains("vm-x"));
}

#[test]
fn selection_device_keys_collapses_to_a_set() {
    let selection = Selection {
        devices: vec![sample_device("00000001"), sample_device("00000001")],
    };
    assert_eq!(selection.device_keys().len(), 1);
}

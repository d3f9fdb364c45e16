//! Device Enumerator (component A): queries the platform HID registry and
//! builds immutable `Device` records, grouped by physical identity.

use kbd_proto::{Device, Transport};

#[cfg(target_os = "macos")]
mod macos;
mod mock;

#[cfg(target_os = "macos")]
pub use macos::IoHidBackend;
pub use mock::MockBackend;

/// Apple's USB vendor ID. A `location_id` of zero (or a transport the
/// platform itself reports as internal) only means "built-in" for devices
/// carrying this vendor ID (§3 invariant) — it is not a generic rule for
/// every vendor's internal peripherals.
pub const APPLE_VENDOR_ID: u32 = 0x05AC;

/// Platform seam for component A, mirroring the trait-per-backend pattern
/// the teacher compositor uses to abstract over input backends
/// (`input::backend_ext::NiriInputBackend`).
pub trait DeviceBackend: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Device>, kbd_proto::EngineError>;
}

/// Raw device properties as read from the HID registry, before the
/// `device_key`/`physical_id` derivation is applied.
#[derive(Debug, Clone)]
pub struct RawDevice {
    pub vendor_id: u32,
    pub product_id: u32,
    pub location_id: u32,
    pub name: String,
    pub manufacturer: String,
    /// `true` when the platform itself reports this handle as an internal
    /// ("built-in"/SPI) device, independent of `location_id`.
    pub reported_built_in: bool,
}

/// `vendor:product:location`, lowercase hex, 4/4/8 digits wide.
pub fn device_key(vendor_id: u32, product_id: u32, location_id: u32) -> String {
    format!("{vendor_id:04x}:{product_id:04x}:{location_id:08x}")
}

/// `vendor-product-(location>>8)`: collapses the wired and wireless
/// interfaces of one physical keyboard into a single identity, while still
/// telling apart a built-in keyboard (`location_id == 0`) from an external
/// keyboard of the same vendor/product (§3 boundary case).
pub fn physical_id(vendor_id: u32, product_id: u32, location_id: u32) -> String {
    format!("{vendor_id:04x}-{product_id:04x}-{:x}", location_id >> 8)
}

/// Transport classification. A zero `location_id` or a platform-reported
/// internal transport on an Apple-vendor device maps to `BuiltIn` — the
/// *only* way the engine tells a built-in keyboard apart from an external
/// one from the same vendor (§3 invariant).
pub fn classify_transport(raw: &RawDevice, is_bluetooth: bool) -> Transport {
    if raw.reported_built_in || (raw.vendor_id == APPLE_VENDOR_ID && raw.location_id == 0) {
        Transport::BuiltIn
    } else if is_bluetooth {
        Transport::Bluetooth
    } else if raw.location_id != 0 {
        Transport::Usb
    } else {
        Transport::Unknown
    }
}

pub fn to_device(raw: RawDevice, is_bluetooth: bool) -> Device {
    let transport = classify_transport(&raw, is_bluetooth);
    Device {
        device_key: device_key(raw.vendor_id, raw.product_id, raw.location_id),
        physical_id: physical_id(raw.vendor_id, raw.product_id, raw.location_id),
        name: raw.name,
        manufacturer: raw.manufacturer,
        transport,
        vendor_id: raw.vendor_id,
        product_id: raw.product_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(vendor: u32, product: u32, location: u32) -> RawDevice {
        RawDevice {
            vendor_id: vendor,
            product_id: product,
            location_id: location,
            name: "Test Keyboard".into(),
            manufacturer: "Test".into(),
            reported_built_in: false,
        }
    }

    #[test]
    fn device_key_is_lowercase_hex_fixed_width() {
        assert_eq!(device_key(0x5ac, 0x250, 0x14100000), "05ac:0250:14100000");
    }

    #[test]
    fn physical_id_collapses_location_low_byte() {
        // Two interfaces of one physical keyboard, differing only in the
        // low byte of location (USB port vs. BT pairing slot encoding).
        let usb = physical_id(0x5ac, 0x250, 0x1410_0001);
        let bt = physical_id(0x5ac, 0x250, 0x1410_00ff);
        assert_eq!(usb, bt);
    }

    #[test]
    fn zero_location_never_merges_with_nonzero_same_vendor_product() {
        let builtin = physical_id(0x5ac, 0x250, 0);
        let external = physical_id(0x5ac, 0x250, 0x0001_0000);
        assert_ne!(builtin, external, "location 0 must yield a distinct physical_id");
    }

    #[test]
    fn apple_vendor_zero_location_is_built_in() {
        let device = to_device(raw(APPLE_VENDOR_ID, 0x0250, 0), false);
        assert_eq!(device.transport, Transport::BuiltIn);
    }

    #[test]
    fn non_apple_vendor_zero_location_is_not_built_in() {
        let device = to_device(raw(0x046d, 0xc33a, 0), false);
        assert_ne!(device.transport, Transport::BuiltIn);
    }

    #[test]
    fn nonzero_location_external_usb_is_usb_transport() {
        let device = to_device(raw(0x046d, 0xc33a, 0x1410_0001), false);
        assert_eq!(device.transport, Transport::Usb);
    }

    #[test]
    fn bluetooth_interface_is_classified_as_bluetooth() {
        let device = to_device(raw(0x046d, 0xc33a, 0x1410_0002), true);
        assert_eq!(device.transport, Transport::Bluetooth);
    }
}

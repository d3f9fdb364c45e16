//! IOKit HID registry backend for the Device Enumerator (component A).
//!
//! Opens the system-wide `IOHIDManager`, matches the generic-desktop
//! keyboard and keypad usage pages, and reads vendor/product/location/
//! transport/name/manufacturer off each matched device. The FFI shape here
//! (opaque `#[repr(C)]` ref types, `extern "C"` blocks linked against the
//! `IOKit` framework, `core-foundation` for the CF side) follows the same
//! pattern used for IOKit HID access elsewhere in the keyboard-tooling
//! ecosystem.

use std::ffi::c_void;
use std::ptr;

use core_foundation::array::{CFArray, CFArrayRef};
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::{CFDictionary, CFMutableDictionary};
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;

use kbd_proto::{Device, EngineError};

use super::{to_device, DeviceBackend, RawDevice};

const K_HID_PAGE_GENERIC_DESKTOP: i64 = 0x01;
const K_HID_USAGE_GD_KEYBOARD: i64 = 0x06;
const K_HID_USAGE_GD_KEYPAD: i64 = 0x07;

const K_IOHID_OPTIONS_TYPE_NONE: u32 = 0;

#[repr(C)]
struct OpaqueIoHidManager {
    _data: [u8; 0],
    _marker: std::marker::PhantomData<(*mut u8, std::marker::PhantomPinned)>,
}
type IoHidManagerRef = *mut OpaqueIoHidManager;

#[repr(C)]
struct OpaqueIoHidDevice {
    _data: [u8; 0],
    _marker: std::marker::PhantomData<(*mut u8, std::marker::PhantomPinned)>,
}
type IoHidDeviceRef = *mut OpaqueIoHidDevice;

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOHIDManagerCreate(allocator: *const c_void, options: u32) -> IoHidManagerRef;
    fn IOHIDManagerSetDeviceMatchingMultiple(manager: IoHidManagerRef, matching: CFArrayRef);
    fn IOHIDManagerOpen(manager: IoHidManagerRef, options: u32) -> i32;
    fn IOHIDManagerClose(manager: IoHidManagerRef, options: u32) -> i32;
    fn IOHIDManagerCopyDevices(manager: IoHidManagerRef) -> *const c_void; // CFSetRef
    fn IOHIDDeviceGetProperty(device: IoHidDeviceRef, key: core_foundation::string::CFStringRef) -> *const c_void;
    fn CFSetGetCount(set: *const c_void) -> isize;
    fn CFSetGetValues(set: *const c_void, values: *mut *const c_void);
    fn CFRelease(cf: *const c_void);
}

struct ManagerGuard(IoHidManagerRef);

impl Drop for ManagerGuard {
    fn drop(&mut self) {
        // SAFETY: `self.0` was created by `IOHIDManagerCreate` and is
        // closed at most once, from the thread that owns this guard.
        unsafe {
            IOHIDManagerClose(self.0, K_IOHID_OPTIONS_TYPE_NONE);
        }
    }
}

fn matching_dict(usage_page: i64, usage: i64) -> CFDictionary<CFString, CFType> {
    let mut dict = CFMutableDictionary::new();
    dict.set(CFString::new("DeviceUsagePage"), CFNumber::from(usage_page).as_CFType());
    dict.set(CFString::new("DeviceUsage"), CFNumber::from(usage).as_CFType());
    dict.to_immutable()
}

fn string_property(device: IoHidDeviceRef, key: &str) -> Option<String> {
    let cf_key = CFString::new(key);
    // SAFETY: `device` is a live device handle from `IOHIDManagerCopyDevices`
    // for the duration of this call.
    let value = unsafe { IOHIDDeviceGetProperty(device, cf_key.as_concrete_TypeRef()) };
    if value.is_null() {
        return None;
    }
    // SAFETY: IOKit returns a `+0` (get-rule) reference; the property dict
    // backing `device` keeps it alive for at least as long as `device` does.
    let cf_type = unsafe { CFType::wrap_under_get_rule(value as *const _) };
    cf_type.downcast::<CFString>().map(|s| s.to_string())
}

fn int_property(device: IoHidDeviceRef, key: &str) -> Option<i64> {
    let cf_key = CFString::new(key);
    let value = unsafe { IOHIDDeviceGetProperty(device, cf_key.as_concrete_TypeRef()) };
    if value.is_null() {
        return None;
    }
    let cf_type = unsafe { CFType::wrap_under_get_rule(value as *const _) };
    cf_type.downcast::<CFNumber>().and_then(|n| n.to_i64())
}

/// IOKit-backed implementation of [`DeviceBackend`].
pub struct IoHidBackend;

impl IoHidBackend {
    pub fn new() -> Self {
        IoHidBackend
    }

    fn read_device(device: IoHidDeviceRef) -> Option<RawDevice> {
        let vendor_id = int_property(device, "VendorID")? as u32;
        let product_id = int_property(device, "ProductID")? as u32;
        let location_id = int_property(device, "LocationID").unwrap_or(0) as u32;
        let name = string_property(device, "Product").unwrap_or_else(|| "Unknown Keyboard".into());
        let manufacturer = string_property(device, "Manufacturer").unwrap_or_default();
        let transport = string_property(device, "Transport").unwrap_or_default();
        let reported_built_in =
            transport.eq_ignore_ascii_case("spi") || transport.eq_ignore_ascii_case("built-in");

        Some(RawDevice { vendor_id, product_id, location_id, name, manufacturer, reported_built_in })
    }
}

impl Default for IoHidBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for IoHidBackend {
    fn enumerate(&self) -> Result<Vec<Device>, EngineError> {
        // SAFETY: `IOHIDManagerCreate` with the default allocator and no
        // options always returns a valid (possibly empty) manager.
        let manager = unsafe { IOHIDManagerCreate(ptr::null(), K_IOHID_OPTIONS_TYPE_NONE) };
        if manager.is_null() {
            return Err(EngineError::SubsystemUnavailable("IOHIDManagerCreate failed".into()));
        }
        let guard = ManagerGuard(manager);

        let keyboard = matching_dict(K_HID_PAGE_GENERIC_DESKTOP, K_HID_USAGE_GD_KEYBOARD);
        let keypad = matching_dict(K_HID_PAGE_GENERIC_DESKTOP, K_HID_USAGE_GD_KEYPAD);
        let matching = CFArray::from_CFTypes(&[keyboard.as_CFType(), keypad.as_CFType()]);

        unsafe {
            IOHIDManagerSetDeviceMatchingMultiple(guard.0, matching.as_concrete_TypeRef());
        }

        let open_result = unsafe { IOHIDManagerOpen(guard.0, K_IOHID_OPTIONS_TYPE_NONE) };
        if open_result != 0 {
            return Err(EngineError::PermissionDenied(
                "failed to open IOHIDManager, input-monitoring permission may be required".into(),
            ));
        }

        // `IOHIDManagerCopyDevices` returns a `+1` CFSetRef we own and must release.
        let devices_set = unsafe { IOHIDManagerCopyDevices(guard.0) };
        if devices_set.is_null() {
            return Ok(Vec::new());
        }

        let count = unsafe { CFSetGetCount(devices_set) };
        let mut raw_refs: Vec<*const c_void> = vec![ptr::null(); count.max(0) as usize];
        if count > 0 {
            unsafe { CFSetGetValues(devices_set, raw_refs.as_mut_ptr()) };
        }

        let mut out = Vec::new();
        for raw_ref in raw_refs {
            let device = raw_ref as IoHidDeviceRef;
            if let Some(raw) = Self::read_device(device) {
                let is_bluetooth = string_property(device, "Transport")
                    .map(|t| t.eq_ignore_ascii_case("bluetooth"))
                    .unwrap_or(false);
                out.push(to_device(raw, is_bluetooth));
            }
        }

        unsafe { CFRelease(devices_set) };

        Ok(out)
    }
}

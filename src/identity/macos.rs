//! macOS `IdentitySource`: registers an input-value callback across every
//! keyboard/keypad `IOHIDManager` match (not scoped to a Session's
//! Selection — component B runs before a Selection exists) and stops its
//! own run loop once the caller-supplied predicate is satisfied.

use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;

use core_foundation::base::TCFType;
use core_foundation::dictionary::{CFDictionary, CFMutableDictionary};
use core_foundation::number::CFNumber;
use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopRef};
use core_foundation::string::{CFString, CFStringRef};

use kbd_proto::EngineError;

use super::{IdentitySource, ObservedPress};
use crate::codes::is_rollover;
use crate::device::device_key;

const K_HID_PAGE_GENERIC_DESKTOP: i64 = 0x01;
const K_HID_USAGE_GD_KEYBOARD: i64 = 0x06;
const K_HID_USAGE_GD_KEYPAD: i64 = 0x07;
const K_IOHID_OPTIONS_TYPE_NONE: u32 = 0;
const USAGE_PAGE_KEYBOARD: u32 = 0x07;

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

#[repr(C)]
struct OpaqueIoHidElement {
    _data: [u8; 0],
    _marker: std::marker::PhantomData<(*mut u8, std::marker::PhantomPinned)>,
}
type IoHidElementRef = *mut OpaqueIoHidElement;

#[repr(C)]
struct OpaqueIoHidValue {
    _data: [u8; 0],
    _marker: std::marker::PhantomData<(*mut u8, std::marker::PhantomPinned)>,
}
type IoHidValueRef = *mut OpaqueIoHidValue;

type IoHidValueCallback = extern "C" fn(context: *mut c_void, result: i32, sender: *mut c_void, value: IoHidValueRef);

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOHIDManagerCreate(allocator: *const c_void, options: u32) -> IoHidManagerRef;
    fn IOHIDManagerSetDeviceMatchingMultiple(manager: IoHidManagerRef, matching: core_foundation::array::CFArrayRef);
    fn IOHIDManagerOpen(manager: IoHidManagerRef, options: u32) -> i32;
    fn IOHIDManagerClose(manager: IoHidManagerRef, options: u32) -> i32;
    fn IOHIDManagerRegisterInputValueCallback(
        manager: IoHidManagerRef,
        callback: IoHidValueCallback,
        context: *mut c_void,
    );
    fn IOHIDManagerScheduleWithRunLoop(manager: IoHidManagerRef, run_loop: CFRunLoopRef, mode: CFStringRef);
    fn IOHIDManagerUnscheduleFromRunLoop(manager: IoHidManagerRef, run_loop: CFRunLoopRef, mode: CFStringRef);
    fn IOHIDDeviceGetProperty(device: IoHidDeviceRef, key: CFStringRef) -> *const c_void;

    fn IOHIDValueGetElement(value: IoHidValueRef) -> IoHidElementRef;
    fn IOHIDValueGetIntegerValue(value: IoHidValueRef) -> i64;
    fn IOHIDElementGetUsagePage(element: IoHidElementRef) -> u32;
    fn IOHIDElementGetUsage(element: IoHidElementRef) -> u32;
    fn IOHIDElementGetDevice(element: IoHidElementRef) -> IoHidDeviceRef;
}

fn matching_dict(usage_page: i64, usage: i64) -> CFDictionary<CFString, core_foundation::base::CFType> {
    let mut dict = CFMutableDictionary::new();
    dict.set(CFString::new("DeviceUsagePage"), CFNumber::from(usage_page).as_CFType());
    dict.set(CFString::new("DeviceUsage"), CFNumber::from(usage).as_CFType());
    dict.to_immutable()
}

fn int_property(device: IoHidDeviceRef, key: &str) -> Option<i64> {
    let cf_key = CFString::new(key);
    let value = unsafe { IOHIDDeviceGetProperty(device, cf_key.as_concrete_TypeRef()) };
    if value.is_null() {
        return None;
    }
    let cf_type = unsafe { core_foundation::base::CFType::wrap_under_get_rule(value as *const _) };
    cf_type.downcast::<CFNumber>().and_then(|n| n.to_i64())
}

/// Context handed to the C callback; none of its borrows escape `listen`'s
/// call frame, so the raw pointer is valid for the manager's whole
/// lifetime. `observed` tracks the same down/non-rollover accumulation
/// `Accumulator` does, duplicated here so the callback can evaluate the
/// stop predicate without calling back out through `on_press`.
struct CallbackContext<'a> {
    on_press: &'a mut dyn FnMut(ObservedPress),
    stop: &'a mut dyn FnMut(&HashSet<String>) -> bool,
    observed: HashSet<String>,
}

extern "C" fn handle_value(context: *mut c_void, _result: i32, _sender: *mut c_void, value: IoHidValueRef) {
    // SAFETY: `context` was set from a live `&mut CallbackContext` for the
    // duration of `IOHIDManagerRegisterInputValueCallback`'s registration,
    // and IOKit only invokes this callback from the scheduled run loop.
    let context = unsafe { &mut *(context as *mut CallbackContext) };

    let element = unsafe { IOHIDValueGetElement(value) };
    let usage_page = unsafe { IOHIDElementGetUsagePage(element) };
    if usage_page != USAGE_PAGE_KEYBOARD {
        return;
    }
    let usage = unsafe { IOHIDElementGetUsage(element) };
    let integer_value = unsafe { IOHIDValueGetIntegerValue(value) };
    let device = unsafe { IOHIDElementGetDevice(element) };

    let vendor_id = int_property(device, "VendorID").unwrap_or(0) as u32;
    let product_id = int_property(device, "ProductID").unwrap_or(0) as u32;
    let location_id = int_property(device, "LocationID").unwrap_or(0) as u32;
    let is_down = integer_value != 0;

    (context.on_press)(ObservedPress { vendor_id, product_id, location_id, usage, is_down });

    if is_down && !is_rollover(usage) {
        context.observed.insert(device_key(vendor_id, product_id, location_id));
    }

    if (context.stop)(&context.observed) {
        CFRunLoop::get_current().stop();
    }
}

struct ManagerGuard(IoHidManagerRef);

impl Drop for ManagerGuard {
    fn drop(&mut self) {
        unsafe {
            IOHIDManagerUnscheduleFromRunLoop(self.0, CFRunLoop::get_current().as_concrete_TypeRef(), kCFRunLoopDefaultMode);
            IOHIDManagerClose(self.0, K_IOHID_OPTIONS_TYPE_NONE);
        }
    }
}

/// IOKit-backed `IdentitySource`. Unlike `stream::macos::IoHidStreamSource`
/// this opens its own short-lived manager rather than sharing one scoped to
/// a Session, since detection runs before a Selection is known.
pub struct IoHidIdentitySource;

impl IoHidIdentitySource {
    pub fn new() -> Self {
        IoHidIdentitySource
    }
}

impl Default for IoHidIdentitySource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySource for IoHidIdentitySource {
    fn listen(
        &self,
        on_press: &mut dyn FnMut(ObservedPress),
        stop: &mut dyn FnMut(&HashSet<String>) -> bool,
    ) -> Result<(), EngineError> {
        let manager = unsafe { IOHIDManagerCreate(ptr::null(), K_IOHID_OPTIONS_TYPE_NONE) };
        if manager.is_null() {
            return Err(EngineError::SubsystemUnavailable("IOHIDManagerCreate failed".into()));
        }
        let guard = ManagerGuard(manager);

        let keyboard = matching_dict(K_HID_PAGE_GENERIC_DESKTOP, K_HID_USAGE_GD_KEYBOARD);
        let keypad = matching_dict(K_HID_PAGE_GENERIC_DESKTOP, K_HID_USAGE_GD_KEYPAD);
        let matching = core_foundation::array::CFArray::from_CFTypes(&[
            keyboard.as_CFType(),
            keypad.as_CFType(),
        ]);

        unsafe {
            IOHIDManagerSetDeviceMatchingMultiple(guard.0, matching.as_concrete_TypeRef());
        }

        let open_result = unsafe { IOHIDManagerOpen(guard.0, K_IOHID_OPTIONS_TYPE_NONE) };
        if open_result != 0 {
            return Err(EngineError::PermissionDenied(
                "failed to open IOHIDManager for identity detection, input-monitoring permission may be required"
                    .into(),
            ));
        }

        let mut context = CallbackContext { on_press, stop, observed: HashSet::new() };
        unsafe {
            IOHIDManagerRegisterInputValueCallback(
                guard.0,
                handle_value,
                &mut context as *mut CallbackContext as *mut c_void,
            );
            IOHIDManagerScheduleWithRunLoop(guard.0, CFRunLoop::get_current().as_concrete_TypeRef(), kCFRunLoopDefaultMode);
        }

        // Runs until `handle_value` observes the stop predicate firing and
        // stops this same run loop from inside the callback.
        CFRunLoop::run_current();

        Ok(())
    }
}

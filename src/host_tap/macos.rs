//! macOS `HostTap`: a `CGEventTapCreate` interceptor at the HID system
//! dispatch point, attached to the caller's run loop as required by §4.E.
//! The callback returns `NULL` to drop an event and the original event
//! pointer to pass it through — CoreGraphics does the actual suppression.

use std::ffi::c_void;
use std::ptr;

use core_foundation::base::TCFType;
use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopRef};
use core_foundation::string::CFStringRef;

use kbd_proto::{Direction, EngineError, HostEvent};

use super::{HostTap, TapAction};

type CgEventRef = *mut c_void;
type CfMachPortRef = *mut c_void;
type CfRunLoopSourceRef = *mut c_void;

const K_CG_SESSION_EVENT_TAP: u32 = 1;
const K_CG_HEAD_INSERT_EVENT_TAP: u32 = 0;
const K_CG_EVENT_TAP_OPTION_DEFAULT: u32 = 0;

const K_CG_EVENT_KEY_DOWN: u32 = 10;
const K_CG_EVENT_KEY_UP: u32 = 11;
const K_CG_KEYBOARD_EVENT_KEYCODE: u32 = 9;

type CgEventTapCallBack =
    extern "C" fn(proxy: *mut c_void, event_type: u32, event: CgEventRef, user_info: *mut c_void) -> CgEventRef;

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn CGEventTapCreate(
        tap: u32,
        place: u32,
        options: u32,
        events_of_interest: u64,
        callback: CgEventTapCallBack,
        user_info: *mut c_void,
    ) -> CfMachPortRef;
    fn CGEventTapEnable(tap: CfMachPortRef, enable: bool);
    fn CGEventGetIntegerValueField(event: CgEventRef, field: u32) -> i64;

    fn CFMachPortCreateRunLoopSource(
        allocator: *const c_void,
        port: CfMachPortRef,
        order: isize,
    ) -> CfRunLoopSourceRef;
    fn CFRunLoopAddSource(run_loop: CFRunLoopRef, source: CfRunLoopSourceRef, mode: CFStringRef);
    fn CFRunLoopRemoveSource(run_loop: CFRunLoopRef, source: CfRunLoopSourceRef, mode: CFStringRef);
    fn CFRelease(cf: *const c_void);
}

struct CallbackContext<'a> {
    decide: &'a mut dyn FnMut(HostEvent) -> TapAction,
    now: &'a dyn Fn() -> u64,
}

extern "C" fn handle_event(_proxy: *mut c_void, event_type: u32, event: CgEventRef, user_info: *mut c_void) -> CgEventRef {
    let direction = match event_type {
        K_CG_EVENT_KEY_DOWN => Direction::Down,
        K_CG_EVENT_KEY_UP => Direction::Up,
        // Tap-disabled notifications and anything else we didn't ask for:
        // pass through untouched.
        _ => return event,
    };

    // SAFETY: `user_info` was set from a live `&mut CallbackContext` for the
    // duration of the tap's installation, and CoreGraphics only invokes
    // this callback from the scheduled run loop.
    let context = unsafe { &mut *(user_info as *mut CallbackContext) };
    let key_code = unsafe { CGEventGetIntegerValueField(event, K_CG_KEYBOARD_EVENT_KEYCODE) } as i32;

    let host_event = HostEvent { key_code, direction, at_millis: (context.now)() };
    match (context.decide)(host_event) {
        TapAction::Pass => event,
        TapAction::Drop => ptr::null_mut(),
    }
}

struct TapGuard {
    port: CfMachPortRef,
    source: CfRunLoopSourceRef,
}

impl Drop for TapGuard {
    fn drop(&mut self) {
        unsafe {
            CFRunLoopRemoveSource(CFRunLoop::get_current().as_concrete_TypeRef(), self.source, kCFRunLoopDefaultMode);
            CFRelease(self.source as *const _);
            CFRelease(self.port as *const _);
        }
    }
}

/// `CGEventTapCreate`-backed `HostTap`.
pub struct CgEventHostTap {
    run_loop: std::sync::Mutex<Option<CFRunLoop>>,
}

impl CgEventHostTap {
    pub fn new() -> Self {
        CgEventHostTap { run_loop: std::sync::Mutex::new(None) }
    }

    fn events_of_interest() -> u64 {
        (1u64 << K_CG_EVENT_KEY_DOWN) | (1u64 << K_CG_EVENT_KEY_UP)
    }

    fn install(&self, decide: &mut dyn FnMut(HostEvent) -> TapAction, now: &dyn Fn() -> u64) -> Result<TapGuard, EngineError> {
        let mut context = CallbackContext { decide, now };
        let port = unsafe {
            CGEventTapCreate(
                K_CG_SESSION_EVENT_TAP,
                K_CG_HEAD_INSERT_EVENT_TAP,
                K_CG_EVENT_TAP_OPTION_DEFAULT,
                Self::events_of_interest(),
                handle_event,
                &mut context as *mut CallbackContext as *mut c_void,
            )
        };
        if port.is_null() {
            return Err(EngineError::PermissionDenied(
                "CGEventTapCreate failed, accessibility/input-monitoring permission may be required".into(),
            ));
        }

        let source = unsafe { CFMachPortCreateRunLoopSource(ptr::null(), port, 0) };
        unsafe {
            CFRunLoopAddSource(CFRunLoop::get_current().as_concrete_TypeRef(), source, kCFRunLoopDefaultMode);
            CGEventTapEnable(port, true);
        }

        Ok(TapGuard { port, source })
    }
}

impl Default for CgEventHostTap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTap for CgEventHostTap {
    fn run(&self, decide: &mut dyn FnMut(HostEvent) -> TapAction) -> Result<(), EngineError> {
        let now = crate::utils::monotonic_millis;
        let _guard = self.install(decide, &now)?;
        *self.run_loop.lock().unwrap() = Some(CFRunLoop::get_current());
        // Runs until the Session Supervisor removes the tap during shutdown
        // (§4.H Draining: "close E (uninstall the tap)" before D).
        CFRunLoop::run_current();
        *self.run_loop.lock().unwrap() = None;
        Ok(())
    }

    fn request_stop(&self) {
        if let Some(run_loop) = self.run_loop.lock().unwrap().as_ref() {
            run_loop.stop();
        }
    }

    fn dry_open(&self) -> Result<(), EngineError> {
        let mut noop = |_event: HostEvent| TapAction::Pass;
        let now = || 0u64;
        self.install(&mut noop, &now).map(drop)
    }
}

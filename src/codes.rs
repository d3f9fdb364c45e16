//! Code Mapper (component C): three total, pure lookup functions translating
//! HID usage codes to the engine's internal key codes, to human names, and
//! to the scan codes the guest expects. These are the one legitimately
//! module-level-constant piece of the engine (Design Notes §9) — everything
//! else is an owned value passed down from the Session Supervisor.

/// HID reports this value when more keys are down than the device can
/// report individually ("rollover"). Must be dropped before mapping.
pub const ROLLOVER_SENTINEL: u32 = 0xFFFF_FFFF;

pub fn is_rollover(usage: u32) -> bool {
    usage == ROLLOVER_SENTINEL
}

/// HID usage (keyboard/keypad page) → internal key code.
///
/// Internal key codes are the fixed physical-position space the rest of the
/// engine works in. On a miss: usages in the valid keyboard/keypad range
/// pass through unchanged (best-effort), anything else is logged and
/// dropped to `0`.
pub fn usage_to_key_code(usage: u32) -> i32 {
    let mapped = match usage {
        0x04 => 0,  // A
        0x05 => 11, // B
        0x06 => 8,  // C
        0x07 => 2,  // D
        0x08 => 14, // E
        0x09 => 3,  // F
        0x0A => 5,  // G
        0x0B => 4,  // H
        0x0C => 34, // I
        0x0D => 38, // J
        0x0E => 40, // K
        0x0F => 37, // L
        0x10 => 46, // M
        0x11 => 45, // N
        0x12 => 31, // O
        0x13 => 35, // P
        0x14 => 12, // Q
        0x15 => 15, // R
        0x16 => 1,  // S
        0x17 => 17, // T
        0x18 => 32, // U
        0x19 => 9,  // V
        0x1A => 13, // W
        0x1B => 7,  // X
        0x1C => 16, // Y
        0x1D => 6,  // Z
        0x1E => 18, // 1
        0x1F => 19, // 2
        0x20 => 20, // 3
        0x21 => 21, // 4
        0x22 => 23, // 5
        0x23 => 22, // 6
        0x24 => 26, // 7
        0x25 => 28, // 8
        0x26 => 25, // 9
        0x27 => 29, // 0
        0x28 => 36, // Return
        0x29 => 53, // Escape
        0x2A => 51, // Backspace
        0x2B => 48, // Tab
        0x2C => 49, // Space
        0x2D => 27, // Minus
        0x2E => 24, // Equal
        0x2F => 33, // LeftBracket
        0x30 => 30, // RightBracket
        0x31 => 42, // Backslash
        0x33 => 41, // Semicolon
        0x34 => 39, // Quote
        0x35 => 50, // Grave
        0x36 => 43, // Comma
        0x37 => 47, // Period
        0x38 => 44, // Slash
        0x39 => 57, // CapsLock
        0x3A => 122, // F1
        0x3B => 120, // F2
        0x3C => 99,  // F3
        0x3D => 118, // F4
        0x3E => 96,  // F5
        0x3F => 97,  // F6
        0x40 => 98,  // F7
        0x41 => 100, // F8
        0x42 => 101, // F9
        0x43 => 109, // F10
        0x44 => 103, // F11
        0x45 => 111, // F12
        0x4C => 117, // ForwardDelete
        0x4F => 124, // RightArrow
        0x50 => 123, // LeftArrow
        0x51 => 125, // DownArrow
        0x52 => 126, // UpArrow
        _ => {
            if usage <= 127 {
                usage as i32
            } else {
                warn!("no key code mapping for HID usage {usage:#x}");
                0
            }
        }
    };
    mapped
}

/// Internal key code → human-readable key name, for logging and UI.
pub fn key_code_to_name(code: i32) -> String {
    let name = match code {
        0 => "A", 11 => "B", 8 => "C", 2 => "D", 14 => "E", 3 => "F", 5 => "G", 4 => "H",
        34 => "I", 38 => "J", 40 => "K", 37 => "L", 46 => "M", 45 => "N", 31 => "O", 35 => "P",
        12 => "Q", 15 => "R", 1 => "S", 17 => "T", 32 => "U", 9 => "V", 13 => "W", 7 => "X",
        16 => "Y", 6 => "Z",
        18 => "1", 19 => "2", 20 => "3", 21 => "4", 23 => "5", 22 => "6", 26 => "7", 28 => "8",
        25 => "9", 29 => "0",
        36 => "Return", 53 => "Escape", 51 => "Delete", 48 => "Tab", 49 => "Space",
        27 => "-", 24 => "=", 33 => "[", 30 => "]", 42 => "\\", 41 => ";", 39 => "'",
        50 => "`", 43 => ",", 47 => ".", 44 => "/", 57 => "CapsLock",
        122 => "F1", 120 => "F2", 99 => "F3", 118 => "F4", 96 => "F5", 97 => "F6", 98 => "F7",
        100 => "F8", 101 => "F9", 109 => "F10", 103 => "F11", 111 => "F12",
        117 => "ForwardDelete", 124 => "RightArrow", 123 => "LeftArrow", 125 => "DownArrow",
        126 => "UpArrow",
        _ => return format!("Key{code}"),
    };
    name.to_owned()
}

/// Internal key code → guest scan code, expressed as the physical-QWERTY
/// position the guest expects — **not** derived from the key code's
/// numeric ordering. On a miss, the scan code for `'A'` is substituted
/// (never silently dropped, per `MappingMiss`, §7) and the caller should
/// warn.
pub fn key_code_to_scan_code(code: i32) -> i32 {
    match code {
        12 => 16, 13 => 17, 14 => 18, 15 => 19, 17 => 20, 16 => 21, 32 => 22, 34 => 23,
        31 => 24, 35 => 25, // Q W E R T Y U I O P
        0 => 30, 1 => 31, 2 => 32, 3 => 33, 5 => 34, 4 => 35, 38 => 36, 40 => 37, 37 => 38,
        // A S D F G H J K L
        6 => 44, 7 => 45, 8 => 46, 9 => 47, 11 => 48, 45 => 49, 46 => 50, // Z X C V B N M
        18 => 2, 19 => 3, 20 => 4, 21 => 5, 23 => 6, 22 => 7, 26 => 8, 28 => 9, 25 => 10,
        29 => 11, // 1-9, 0
        27 => 12, 24 => 13, // Minus, Equal
        33 => 26, 30 => 27, // LeftBracket, RightBracket
        42 => 43, 41 => 39, 39 => 40, 50 => 41, 43 => 51, 47 => 52, 44 => 53,
        // Backslash, Semicolon, Quote, Grave, Comma, Period, Slash
        36 => 28, // Return
        53 => 1,  // Escape
        51 => 14, // Backspace
        48 => 15, // Tab
        49 => 57, // Space
        57 => 58, // CapsLock
        122 => 59, 120 => 60, 99 => 61, 118 => 62, 96 => 63, 97 => 64, 98 => 65, 100 => 66,
        101 => 67, 109 => 68, 103 => 87, 111 => 88, // F1-F12
        123 => 75, 124 => 77, 126 => 72, 125 => 80, // Left Right Up Down
        117 => 83, // ForwardDelete
        other => {
            warn!("no scan code mapping for key code {other}, substituting 'A'");
            30
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn golden_round_trip_w() {
        let key_code = usage_to_key_code(0x1A);
        assert_eq!(key_code, 13);
        assert_eq!(key_code_to_scan_code(key_code), 17);
    }

    #[test]
    fn golden_round_trip_space() {
        let key_code = usage_to_key_code(0x2C);
        assert_eq!(key_code, 49);
        assert_eq!(key_code_to_scan_code(key_code), 57);
    }

    #[test]
    fn golden_round_trip_right_arrow() {
        let key_code = usage_to_key_code(0x4F);
        assert_eq!(key_code, 124);
        assert_eq!(key_code_to_scan_code(key_code), 77);
    }

    #[test]
    fn letters_round_trip_to_distinct_scan_codes() {
        let mut scan_codes = std::collections::HashSet::new();
        for usage in 0x04..=0x1D {
            let key_code = usage_to_key_code(usage);
            let scan = key_code_to_scan_code(key_code);
            assert!(scan_codes.insert(scan), "duplicate scan code for usage {usage:#x}");
        }
    }

    #[test]
    fn rollover_sentinel_is_detected() {
        assert!(is_rollover(ROLLOVER_SENTINEL));
        assert!(!is_rollover(0x1A));
    }

    #[test]
    fn mapping_miss_falls_back_without_panicking() {
        assert_eq!(usage_to_key_code(200), 0);
        assert_eq!(key_code_to_scan_code(9999), 30);
        assert_eq!(key_code_to_name(9999), "Key9999");
    }
}

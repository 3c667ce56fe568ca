//! Kernel event type and code constants and name lookup
//!
//! Codes come from the `evdev` crate so names resolve for every key, button
//! and axis the kernel defines, `KEY_*` included. A few libevdev aliases the
//! crate has no name for are mapped on top.

use std::str::FromStr;

use evdev::{AbsoluteAxisCode, EventType, FFEffectCode, KeyCode, SynchronizationCode};

pub const EV_SYN: u16 = EventType::SYNCHRONIZATION.0;
pub const EV_KEY: u16 = EventType::KEY.0;
pub const EV_REL: u16 = EventType::RELATIVE.0;
pub const EV_ABS: u16 = EventType::ABSOLUTE.0;
pub const EV_MSC: u16 = EventType::MISC.0;
pub const EV_FF: u16 = EventType::FORCEFEEDBACK.0;

pub const SYN_REPORT: u16 = SynchronizationCode::SYN_REPORT.0;
pub const SYN_MT_REPORT: u16 = SynchronizationCode::SYN_MT_REPORT.0;
pub const SYN_DROPPED: u16 = SynchronizationCode::SYN_DROPPED.0;

pub const ABS_X: u16 = AbsoluteAxisCode::ABS_X.0;
pub const ABS_Y: u16 = AbsoluteAxisCode::ABS_Y.0;
pub const ABS_RX: u16 = AbsoluteAxisCode::ABS_RX.0;
pub const ABS_HAT0X: u16 = AbsoluteAxisCode::ABS_HAT0X.0;
pub const ABS_HAT0Y: u16 = AbsoluteAxisCode::ABS_HAT0Y.0;

pub const BTN_SOUTH: u16 = KeyCode::BTN_SOUTH.0;
pub const BTN_EAST: u16 = KeyCode::BTN_EAST.0;
pub const BTN_NORTH: u16 = KeyCode::BTN_NORTH.0;
pub const BTN_WEST: u16 = KeyCode::BTN_WEST.0;

pub const FF_RUMBLE: u16 = FFEffectCode::FF_RUMBLE.0;

// Second names libevdev accepts for the same code.
const KEY_ALIASES: &[(&str, u16)] = &[
    ("BTN_MISC", KeyCode::BTN_0.0),
    ("BTN_MOUSE", KeyCode::BTN_LEFT.0),
    ("BTN_JOYSTICK", KeyCode::BTN_TRIGGER.0),
    ("BTN_GAMEPAD", BTN_SOUTH),
    ("BTN_A", BTN_SOUTH),
    ("BTN_B", BTN_EAST),
    ("BTN_X", BTN_NORTH),
    ("BTN_Y", BTN_WEST),
    ("BTN_TRIGGER_HAPPY", KeyCode::BTN_TRIGGER_HAPPY1.0),
];

/// Resolves a code name like `ABS_X`, `BTN_A` or `KEY_BACK` for the given event type.
pub fn code_from_name(kind: u16, name: &str) -> Option<u16> {
    match kind {
        EV_KEY => KEY_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, code)| *code)
            .or_else(|| KeyCode::from_str(name).ok().map(|key| key.0)),
        EV_ABS => AbsoluteAxisCode::from_str(name).ok().map(|axis| axis.0),
        _ => None,
    }
}

/// Kernel name of a code, for logging.
pub fn code_name(kind: u16, code: u16) -> Option<String> {
    match kind {
        EV_SYN => Some(format!("{:?}", SynchronizationCode(code))),
        EV_KEY => Some(format!("{:?}", KeyCode(code))),
        EV_ABS => Some(format!("{:?}", AbsoluteAxisCode(code))),
        EV_FF => Some(format!("{:?}", FFEffectCode(code))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_aliases_to_the_same_code() {
        assert_eq!(code_from_name(EV_KEY, "BTN_A"), Some(BTN_SOUTH));
        assert_eq!(code_from_name(EV_KEY, "BTN_GAMEPAD"), Some(BTN_SOUTH));
        assert_eq!(code_from_name(EV_KEY, "BTN_SOUTH"), Some(BTN_SOUTH));
        assert_eq!(code_name(EV_KEY, BTN_SOUTH).as_deref(), Some("BTN_SOUTH"));
        assert_eq!(code_from_name(EV_KEY, "BTN_TRIGGER_HAPPY40"), Some(0x2e7));
    }

    #[test]
    fn keyboard_key_names_resolve() {
        assert_eq!(code_from_name(EV_KEY, "KEY_BACK"), Some(158));
        assert_eq!(code_from_name(EV_KEY, "KEY_VOLUMEUP"), Some(115));
        assert_eq!(code_from_name(EV_KEY, "KEY_NOT_A_KEY"), None);
    }

    #[test]
    fn names_are_scoped_to_their_event_type() {
        assert_eq!(code_from_name(EV_ABS, "ABS_HAT0Y"), Some(ABS_HAT0Y));
        assert_eq!(code_from_name(EV_ABS, "ABS_THROTTLE"), Some(0x06));
        assert_eq!(code_from_name(EV_KEY, "ABS_X"), None);
        assert_eq!(code_from_name(EV_ABS, "BTN_SOUTH"), None);
        assert_eq!(code_from_name(EV_ABS, "ABS_NOPE"), None);
        assert_eq!(code_from_name(EV_REL, "REL_X"), None);
    }

    #[test]
    fn constants_match_the_kernel_header() {
        assert_eq!((EV_SYN, EV_KEY, EV_ABS, EV_FF), (0x00, 0x01, 0x03, 0x15));
        assert_eq!((SYN_REPORT, SYN_MT_REPORT, SYN_DROPPED), (0, 2, 3));
        assert_eq!(BTN_SOUTH, 0x130);
        assert_eq!(FF_RUMBLE, 0x50);
    }
}

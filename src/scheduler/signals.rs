// src/scheduler/signals.rs - Asynchronous feedhold, cycle-start, abort and limit flags
//! Set from interrupt context or the character layer, read and cleared by the
//! scheduler. Setting a flag that is already set changes nothing.

use crate::hardware::{SWITCH_COUNT, SwitchId};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub const FEEDHOLD_CHAR: u8 = b'!';
pub const CYCLE_START_CHAR: u8 = b'~';
pub const ABORT_CHAR: u8 = b'%';
/// Ctrl-X.
pub const RESET_CHAR: u8 = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Feedhold,
    CycleStart,
    Abort,
}

/// No limit switch pending.
const NO_TRIP: u8 = u8::MAX;

#[derive(Debug)]
pub struct Signals {
    feedhold: AtomicBool,
    cycle_start: AtomicBool,
    abort: AtomicBool,
    tripped: AtomicU8,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub const fn new() -> Self {
        Self {
            feedhold: AtomicBool::new(false),
            cycle_start: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            tripped: AtomicU8::new(NO_TRIP),
        }
    }

    fn flag(&self, signal: Signal) -> &AtomicBool {
        match signal {
            Signal::Feedhold => &self.feedhold,
            Signal::CycleStart => &self.cycle_start,
            Signal::Abort => &self.abort,
        }
    }

    pub fn set(&self, signal: Signal) {
        self.flag(signal).store(true, Ordering::Release);
    }

    pub fn is_set(&self, signal: Signal) -> bool {
        self.flag(signal).load(Ordering::Acquire)
    }

    /// Read and clear.
    pub fn take(&self, signal: Signal) -> bool {
        self.flag(signal).swap(false, Ordering::AcqRel)
    }

    /// Record a confirmed switch closure. The first trip wins until taken.
    pub fn trip(&self, switch: SwitchId) {
        let _ = self
            .tripped
            .compare_exchange(NO_TRIP, switch.index() as u8, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn take_trip(&self) -> Option<SwitchId> {
        let index = self.tripped.swap(NO_TRIP, Ordering::AcqRel);
        if usize::from(index) < SWITCH_COUNT {
            SwitchId::from_index(usize::from(index))
        } else {
            None
        }
    }

    /// Character-layer hook: consumes signal bytes and reports whether `byte` was one.
    pub fn scan_byte(&self, byte: u8) -> bool {
        let signal = match byte {
            FEEDHOLD_CHAR => Signal::Feedhold,
            CYCLE_START_CHAR => Signal::CycleStart,
            ABORT_CHAR | RESET_CHAR => Signal::Abort,
            _ => return false,
        };
        self.set(signal);
        true
    }

    pub fn clear(&self) {
        self.feedhold.store(false, Ordering::Release);
        self.cycle_start.store(false, Ordering::Release);
        self.abort.store(false, Ordering::Release);
        self.tripped.store(NO_TRIP, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Axis;
    use crate::hardware::SwitchEnd;

    #[test]
    fn repeated_set_is_one_event() {
        let signals = Signals::new();
        for _ in 0..5 {
            signals.set(Signal::Feedhold);
        }
        assert!(signals.take(Signal::Feedhold));
        assert!(!signals.take(Signal::Feedhold));
    }

    #[test]
    fn scan_byte_picks_out_signal_characters() {
        let signals = Signals::new();
        assert!(!signals.scan_byte(b'G'));
        assert!(signals.scan_byte(b'!'));
        assert!(signals.scan_byte(0x18));
        assert!(signals.is_set(Signal::Feedhold));
        assert!(signals.is_set(Signal::Abort));
        assert!(!signals.is_set(Signal::CycleStart));
    }

    #[test]
    fn first_trip_is_kept() {
        let signals = Signals::new();
        let x = SwitchId { axis: Axis::X, end: SwitchEnd::Min };
        let y = SwitchId { axis: Axis::Y, end: SwitchEnd::Max };
        signals.trip(x);
        signals.trip(y);
        assert_eq!(signals.take_trip(), Some(x));
        assert_eq!(signals.take_trip(), None);
    }
}

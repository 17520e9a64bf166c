//! Process-wide runtime state
//!
//! The runtime's global structures are opened at most once per process and
//! never closed: a torn-down VM leaves them in place for the next one.

use std::sync::atomic::{AtomicU8, Ordering};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;

static STATE: AtomicU8 = AtomicU8::new(CLOSED);

/// Open the runtime globals. Returns `true` for the call that performed the
/// transition, `false` if they were already open.
pub fn open() -> bool {
    let opened = STATE
        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    if opened {
        log::debug!("runtime globals opened");
    }
    opened
}

/// Whether the runtime globals have been opened
pub fn is_open() -> bool {
    STATE.load(Ordering::Acquire) == OPEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        open();
        assert!(is_open());
        assert!(!open());
        assert!(is_open());
    }
}

//! Virtual playback-buffer bookkeeping shared by every policy.
//!
//! The buffer is an accounting device, not a byte queue: it grows by one
//! segment duration per fresh decision and shrinks by wall-clock download
//! time and pauses. A negative level at decision time means playback would
//! have stalled; the deficit is reported and the level clamps to zero.

use crate::error::ControlError;

/// A stall observed while clamping a negative buffer level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stall {
    /// The deficit accrued before the first decision (initial prefetch).
    Startup(f64),
    /// A mid-session rebuffer of the given length in milliseconds.
    Rebuffer(f64),
}

/// Virtual buffer level in milliseconds, clamped to `[0, buffer_size]` by the
/// decision cycle.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    level: f64,
    startup: bool,
}

impl PlaybackBuffer {
    const MAX_REBUFFER_MS: f64 = 100_000.0;

    pub fn new() -> Self {
        Self {
            level: 0.0,
            startup: true,
        }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn set_level(&mut self, level: f64) {
        self.level = level;
    }

    /// Clamp a negative level, report the stall, and credit one segment
    /// duration for the decision being made.
    pub fn pre_update(&mut self, segment_duration: f64) -> Result<Option<Stall>, ControlError> {
        let mut stall = None;
        if self.level < 0.0 {
            if self.level < -Self::MAX_REBUFFER_MS {
                return Err(ControlError::RebufferOverflow(-self.level));
            }
            stall = Some(if self.startup {
                Stall::Startup(-self.level)
            } else {
                Stall::Rebuffer(-self.level)
            });
            self.level = 0.0;
        }
        self.startup = false;
        self.level += segment_duration;
        Ok(stall)
    }

    /// Debit an imposed pause from the level.
    pub fn apply_pause(&mut self, pause: f64) {
        if pause > 0.0 {
            self.level -= pause;
        }
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_deficit_is_startup_then_rebuffer() {
        let mut buf = PlaybackBuffer::new();
        buf.set_level(-1333.0);
        let stall = buf.pre_update(4000.0).expect("within invariant");
        assert_eq!(stall, Some(Stall::Startup(1333.0)));
        assert_eq!(buf.level(), 4000.0);

        buf.set_level(-200.0);
        let stall = buf.pre_update(4000.0).expect("within invariant");
        assert_eq!(stall, Some(Stall::Rebuffer(200.0)));
    }

    #[test]
    fn positive_level_reports_no_stall() {
        let mut buf = PlaybackBuffer::new();
        buf.set_level(2500.0);
        let stall = buf.pre_update(4000.0).expect("within invariant");
        assert_eq!(stall, None);
        assert_eq!(buf.level(), 6500.0);
    }

    #[test]
    fn hundred_second_rebuffer_is_fatal() {
        let mut buf = PlaybackBuffer::new();
        buf.set_level(-100_001.0);
        assert!(matches!(
            buf.pre_update(4000.0),
            Err(ControlError::RebufferOverflow(_))
        ));
    }

    #[test]
    fn pause_only_debits_positive_amounts() {
        let mut buf = PlaybackBuffer::new();
        buf.set_level(5000.0);
        buf.apply_pause(0.0);
        assert_eq!(buf.level(), 5000.0);
        buf.apply_pause(1500.0);
        assert_eq!(buf.level(), 3500.0);
    }
}

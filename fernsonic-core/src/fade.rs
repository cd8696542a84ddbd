//! Block-time based faders.
//!
//! Two flavors: [`LinearFader`] interpolates a value over an arbitrary range
//! of block times and is exact at and outside its endpoints, which lets the
//! router cheaply detect "not fading" by comparing endpoint values.
//! [`FadeDriver`] is the per-node gain fader: every new target fades in over
//! exactly one block, which is what makes external property writes
//! click-free.

use crate::config::BLOCK_SIZE;

/// A value that moves linearly between two block times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFader {
    start_time: u64,
    start_value: f64,
    end_time: u64,
    end_value: f64,
}

impl LinearFader {
    pub fn new(start_time: u64, start_value: f64, end_time: u64, end_value: f64) -> Self {
        Self {
            start_time,
            start_value,
            end_time,
            end_value,
        }
    }

    /// The value at block `time`. Exact outside [start, end].
    pub fn value(&self, time: u64) -> f64 {
        if time >= self.end_time {
            self.end_value
        } else if time <= self.start_time {
            self.start_value
        } else {
            let total = (self.end_time - self.start_time) as f64;
            let done = (time - self.start_time) as f64;
            self.start_value + (self.end_value - self.start_value) * (done / total)
        }
    }

    pub fn is_fading(&self, time: u64) -> bool {
        time < self.end_time
    }
}

/// Drives a per-node gain: each target installed by [`FadeDriver::set_value`]
/// is reached by a linear fade across the single block it was installed in.
#[derive(Debug, Clone, Copy)]
pub struct FadeDriver {
    fade_time: u64,
    start: f64,
    end: f64,
}

impl FadeDriver {
    pub fn new(value: f64) -> Self {
        Self {
            fade_time: 0,
            start: value,
            end: value,
        }
    }

    fn value_at_block_start(&self, time: u64) -> f64 {
        if time > self.fade_time {
            self.end
        } else {
            self.start
        }
    }

    /// Installs a new target at block `time`. The fade starts from whatever
    /// the driver's value is at that block, so repeated sets of the same
    /// value never produce a discontinuity.
    pub fn set_value(&mut self, time: u64, value: f64) {
        self.start = self.value_at_block_start(time);
        self.end = value;
        self.fade_time = time;
    }

    /// Invokes `f` with a cheap per-sample gain callback for block `time`.
    ///
    /// The callback's argument is the sample index in [0, BLOCK_SIZE); the
    /// fade completes exactly at the end of the block, i.e. sample
    /// `BLOCK_SIZE - 1` already carries gain `end` at the next block start.
    pub fn drive<F>(&self, time: u64, f: F)
    where
        F: FnOnce(&dyn Fn(usize) -> f32),
    {
        if time == self.fade_time && self.start != self.end {
            let start = self.start as f32;
            let step = (self.end - self.start) as f32 / BLOCK_SIZE as f32;
            f(&move |i| start + step * (i + 1) as f32);
        } else {
            let value = self.value_at_block_start(time) as f32;
            f(&move |_| value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_fader_endpoints_exact() {
        let fader = LinearFader::new(10, 1.0, 14, 0.0);
        assert_eq!(fader.value(9), 1.0);
        assert_eq!(fader.value(10), 1.0);
        assert_eq!(fader.value(12), 0.5);
        assert_eq!(fader.value(14), 0.0);
        assert_eq!(fader.value(100), 0.0);
        assert!(fader.is_fading(13));
        assert!(!fader.is_fading(14));
    }

    #[test]
    fn test_zero_length_fade_is_immediate() {
        let fader = LinearFader::new(5, 1.0, 5, 0.25);
        assert_eq!(fader.value(5), 0.25);
        assert!(!fader.is_fading(5));
    }

    #[test]
    fn test_drive_fades_over_one_block() {
        let mut driver = FadeDriver::new(1.0);
        driver.set_value(3, 0.0);
        driver.drive(3, |gain| {
            assert!((gain(0) - 255.0 / 256.0).abs() < 1e-6);
            assert_eq!(gain(BLOCK_SIZE - 1), 0.0);
        });
        driver.drive(4, |gain| {
            assert_eq!(gain(0), 0.0);
            assert_eq!(gain(BLOCK_SIZE - 1), 0.0);
        });
    }

    #[test]
    fn test_resetting_same_value_holds_flat() {
        let mut driver = FadeDriver::new(0.5);
        driver.set_value(2, 0.5);
        driver.drive(2, |gain| {
            assert_eq!(gain(0), 0.5);
            assert_eq!(gain(128), 0.5);
        });
    }
}

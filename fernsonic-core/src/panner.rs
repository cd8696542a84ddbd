//! The panner bank.
//!
//! Panned sources do not spatialize themselves; they borrow a *lane* from
//! the bank, write one mono block plus a pair of angles into it each block,
//! and the bank renders every lane of a panner together into the direct
//! buffer. Lanes are claimed by a refcounted token so a dying source frees
//! its lane implicitly; a panner holds at most `PANNER_MAX_LANES` lanes and
//! allocation fails beyond that, at which point the caller degrades to a
//! simpler strategy.
//!
//! Two panners are provided: a constant-power stereo panner, and an
//! interaural time/level-difference approximation standing in for a full
//! HRTF renderer. Parameter changes crossfade over `CROSSFADE_SAMPLES` so
//! moving a source never clicks.

use std::sync::{Arc, Weak};

use crate::config::{BLOCK_SIZE, CROSSFADE_SAMPLES, HRTF_MAX_ITD, PANNER_MAX_LANES};
use crate::error::{Error, Result};

/// How a source wants to be spatialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PannerStrategy {
    Stereo,
    #[default]
    Hrtf,
}

impl PannerStrategy {
    pub fn from_index(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Stereo),
            1 => Some(Self::Hrtf),
            _ => None,
        }
    }

    pub fn to_index(self) -> i32 {
        match self {
            Self::Stereo => 0,
            Self::Hrtf => 1,
        }
    }
}

/// Claim on one lane. Dropping the last clone releases the lane at the next
/// bank run.
#[derive(Debug)]
pub(crate) struct LaneToken {
    strategy: PannerStrategy,
    index: usize,
}

/// Pan position in [-1, 1] from angles in degrees. `sin` folds rear
/// azimuths onto the matching front position; elevation pulls toward the
/// median plane.
fn pan_from_angles(azimuth: f64, elevation: f64) -> f32 {
    (azimuth.to_radians().sin() * elevation.to_radians().cos()) as f32
}

fn constant_power_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}

fn add_frame(dest: &mut [f32], channels: usize, frame: usize, l: f32, r: f32) {
    if channels == 1 {
        dest[frame] += 0.5 * (l + r);
    } else {
        dest[frame * channels] += l;
        dest[frame * channels + 1] += r;
    }
}

#[derive(Clone, Copy, PartialEq, Default)]
struct StereoParams {
    gain_l: f32,
    gain_r: f32,
}

struct StereoLane {
    token: Weak<LaneToken>,
    input: Vec<f32>,
    current: StereoParams,
    previous: StereoParams,
    changed: bool,
}

impl StereoLane {
    fn new() -> Self {
        Self {
            token: Weak::new(),
            input: vec![0.0; BLOCK_SIZE],
            current: StereoParams::default(),
            previous: StereoParams::default(),
            changed: false,
        }
    }

    fn reset(&mut self) {
        self.input.fill(0.0);
        let (gain_l, gain_r) = constant_power_gains(0.0);
        self.current = StereoParams { gain_l, gain_r };
        self.previous = self.current;
        self.changed = false;
    }

    fn set_pan(&mut self, pan: f32) {
        let (gain_l, gain_r) = constant_power_gains(pan);
        let next = StereoParams { gain_l, gain_r };
        if next != self.current {
            self.previous = self.current;
            self.current = next;
            self.changed = true;
        }
    }

    fn render(&mut self, dest: &mut [f32], channels: usize) {
        for i in 0..BLOCK_SIZE {
            let sample = self.input[i];
            let (gain_l, gain_r) = if self.changed && i < CROSSFADE_SAMPLES {
                let w2 = i as f32 / CROSSFADE_SAMPLES as f32;
                let w1 = 1.0 - w2;
                (
                    w1 * self.previous.gain_l + w2 * self.current.gain_l,
                    w1 * self.previous.gain_r + w2 * self.current.gain_r,
                )
            } else {
                (self.current.gain_l, self.current.gain_r)
            };
            add_frame(dest, channels, i, sample * gain_l, sample * gain_r);
        }
        self.previous = self.current;
        self.changed = false;
        self.input.fill(0.0);
    }
}

#[derive(Clone, Copy, PartialEq)]
struct EarParams {
    gain_l: f32,
    gain_r: f32,
    delay_l: usize,
    delay_r: usize,
}

impl EarParams {
    fn from_pan(pan: f32) -> Self {
        let (gain_l, gain_r) = constant_power_gains(pan);
        // The far ear gets the full interaural delay at +-90 degrees.
        let itd = (pan.abs() * (HRTF_MAX_ITD - 1) as f32) as usize;
        let (delay_l, delay_r) = if pan >= 0.0 { (itd, 0) } else { (0, itd) };
        Self {
            gain_l,
            gain_r,
            delay_l,
            delay_r,
        }
    }
}

struct HrtfLane {
    token: Weak<LaneToken>,
    input: Vec<f32>,
    /// Tail of the previous block, for delayed reads near the block start.
    history: [f32; HRTF_MAX_ITD],
    current: EarParams,
    previous: EarParams,
    changed: bool,
}

impl HrtfLane {
    fn new() -> Self {
        Self {
            token: Weak::new(),
            input: vec![0.0; BLOCK_SIZE],
            history: [0.0; HRTF_MAX_ITD],
            current: EarParams::from_pan(0.0),
            previous: EarParams::from_pan(0.0),
            changed: false,
        }
    }

    fn reset(&mut self) {
        self.input.fill(0.0);
        self.history = [0.0; HRTF_MAX_ITD];
        self.current = EarParams::from_pan(0.0);
        self.previous = self.current;
        self.changed = false;
    }

    fn set_pan(&mut self, pan: f32) {
        let next = EarParams::from_pan(pan);
        if next != self.current {
            self.previous = self.current;
            self.current = next;
            self.changed = true;
        }
    }

    #[inline]
    fn delayed(&self, i: usize, delay: usize) -> f32 {
        if i >= delay {
            self.input[i - delay]
        } else {
            self.history[HRTF_MAX_ITD - delay + i]
        }
    }

    fn render(&mut self, dest: &mut [f32], channels: usize) {
        for i in 0..BLOCK_SIZE {
            let l_new = self.delayed(i, self.current.delay_l) * self.current.gain_l;
            let r_new = self.delayed(i, self.current.delay_r) * self.current.gain_r;
            let (l, r) = if self.changed && i < CROSSFADE_SAMPLES {
                let w2 = i as f32 / CROSSFADE_SAMPLES as f32;
                let w1 = 1.0 - w2;
                let l_old = self.delayed(i, self.previous.delay_l) * self.previous.gain_l;
                let r_old = self.delayed(i, self.previous.delay_r) * self.previous.gain_r;
                (w1 * l_old + w2 * l_new, w1 * r_old + w2 * r_new)
            } else {
                (l_new, r_new)
            };
            add_frame(dest, channels, i, l, r);
        }
        self.history
            .copy_from_slice(&self.input[BLOCK_SIZE - HRTF_MAX_ITD..]);
        self.previous = self.current;
        self.changed = false;
        self.input.fill(0.0);
    }
}

/// Owns the panner implementations and their lanes.
pub(crate) struct PannerBank {
    stereo: Vec<StereoLane>,
    hrtf: Vec<HrtfLane>,
}

impl PannerBank {
    pub(crate) fn new() -> Self {
        Self {
            stereo: (0..PANNER_MAX_LANES).map(|_| StereoLane::new()).collect(),
            hrtf: (0..PANNER_MAX_LANES).map(|_| HrtfLane::new()).collect(),
        }
    }

    /// Claims a free lane of the given strategy.
    pub(crate) fn allocate_lane(&mut self, strategy: PannerStrategy) -> Result<Arc<LaneToken>> {
        let free_index = match strategy {
            PannerStrategy::Stereo => self
                .stereo
                .iter()
                .position(|l| l.token.strong_count() == 0),
            PannerStrategy::Hrtf => self.hrtf.iter().position(|l| l.token.strong_count() == 0),
        };
        let index = free_index.ok_or_else(|| {
            Error::ResourceExhausted(format!("no free {strategy:?} panner lanes"))
        })?;

        let token = Arc::new(LaneToken { strategy, index });
        match strategy {
            PannerStrategy::Stereo => {
                self.stereo[index].reset();
                self.stereo[index].token = Arc::downgrade(&token);
            }
            PannerStrategy::Hrtf => {
                self.hrtf[index].reset();
                self.hrtf[index].token = Arc::downgrade(&token);
            }
        }
        Ok(token)
    }

    pub(crate) fn set_lane_angles(&mut self, token: &LaneToken, azimuth: f64, elevation: f64) {
        self.set_lane_pan(token, pan_from_angles(azimuth, elevation));
    }

    pub(crate) fn set_lane_pan(&mut self, token: &LaneToken, pan: f32) {
        match token.strategy {
            PannerStrategy::Stereo => self.stereo[token.index].set_pan(pan),
            PannerStrategy::Hrtf => self.hrtf[token.index].set_pan(pan),
        }
    }

    /// Writes one mono block into the lane, scaled by `gain`.
    pub(crate) fn write_lane(&mut self, token: &LaneToken, mono: &[f32], gain: f32) {
        let input = match token.strategy {
            PannerStrategy::Stereo => &mut self.stereo[token.index].input,
            PannerStrategy::Hrtf => &mut self.hrtf[token.index].input,
        };
        for i in 0..BLOCK_SIZE {
            input[i] = gain * mono[i];
        }
    }

    /// Renders every claimed lane into `dest` and clears lane inputs.
    pub(crate) fn run(&mut self, channels: usize, dest: &mut [f32]) {
        for lane in &mut self.stereo {
            if lane.token.strong_count() > 0 {
                lane.render(dest, channels);
            }
        }
        for lane in &mut self.hrtf {
            if lane.token.strong_count() > 0 {
                lane.render(dest, channels);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_exhaustion() {
        let mut bank = PannerBank::new();
        let tokens: Vec<_> = (0..PANNER_MAX_LANES)
            .map(|_| bank.allocate_lane(PannerStrategy::Hrtf).unwrap())
            .collect();
        let err = bank.allocate_lane(PannerStrategy::Hrtf).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // The other strategy still has lanes.
        bank.allocate_lane(PannerStrategy::Stereo).unwrap();
        drop(tokens);
        bank.allocate_lane(PannerStrategy::Hrtf).unwrap();
    }

    #[test]
    fn test_centered_stereo_lane_is_constant_power() {
        let mut bank = PannerBank::new();
        let token = bank.allocate_lane(PannerStrategy::Stereo).unwrap();
        let mono = vec![1.0f32; BLOCK_SIZE];
        bank.write_lane(&token, &mono, 1.0);

        let mut dest = vec![0.0f32; BLOCK_SIZE * 2];
        bank.run(2, &mut dest);

        let expected = (0.5f32).sqrt();
        assert!((dest[0] - expected).abs() < 1e-6);
        assert!((dest[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_hard_right_pan_silences_left() {
        let mut bank = PannerBank::new();
        let token = bank.allocate_lane(PannerStrategy::Stereo).unwrap();
        bank.set_lane_pan(&token, 1.0);
        let mono = vec![0.5f32; BLOCK_SIZE];
        bank.write_lane(&token, &mono, 1.0);

        let mut dest = vec![0.0f32; BLOCK_SIZE * 2];
        bank.run(2, &mut dest);

        // After the crossfade region the left channel is fully attenuated.
        let frame = BLOCK_SIZE - 1;
        assert!(dest[frame * 2].abs() < 1e-6);
        assert!((dest[frame * 2 + 1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_hrtf_lane_delays_far_ear() {
        let mut bank = PannerBank::new();
        let token = bank.allocate_lane(PannerStrategy::Hrtf).unwrap();
        bank.set_lane_angles(&token, 30.0, 0.0);

        // One silent block lets the pan-change crossfade settle.
        let mut dest = vec![0.0f32; BLOCK_SIZE * 2];
        bank.run(2, &mut dest);

        let mut mono = vec![0.0f32; BLOCK_SIZE];
        mono[0] = 1.0;
        bank.write_lane(&token, &mono, 1.0);
        dest.fill(0.0);
        bank.run(2, &mut dest);

        // The impulse reaches the right (near) ear at frame 0 and the left
        // (far) ear only after the interaural delay for pan = 0.5.
        assert!(dest[1] > 0.5);
        let delay = (0.5 * (HRTF_MAX_ITD - 1) as f32) as usize;
        for frame in 0..delay {
            assert_eq!(dest[frame * 2], 0.0);
        }
        assert!(dest[delay * 2] > 0.1);
    }

    #[test]
    fn test_lane_input_cleared_after_run() {
        let mut bank = PannerBank::new();
        let token = bank.allocate_lane(PannerStrategy::Stereo).unwrap();
        bank.write_lane(&token, &vec![1.0f32; BLOCK_SIZE], 1.0);
        let mut dest = vec![0.0f32; BLOCK_SIZE * 2];
        bank.run(2, &mut dest);

        dest.fill(0.0);
        bank.run(2, &mut dest);
        assert!(dest.iter().all(|&s| s == 0.0));
    }
}

//! Global effects: router-fed nodes contributing to the final mix.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::block_buffer::acquire_block_buffer;
use crate::channel_mixing::mix_channels;
use crate::config::{BLOCK_SIZE, SR};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fade::FadeDriver;
use crate::handle::{Exposable, HandleSlot};
use crate::properties::{PropertyDescriptor, PropertyHost, PropertyId, PropertyValue};
use crate::router::InputId;

/// A node that consumes audio arriving through the router and accumulates
/// its result into the mix. Effects may carry inter-block state.
pub trait GlobalEffect: Exposable {
    fn input_channels(&self) -> usize;

    /// Processes one block. `input` holds the router-accumulated audio for
    /// this effect; the result is added into `output`.
    fn run(
        &self,
        block_time: u64,
        input: &[f32],
        input_channels: usize,
        output: &mut [f32],
        output_channels: usize,
    );
}

/// One echo tap: a delay and a stereo gain pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoTapConfig {
    pub delay_seconds: f64,
    pub gain_l: f32,
    pub gain_r: f32,
}

#[derive(Debug, Clone, Copy)]
struct EchoTap {
    delay_frames: usize,
    gain_l: f32,
    gain_r: f32,
}

/// Delay line length in frames. Five seconds, rounded up to whole blocks.
const ECHO_MAX_DELAY: usize = (SR as usize * 5).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

struct EchoState {
    /// Interleaved stereo ring.
    line: Vec<f32>,
    write_pos: usize,
    taps: Vec<EchoTap>,
    /// Previous tap set, faded out over the block after a reconfigure.
    old_taps: Vec<EchoTap>,
    crossfade: bool,
    gain: f64,
    gain_changed: bool,
    gain_driver: FadeDriver,
}

/// A stereo tap-delay echo.
///
/// Tap sets are replaced atomically; the new set fades in over one block
/// while the old one fades out.
pub struct GlobalEcho {
    context: Arc<Context>,
    handle: HandleSlot,
    input_id: InputId,
    state: Mutex<EchoState>,
}

const ECHO_PROPERTIES: &[PropertyDescriptor] =
    &[PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX)];

impl GlobalEcho {
    pub fn new(context: &Arc<Context>) -> Result<Arc<Self>> {
        let effect = Arc::new(Self {
            context: context.clone(),
            handle: HandleSlot::new(),
            input_id: context.allocate_input_id(),
            state: Mutex::new(EchoState {
                line: vec![0.0; ECHO_MAX_DELAY * 2],
                write_pos: 0,
                taps: Vec::new(),
                old_taps: Vec::new(),
                crossfade: false,
                gain: 1.0,
                gain_changed: false,
                gain_driver: FadeDriver::new(1.0),
            }),
        });
        context.register_global_effect(&effect)?;
        Ok(effect)
    }

    /// Replaces the tap set. Takes effect at the next block with a one-block
    /// crossfade from the old set.
    pub fn set_taps(self: &Arc<Self>, taps: &[EchoTapConfig]) -> Result<()> {
        let mut converted = Vec::with_capacity(taps.len());
        for tap in taps {
            let delay_frames = (tap.delay_seconds * SR as f64).round() as usize;
            if tap.delay_seconds < 0.0 || delay_frames >= ECHO_MAX_DELAY {
                return Err(Error::InvalidArgument(format!(
                    "echo tap delay {} is outside [0, 5) seconds",
                    tap.delay_seconds
                ))
                .record());
            }
            converted.push(EchoTap {
                delay_frames,
                gain_l: tap.gain_l,
                gain_r: tap.gain_r,
            });
        }

        let effect = self.clone();
        self.context.post_internal(move |_| {
            let mut state = effect.state.lock().unwrap();
            state.old_taps = std::mem::replace(&mut state.taps, converted);
            state.crossfade = true;
        })
    }
}

fn tap_sum(line: &[f32], base: usize, taps: &[EchoTap]) -> (f32, f32) {
    let frames = ECHO_MAX_DELAY;
    let mut l = 0.0;
    let mut r = 0.0;
    for tap in taps {
        let read = (base + frames - tap.delay_frames) % frames;
        l += line[read * 2] * tap.gain_l;
        r += line[read * 2 + 1] * tap.gain_r;
    }
    (l, r)
}

impl GlobalEffect for GlobalEcho {
    fn input_channels(&self) -> usize {
        2
    }

    fn run(
        &self,
        block_time: u64,
        input: &[f32],
        input_channels: usize,
        output: &mut [f32],
        output_channels: usize,
    ) {
        debug_assert_eq!(input_channels, 2);
        let mut state = self.state.lock().unwrap();

        if state.gain_changed {
            let target = state.gain;
            state.gain_driver.set_value(block_time, target);
            state.gain_changed = false;
        }

        // Feed the line first so taps shorter than a block still work.
        let write_pos = state.write_pos;
        for i in 0..BLOCK_SIZE {
            let slot = (write_pos + i) % ECHO_MAX_DELAY;
            state.line[slot * 2] = input[i * 2];
            state.line[slot * 2 + 1] = input[i * 2 + 1];
        }

        let mut scratch_guard = acquire_block_buffer();
        let scratch = scratch_guard.as_mut_slice();
        for i in 0..BLOCK_SIZE {
            let base = (write_pos + i) % ECHO_MAX_DELAY;
            let (mut l, mut r) = tap_sum(&state.line, base, &state.taps);
            if state.crossfade {
                let (old_l, old_r) = tap_sum(&state.line, base, &state.old_taps);
                let w2 = i as f32 / BLOCK_SIZE as f32;
                let w1 = 1.0 - w2;
                l = w1 * old_l + w2 * l;
                r = w1 * old_r + w2 * r;
            }
            scratch[i * 2] = l;
            scratch[i * 2 + 1] = r;
        }

        state.write_pos = (write_pos + BLOCK_SIZE) % ECHO_MAX_DELAY;
        if state.crossfade {
            state.crossfade = false;
            state.old_taps.clear();
        }

        state.gain_driver.drive(block_time, |gain| {
            for i in 0..BLOCK_SIZE {
                let g = gain(i);
                scratch[i * 2] *= g;
                scratch[i * 2 + 1] *= g;
            }
        });

        mix_channels(BLOCK_SIZE, scratch, 2, output, output_channels);
    }
}

impl PropertyHost for GlobalEcho {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        ECHO_PROPERTIES
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        match id {
            PropertyId::Gain => Ok(PropertyValue::Double(self.state.lock().unwrap().gain)),
            other => Err(Error::PropertyDoesNotExist(format!("{other:?}"))),
        }
    }

    fn set_property(&self, id: PropertyId, value: PropertyValue) -> Result<()> {
        match (id, value) {
            (PropertyId::Gain, PropertyValue::Double(v)) => {
                let mut state = self.state.lock().unwrap();
                state.gain = v;
                state.gain_changed = true;
                Ok(())
            }
            (other, value) => Err(Error::PropertyType(format!(
                "cannot set {other:?} to {value:?}"
            ))),
        }
    }
}

impl Exposable for GlobalEcho {
    fn handle_slot(&self) -> &HandleSlot {
        &self.handle
    }

    fn context_ref(&self) -> Option<Arc<Context>> {
        Some(self.context.clone())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn kind_name(&self) -> &'static str {
        "echo"
    }

    fn input_endpoint(&self) -> Option<InputId> {
        Some(self.input_id)
    }
}

//! Generators: block producers consumed by sources.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::block_buffer::acquire_block_buffer;
use crate::buffer::Buffer;
use crate::config::{BLOCK_SIZE, SR};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::fade::FadeDriver;
use crate::handle::{Exposable, HandleSlot};
use crate::pausable::Pausable;
use crate::properties::{PropertyDescriptor, PropertyHost, PropertyId, PropertyValue};

/// A node that produces one block of interleaved audio on demand.
///
/// `run` adds exactly `channels() * BLOCK_SIZE` samples into `output` and
/// must not block, allocate, or call back out of the audio thread. A channel
/// count of zero means "silent this block" and the source skips the
/// generator.
pub trait Generator: Exposable {
    fn channels(&self) -> usize;
    fn run(&self, block_time: u64, output: &mut [f32]);
}

struct BufferGeneratorState {
    buffer: Option<Arc<Buffer>>,
    /// Playhead in frames; fractional under pitch bend.
    position: f64,
    pending_seek: Option<f64>,
    looping: bool,
    pitch_bend: f64,
    gain: f64,
    gain_changed: bool,
    gain_driver: FadeDriver,
    pausable: Pausable,
    finished_emitted: bool,
}

/// Plays a [`Buffer`], with looping, seeking, and pitch bend.
pub struct BufferGenerator {
    context: Arc<Context>,
    handle: HandleSlot,
    state: Mutex<BufferGeneratorState>,
}

const BUFFER_GENERATOR_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX),
    PropertyDescriptor::object(PropertyId::Buffer, object_is_buffer, "buffer"),
    PropertyDescriptor::int(PropertyId::Looping, 0, 1),
    PropertyDescriptor::double(PropertyId::PlaybackPosition, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::PitchBend, 0.5, 2.0),
];

fn object_is_buffer(obj: &Arc<dyn Exposable>) -> bool {
    obj.clone().into_any().downcast::<Buffer>().is_ok()
}

impl BufferGenerator {
    pub fn new(context: &Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            handle: HandleSlot::new(),
            state: Mutex::new(BufferGeneratorState {
                buffer: None,
                position: 0.0,
                pending_seek: None,
                looping: false,
                pitch_bend: 1.0,
                gain: 1.0,
                gain_changed: false,
                gain_driver: FadeDriver::new(1.0),
                pausable: Pausable::new(),
                finished_emitted: false,
            }),
        })
    }

    /// Pauses playback; the fade out spans one block.
    pub fn pause(self: &Arc<Self>) -> Result<()> {
        let generator = self.clone();
        self.context
            .post_internal(move |_| generator.state.lock().unwrap().pausable.pause())
    }

    pub fn play(self: &Arc<Self>) -> Result<()> {
        let generator = self.clone();
        self.context
            .post_internal(move |_| generator.state.lock().unwrap().pausable.play())
    }

    fn emit(&self, kind: EventKind) {
        self.context.emit_event(kind, self.handle.get());
    }

    /// Frame-copy fast path for unity pitch.
    fn generate_plain(&self, state: &mut BufferGeneratorState, buffer: &Buffer, out: &mut [f32]) {
        let channels = buffer.channels();
        let mut pos = state.position.round() as usize;
        let mut written = 0usize;
        let mut remaining = BLOCK_SIZE;

        while remaining > 0 {
            let got = buffer.read_frames(pos, remaining, &mut out[written..]);
            written += got * channels;
            pos += got;
            remaining -= got;
            if remaining > 0 {
                if state.looping {
                    pos = 0;
                    self.emit(EventKind::Looped);
                } else {
                    if !state.finished_emitted {
                        state.finished_emitted = true;
                        self.emit(EventKind::Finished);
                    }
                    break;
                }
            }
        }
        state.position = pos as f64;
    }

    /// Linear-interpolated read for non-unity pitch.
    fn generate_pitch_bend(
        &self,
        state: &mut BufferGeneratorState,
        buffer: &Buffer,
        out: &mut [f32],
    ) {
        let channels = buffer.channels();
        let length = buffer.len() as f64;
        let mut pos = state.position;
        let delta = state.pitch_bend;
        let mut lower_frame = [0.0f32; crate::config::MAX_CHANNELS];
        let mut upper_frame = [0.0f32; crate::config::MAX_CHANNELS];

        for i in 0..BLOCK_SIZE {
            let lower = pos.floor() as usize;
            let mut upper = lower + 1;
            if state.looping {
                upper %= buffer.len();
            }
            let w2 = (pos - lower as f64) as f32;
            let w1 = 1.0 - w2;
            buffer.read_frame(lower, &mut lower_frame);
            buffer.read_frame(upper, &mut upper_frame);
            for ch in 0..channels {
                out[i * channels + ch] = lower_frame[ch] * w1 + upper_frame[ch] * w2;
            }

            pos += delta;
            if state.looping {
                if pos >= length {
                    pos %= length;
                    self.emit(EventKind::Looped);
                }
            } else if pos >= length {
                if !state.finished_emitted {
                    state.finished_emitted = true;
                    self.emit(EventKind::Finished);
                }
                break;
            }
        }
        state.position = pos.min(length);
    }
}

impl Generator for BufferGenerator {
    fn channels(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .buffer
            .as_ref()
            .map(|b| b.channels())
            .unwrap_or(0)
    }

    fn run(&self, block_time: u64, output: &mut [f32]) {
        let mut state = self.state.lock().unwrap();
        let Some(buffer) = state.buffer.clone() else {
            return;
        };
        if buffer.is_empty() {
            return;
        }

        if let Some(seconds) = state.pending_seek.take() {
            state.position = (seconds * SR as f64).min(buffer.len() as f64);
            state.finished_emitted = false;
        }

        if state.gain_changed || state.pausable.needs_gain_update() {
            let target = state.gain * state.pausable.gain_factor();
            state.gain_driver.set_value(block_time, target);
            state.gain_changed = false;
        }
        if state.pausable.is_paused() {
            return;
        }
        state.pausable.tick();

        let channels = buffer.channels();
        let mut scratch_guard = acquire_block_buffer();
        let scratch = scratch_guard.as_mut_slice();

        if (1.0 - state.pitch_bend).abs() > 0.001 {
            self.generate_pitch_bend(&mut state, &buffer, scratch);
        } else {
            self.generate_plain(&mut state, &buffer, scratch);
        }

        state.gain_driver.drive(block_time, |gain| {
            for i in 0..BLOCK_SIZE {
                let g = gain(i);
                for ch in 0..channels {
                    output[i * channels + ch] += scratch[i * channels + ch] * g;
                }
            }
        });
    }
}

impl PropertyHost for BufferGenerator {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        BUFFER_GENERATOR_PROPERTIES
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        let state = self.state.lock().unwrap();
        match id {
            PropertyId::Gain => Ok(PropertyValue::Double(state.gain)),
            PropertyId::Buffer => Ok(PropertyValue::Object(
                state
                    .buffer
                    .clone()
                    .map(|b| b as Arc<dyn Exposable>),
            )),
            PropertyId::Looping => Ok(PropertyValue::Int(state.looping as i32)),
            PropertyId::PlaybackPosition => {
                Ok(PropertyValue::Double(state.position / SR as f64))
            }
            PropertyId::PitchBend => Ok(PropertyValue::Double(state.pitch_bend)),
            other => Err(Error::PropertyDoesNotExist(format!("{other:?}"))),
        }
    }

    fn set_property(&self, id: PropertyId, value: PropertyValue) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match (id, value) {
            (PropertyId::Gain, PropertyValue::Double(v)) => {
                state.gain = v;
                state.gain_changed = true;
            }
            (PropertyId::Buffer, PropertyValue::Object(obj)) => {
                state.buffer = match obj {
                    Some(o) => Some(o.into_any().downcast::<Buffer>().map_err(|_| {
                        Error::HandleType("buffer generator expects a buffer".into())
                    })?),
                    None => None,
                };
                state.position = 0.0;
                state.pending_seek = None;
                state.finished_emitted = false;
            }
            (PropertyId::Looping, PropertyValue::Int(v)) => {
                state.looping = v != 0;
                if state.looping {
                    state.finished_emitted = false;
                }
            }
            (PropertyId::PlaybackPosition, PropertyValue::Double(v)) => {
                state.pending_seek = Some(v);
            }
            (PropertyId::PitchBend, PropertyValue::Double(v)) => {
                state.pitch_bend = v;
            }
            (other, value) => {
                return Err(Error::PropertyType(format!(
                    "cannot set {other:?} to {value:?}"
                )))
            }
        }
        Ok(())
    }
}

impl Exposable for BufferGenerator {
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
        "buffer_generator"
    }
}

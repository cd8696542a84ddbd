//! Immutable chunked PCM storage.
//!
//! Buffers hold decoded audio as a list of fixed-size pages so that very
//! large assets never need one contiguous allocation. They are immutable and
//! freely shared between generators; the external handle and any generator
//! each hold their own strong reference.

use std::any::Any;
use std::sync::Arc;

use crate::config::{BUFFER_CHUNK_SIZE, MAX_CHANNELS, SR};
use crate::error::{Error, Result};
use crate::handle::{Exposable, HandleSlot};
use crate::properties::{PropertyDescriptor, PropertyHost, PropertyId, PropertyValue};

#[derive(Debug)]
pub struct Buffer {
    handle: HandleSlot,
    channels: usize,
    frames: usize,
    chunks: Vec<Box<[f32]>>,
}

impl Buffer {
    /// Builds a buffer from interleaved samples at the engine sample rate.
    pub fn from_interleaved(channels: usize, samples: &[f32]) -> Result<Arc<Self>> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(
                Error::InvalidArgument(format!("unsupported channel count {channels}")).record(),
            );
        }
        if samples.len() % channels != 0 {
            return Err(Error::InvalidArgument(
                "sample count is not a multiple of the channel count".into(),
            )
            .record());
        }

        let chunks = samples
            .chunks(BUFFER_CHUNK_SIZE)
            .map(|c| c.to_vec().into_boxed_slice())
            .collect();

        Ok(Arc::new(Self {
            handle: HandleSlot::new(),
            channels,
            frames: samples.len() / channels,
            chunks,
        }))
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Length in frames.
    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames as f64 / SR as f64
    }

    #[inline]
    fn sample(&self, index: usize) -> f32 {
        self.chunks[index / BUFFER_CHUNK_SIZE][index % BUFFER_CHUNK_SIZE]
    }

    /// Reads one frame into `out[..channels]`. Out-of-range frames read as
    /// silence.
    pub fn read_frame(&self, frame: usize, out: &mut [f32]) {
        if frame >= self.frames {
            out[..self.channels].fill(0.0);
            return;
        }
        let base = frame * self.channels;
        for ch in 0..self.channels {
            out[ch] = self.sample(base + ch);
        }
    }

    /// Copies up to `max_frames` frames starting at `start` into `dst`,
    /// returning how many frames were copied. Stops early at the buffer end;
    /// the caller handles looping.
    pub fn read_frames(&self, start: usize, max_frames: usize, dst: &mut [f32]) -> usize {
        if start >= self.frames {
            return 0;
        }
        let frames = max_frames.min(self.frames - start);
        let mut sample_index = start * self.channels;
        let mut remaining = frames * self.channels;
        let mut written = 0;

        while remaining > 0 {
            let chunk = &self.chunks[sample_index / BUFFER_CHUNK_SIZE];
            let offset = sample_index % BUFFER_CHUNK_SIZE;
            let run = remaining.min(chunk.len() - offset);
            dst[written..written + run].copy_from_slice(&chunk[offset..offset + run]);
            sample_index += run;
            written += run;
            remaining -= run;
        }
        frames
    }
}

impl PropertyHost for Buffer {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        &[]
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }

    fn set_property(&self, id: PropertyId, _value: PropertyValue) -> Result<()> {
        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }
}

impl Exposable for Buffer {
    fn handle_slot(&self) -> &HandleSlot {
        &self.handle
    }

    fn context_ref(&self) -> Option<Arc<crate::context::Context>> {
        None
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn kind_name(&self) -> &'static str {
        "buffer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_across_chunk_boundary() {
        let samples: Vec<f32> = (0..BUFFER_CHUNK_SIZE + 8).map(|i| i as f32).collect();
        let buffer = Buffer::from_interleaved(1, &samples).unwrap();

        let start = BUFFER_CHUNK_SIZE - 4;
        let mut dst = [0.0f32; 8];
        let got = buffer.read_frames(start, 8, &mut dst);
        assert_eq!(got, 8);
        for (i, &s) in dst.iter().enumerate() {
            assert_eq!(s, (start + i) as f32);
        }
    }

    #[test]
    fn test_read_clamps_at_end() {
        let buffer = Buffer::from_interleaved(2, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(buffer.len(), 2);
        let mut dst = [0.0f32; 16];
        assert_eq!(buffer.read_frames(1, 8, &mut dst), 1);
        assert_eq!(&dst[..2], &[0.3, 0.4]);
    }

    #[test]
    fn test_bad_channel_count_rejected() {
        assert!(Buffer::from_interleaved(0, &[]).is_err());
        assert!(Buffer::from_interleaved(MAX_CHANNELS + 1, &[0.0; 34]).is_err());
    }

    #[test]
    fn test_frame_read_out_of_range_is_silent() {
        let buffer = Buffer::from_interleaved(1, &[1.0]).unwrap();
        let mut out = [9.0f32; 1];
        buffer.read_frame(5, &mut out);
        assert_eq!(out[0], 0.0);
    }
}

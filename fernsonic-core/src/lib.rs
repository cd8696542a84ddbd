//! Fernsonic: an embeddable, low-latency 3D audio engine.
//!
//! A [`Context`] owns an audio thread that renders fixed-size blocks of
//! interleaved floats through a spatialization pipeline: generators feed
//! sources, sources feed a panner bank or the direct mix, the router fans
//! sources out to global effects, and everything lands in one output block
//! per iteration. External threads mutate the graph only through validated
//! property writes, commands, and handle frees, all of which the audio
//! thread applies at block boundaries.
//!
//! # Example
//!
//! ```no_run
//! use fernsonic_core::{
//!     Buffer, BufferGenerator, Context, Exposable, Generator, PropertyId, Source,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> fernsonic_core::Result<()> {
//! let context = Context::new_with_device(2)?;
//! let buffer = Buffer::from_interleaved(1, &[0.0; 44100])?;
//! let generator = BufferGenerator::new(&context);
//! context.set_object(
//!     generator.clone(),
//!     PropertyId::Buffer,
//!     Some(buffer as Arc<dyn Exposable>),
//! )?;
//! let source = Source::new_3d(&context)?;
//! source.add_generator(&(generator as Arc<dyn Generator>))?;
//! # Ok(())
//! # }
//! ```

pub mod config;

mod audio_output;
mod block_buffer;
mod buffer;
mod channel_mixing;
mod command;
mod context;
mod deletion;
mod effects;
mod error;
mod events;
mod fade;
mod filters;
mod generator;
mod handle;
mod math;
mod panner;
mod pausable;
mod properties;
mod router;
mod source;

pub use buffer::Buffer;
pub use context::Context;
pub use effects::{EchoTapConfig, GlobalEcho, GlobalEffect};
pub use error::{last_error, last_error_message, Error, Result};
pub use events::{Event, EventKind};
pub use filters::{
    design_bandpass, design_highpass, design_lowpass, BiquadConfig, BiquadFilter,
};
pub use generator::{BufferGenerator, Generator};
pub use handle::{Exposable, Handle, HandleSlot, HandleTable};
pub use math::{DistanceModel, DistanceParams, ListenerPose};
pub use panner::PannerStrategy;
pub use properties::{
    PropertyDescriptor, PropertyHost, PropertyId, PropertyKind, PropertyValue,
};
pub use source::Source;

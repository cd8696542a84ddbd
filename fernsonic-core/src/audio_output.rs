//! Device output: adapts the per-block pull model to a cpal stream.
//!
//! The stream object is not sendable, so a dedicated thread builds and owns
//! it, then parks until shutdown. The stream's callback thread is the
//! context's audio thread: it pulls fixed-size blocks and re-slices them
//! into whatever buffer size the device asked for.
//!
//! The device is expected to run at the engine sample rate; rate conversion
//! is a host concern and lives outside the core.

use std::sync::Weak;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{bounded, Sender};

use crate::config::{BLOCK_SIZE, SR};
use crate::context::Context;
use crate::error::{Error, Result};

pub(crate) struct AudioOutput {
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl AudioOutput {
    /// Spawns the output thread and starts the stream. Fails if the device
    /// cannot be opened with the requested layout at the engine rate.
    pub(crate) fn start(context: Weak<Context>, channels: usize) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let join = std::thread::Builder::new()
            .name("fernsonic-output".into())
            .spawn(move || {
                let stream = match build_stream(context, channels) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until shutdown; dropping the stream stops callbacks.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| Error::Io(format!("failed to spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e.record())
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::Internal("output thread died during startup".into()).record())
            }
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn build_stream(context: Weak<Context>, channels: usize) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Io("no default output device available".into()))?;
    let device_config = device
        .default_output_config()
        .map_err(|e| Error::Io(format!("failed to get default output config: {e}")))?;

    log::info!(
        "Opening output device at {} Hz, {} channels",
        SR,
        channels
    );

    let config = cpal::StreamConfig {
        channels: channels as cpal::ChannelCount,
        sample_rate: cpal::SampleRate(SR),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match device_config.sample_format() {
        cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, context, channels)?,
        cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, context, channels)?,
        cpal::SampleFormat::U16 => build_typed::<u16>(&device, &config, context, channels)?,
        other => {
            return Err(Error::Io(format!("unsupported sample format {other}")));
        }
    };

    stream
        .play()
        .map_err(|e| Error::Io(format!("failed to start stream: {e}")))?;
    Ok(stream)
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    context: Weak<Context>,
    channels: usize,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    // One rendered block, re-sliced across device callbacks of any size.
    let mut block = vec![0.0f32; channels * BLOCK_SIZE];
    let mut cursor = block.len();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    if cursor >= block.len() {
                        match context.upgrade() {
                            Some(ctx) => {
                                if ctx.generate_audio(channels, &mut block).is_err() {
                                    block.fill(0.0);
                                }
                            }
                            None => block.fill(0.0),
                        }
                        cursor = 0;
                    }
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        *sample = T::from_sample(block[cursor + ch]);
                    }
                    cursor += channels;
                }
            },
            move |err| {
                log::error!("Audio stream error: {err}");
            },
            None,
        )
        .map_err(|e| Error::Io(format!("failed to build stream: {e}")))?;

    Ok(stream)
}

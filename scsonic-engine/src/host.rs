//! Drives the processor from a real output device.
//!
//! The processor itself is host-agnostic: any periodic callback that
//! hands it interleaved blocks will do. This module wires it into a cpal
//! output stream for native use; there is no capture stream here, the
//! engine's input buses just see silence.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;

use scsonic_types::{Error, Result};

use crate::processor::AudioProcessor;

/// A running output stream. Dropping it stops the callbacks.
pub struct AudioHost {
    _stream: cpal::Stream,
    pub sample_rate: u32,
}

/// Open the default output device and start clocking the processor.
pub fn start_output(mut processor: AudioProcessor) -> Result<AudioHost> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::EngineError("no output device available".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| Error::EngineError(format!("output config: {e}")))?;

    let sample_rate = config.sample_rate().0;
    let stream_config: StreamConfig = config.into();
    let device_channels = stream_config.channels as usize;

    let layout = processor.region().layout().clone();
    let frames = layout.block_frames;
    let out_ch = layout.output_channels;
    let silence = vec![0.0f32; layout.input_channels * frames];
    let mut block = vec![0.0f32; out_ch * frames];
    let mut clock_frames: u64 = 0;

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // The device buffer may span several engine blocks.
                for chunk in data.chunks_mut(device_channels * frames) {
                    let clock_seconds = clock_frames as f64 / sample_rate as f64;
                    processor.process(&silence, &mut block, clock_seconds);
                    clock_frames += frames as u64;

                    let chunk_frames = chunk.len() / device_channels;
                    for frame in 0..chunk_frames.min(frames) {
                        for ch in 0..device_channels {
                            chunk[frame * device_channels + ch] =
                                block[frame * out_ch + ch.min(out_ch - 1)];
                        }
                    }
                }
            },
            |err| {
                log::error!(target: "engine::host", "output stream error: {err}");
            },
            None,
        )
        .map_err(|e| Error::EngineError(format!("build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::EngineError(format!("start output stream: {e}")))?;

    Ok(AudioHost {
        _stream: stream,
        sample_rate,
    })
}

use std::time::{Duration, Instant};

use crate::Result;

/// Sink for rendered blocks, driven by the render thread.
pub trait AudioOutput: Send {
    /// Consumes one interleaved block. May block to pace rendering.
    fn write_block(&mut self, block: &[f32]) -> Result<()>;

    /// Called when rendering pauses, so pacing restarts from scratch.
    fn reset(&mut self) {}
}

/// Source of live input copied into the engine before each block.
pub trait AudioInput: Send {
    /// Fills `block` and returns `false` when no input is available.
    fn read_block(&mut self, block: &mut [f32]) -> bool;
}

/// Drops every block. Renders as fast as the engine allows.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardOutput;

impl AudioOutput for DiscardOutput {
    fn write_block(&mut self, _block: &[f32]) -> Result<()> {
        Ok(())
    }
}

/// Sleeps so blocks are consumed in real time without a device.
#[derive(Debug, Clone)]
pub struct PacedOutput {
    block_duration: Duration,
    deadline: Option<Instant>,
}

impl PacedOutput {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            block_duration: Duration::from_secs_f64(block_size as f64 / sample_rate as f64),
            deadline: None,
        }
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }
}

impl AudioOutput for PacedOutput {
    fn write_block(&mut self, _block: &[f32]) -> Result<()> {
        let now = Instant::now();
        let deadline = self.deadline.unwrap_or(now) + self.block_duration;
        if deadline > now {
            std::thread::sleep(deadline - now);
            self.deadline = Some(deadline);
        } else {
            // Fell behind; resynchronise instead of bursting to catch up.
            self.deadline = Some(now);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.deadline = None;
    }
}

#[cfg(feature = "device")]
pub use device::{DeviceOutput, DeviceStream};

#[cfg(feature = "device")]
mod device {
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use ringbuf::traits::{Consumer, Producer, Split};
    use ringbuf::{HeapProd, HeapRb};
    use tracing::{error, info};

    use super::AudioOutput;
    use crate::{BridgeError, Result};

    /// Blocks buffered between the render thread and the device callback.
    const BUFFERED_BLOCKS: usize = 16;

    type Signal = Arc<(Mutex<()>, Condvar)>;

    /// Keeps the device stream alive. Must stay on the thread that opened it.
    pub struct DeviceStream {
        _stream: cpal::Stream,
        sample_rate: u32,
    }

    impl DeviceStream {
        pub fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
    }

    /// Render-thread side of the default output device.
    pub struct DeviceOutput {
        producer: HeapProd<f32>,
        signal: Signal,
    }

    impl DeviceOutput {
        /// Opens the default device with `channels` interleaved channels.
        pub fn open(channels: usize, block_size: usize) -> Result<(Self, DeviceStream)> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| BridgeError::msg("no audio output device available"))?;
            let default = device
                .default_output_config()
                .map_err(|e| BridgeError::msg(format!("failed to query output config: {e}")))?;
            let sample_rate = default.sample_rate().0;
            let config = cpal::StreamConfig {
                channels: channels as u16,
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let ring = HeapRb::<f32>::new(block_size * channels * BUFFERED_BLOCKS);
            let (producer, mut consumer) = ring.split();
            let signal: Signal = Arc::new((Mutex::new(()), Condvar::new()));
            let callback_signal = Arc::clone(&signal);

            let stream = match default.sample_format() {
                cpal::SampleFormat::I16 => {
                    let mut scratch = vec![0.0f32; 4096];
                    device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            if scratch.len() < data.len() {
                                scratch.resize(data.len(), 0.0);
                            }
                            let popped = consumer.pop_slice(&mut scratch[..data.len()]);
                            for (out, sample) in data.iter_mut().zip(&scratch[..popped]) {
                                *out = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                            }
                            data[popped..].fill(0);
                            callback_signal.1.notify_one();
                        },
                        |err| error!("audio stream error: {err}"),
                        None,
                    )
                }
                _ => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let popped = consumer.pop_slice(data);
                        data[popped..].fill(0.0);
                        callback_signal.1.notify_one();
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                ),
            }
            .map_err(|e| BridgeError::msg(format!("failed to build output stream: {e}")))?;

            stream
                .play()
                .map_err(|e| BridgeError::msg(format!("failed to start output stream: {e}")))?;
            info!(sample_rate, channels, "output device opened");

            Ok((
                Self { producer, signal },
                DeviceStream {
                    _stream: stream,
                    sample_rate,
                },
            ))
        }
    }

    impl AudioOutput for DeviceOutput {
        fn write_block(&mut self, block: &[f32]) -> Result<()> {
            let mut written = 0;
            while written < block.len() {
                written += self.producer.push_slice(&block[written..]);
                if written < block.len() {
                    let (lock, condvar) = &*self.signal;
                    let guard = lock
                        .lock()
                        .map_err(|_| BridgeError::msg("device signal has been poisoned"))?;
                    let _ = condvar.wait_timeout(guard, Duration::from_millis(10));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paced_output_holds_real_time() {
        let mut output = PacedOutput::new(48, 48_000);
        assert_eq!(output.block_duration(), Duration::from_millis(1));

        let start = Instant::now();
        for _ in 0..20 {
            output.write_block(&[0.0; 96]).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn reset_forgets_the_schedule() {
        let mut output = PacedOutput::new(48, 48_000);
        output.write_block(&[]).unwrap();
        output.reset();
        assert!(output.deadline.is_none());
    }
}

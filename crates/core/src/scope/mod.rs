//! Waveform capture of the rendered output.
//!
//! The render thread appends every block to a ring and publishes a copy every
//! report interval. [`ScopeCapture`] reads the newest copy on its own schedule
//! and turns it into per-channel polylines for a [`DrawSurface`].

mod triple_buffer;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::ScopeConfig;
use crate::{BridgeError, Result};

pub use triple_buffer::{snapshot_channel, SnapshotReader, SnapshotWriter};

/// Interleaved ring contents plus the next write position.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VisualizationSnapshot {
    pub samples: Vec<f32>,
    /// Index the next sample will be written to; the oldest sample.
    pub cursor: usize,
}

impl VisualizationSnapshot {
    pub fn silent(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            cursor: 0,
        }
    }

    /// Time-ordered copy of the ring, oldest sample first.
    pub fn window(&self) -> Vec<f32> {
        let cursor = self.cursor.min(self.samples.len());
        let (newer, older) = self.samples.split_at(cursor);
        older.iter().chain(newer).copied().collect()
    }
}

/// Render-thread side of the capture.
pub(crate) struct ScopeRing {
    writer: SnapshotWriter<VisualizationSnapshot>,
    ring: Vec<f32>,
    cursor: usize,
}

impl ScopeRing {
    pub(crate) fn new(capacity: usize) -> (Self, SnapshotReader<VisualizationSnapshot>) {
        let (writer, reader) = snapshot_channel(VisualizationSnapshot::silent(capacity));
        let ring = Self {
            writer,
            ring: vec![0.0; capacity],
            cursor: 0,
        };
        (ring, reader)
    }

    pub(crate) fn append(&mut self, block: &[f32]) {
        let len = self.ring.len();
        if len == 0 {
            return;
        }
        for &sample in block {
            self.ring[self.cursor] = sample;
            self.cursor = (self.cursor + 1) % len;
        }
    }

    pub(crate) fn publish(&mut self) {
        let back = self.writer.back_mut();
        back.samples.copy_from_slice(&self.ring);
        back.cursor = self.cursor;
        self.writer.publish();
    }
}

/// One vertex of a channel's trace, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopePoint {
    pub x: f32,
    pub y: f32,
    /// The sample reached full scale.
    pub clipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub channel: usize,
    pub points: Vec<ScopePoint>,
}

impl Polyline {
    pub fn clipped(&self) -> bool {
        self.points.iter().any(|p| p.clipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeFrame {
    pub width: u32,
    pub height: u32,
    pub polylines: Vec<Polyline>,
}

/// Maps an interleaved window onto one polyline per channel.
///
/// Amplitude -1..1 spans the full height with +1 at the top; samples with
/// magnitude of at least 1 are flagged as clipped.
pub fn render_frame(window: &[f32], channels: usize, width: u32, height: u32) -> ScopeFrame {
    let channels = channels.max(1);
    let frames = window.len() / channels;
    let x_step = if frames > 1 {
        width.saturating_sub(1) as f32 / (frames - 1) as f32
    } else {
        0.0
    };
    let half = height as f32 * 0.5;

    let polylines = (0..channels)
        .map(|channel| Polyline {
            channel,
            points: window
                .chunks_exact(channels)
                .enumerate()
                .map(|(i, frame)| {
                    let sample = frame[channel];
                    ScopePoint {
                        x: i as f32 * x_step,
                        y: (half - sample.clamp(-1.0, 1.0) * half).clamp(0.0, height as f32),
                        clipped: sample.abs() >= 1.0,
                    }
                })
                .collect(),
        })
        .collect();

    ScopeFrame {
        width,
        height,
        polylines,
    }
}

/// Destination for drawn frames.
pub trait DrawSurface: Send {
    fn draw(&mut self, frame: &ScopeFrame);

    /// Removes whatever was last drawn.
    fn clear(&mut self) {}
}

type SharedSurface = Arc<Mutex<Option<Box<dyn DrawSurface>>>>;

/// Control-side reader of the render thread's waveform snapshots.
pub struct ScopeCapture {
    reader: Arc<Mutex<SnapshotReader<VisualizationSnapshot>>>,
    config: ScopeConfig,
    channels: usize,
    surface: SharedSurface,
    last_frame: Arc<Mutex<Option<ScopeFrame>>>,
    draw_task: Mutex<Option<JoinHandle<()>>>,
}

impl ScopeCapture {
    pub fn new(
        reader: SnapshotReader<VisualizationSnapshot>,
        channels: usize,
        config: ScopeConfig,
    ) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            config,
            channels,
            surface: Arc::new(Mutex::new(None)),
            last_frame: Arc::new(Mutex::new(None)),
            draw_task: Mutex::new(None),
        }
    }

    /// Cursor of the newest snapshot.
    pub fn current_frame(&self) -> Result<usize> {
        Ok(lock(&self.reader, "scope reader")?.with(|snapshot| snapshot.cursor))
    }

    /// Raw copy of the newest snapshot.
    pub fn snapshot(&self) -> Result<VisualizationSnapshot> {
        Ok(lock(&self.reader, "scope reader")?.with(Clone::clone))
    }

    /// Newest snapshot in time order.
    pub fn window(&self) -> Result<Vec<f32>> {
        Ok(lock(&self.reader, "scope reader")?.with(VisualizationSnapshot::window))
    }

    pub fn last_frame(&self) -> Option<ScopeFrame> {
        lock(&self.last_frame, "scope frame").ok()?.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.draw_task, "scope draw task")
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Starts drawing into `surface` at the configured frame rate, replacing
    /// any running draw loop.
    pub fn start(&self, surface: impl DrawSurface + 'static) -> Result<()> {
        self.stop()?;
        *lock(&self.surface, "scope surface")? = Some(Box::new(surface));

        let reader = Arc::clone(&self.reader);
        let surface = Arc::clone(&self.surface);
        let last_frame = Arc::clone(&self.last_frame);
        let channels = self.channels;
        let (width, height) = (self.config.width, self.config.height);
        let period = Duration::from_secs_f64(1.0 / self.config.fps as f64);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let frame = match reader.lock() {
                    Ok(mut guard) => guard.with(|snapshot| {
                        render_frame(&snapshot.window(), channels, width, height)
                    }),
                    Err(_) => break,
                };

                if let Ok(mut guard) = surface.lock() {
                    if let Some(surface) = guard.as_mut() {
                        surface.draw(&frame);
                    }
                }
                trace!(polylines = frame.polylines.len(), "scope frame drawn");
                if let Ok(mut last) = last_frame.lock() {
                    *last = Some(frame);
                }
            }
        });

        *lock(&self.draw_task, "scope draw task")? = Some(task);
        debug!(fps = self.config.fps, "scope draw loop started");
        Ok(())
    }

    /// Cancels the draw loop and clears the last frame. Safe to call repeatedly.
    pub fn stop(&self) -> Result<()> {
        if let Some(task) = lock(&self.draw_task, "scope draw task")?.take() {
            task.abort();
            debug!("scope draw loop stopped");
        }
        if let Some(mut surface) = lock(&self.surface, "scope surface")?.take() {
            surface.clear();
        }
        *lock(&self.last_frame, "scope frame")? = None;
        Ok(())
    }
}

impl Drop for ScopeCapture {
    fn drop(&mut self) {
        if let Ok(mut task) = self.draw_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for ScopeCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeCapture")
            .field("channels", &self.channels)
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| BridgeError::msg(format!("{what} has been poisoned")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSurface {
        frames: Arc<Mutex<Vec<ScopeFrame>>>,
        cleared: Arc<Mutex<bool>>,
    }

    impl DrawSurface for RecordingSurface {
        fn draw(&mut self, frame: &ScopeFrame) {
            self.frames.lock().unwrap().push(frame.clone());
        }

        fn clear(&mut self) {
            *self.cleared.lock().unwrap() = true;
        }
    }

    #[test]
    fn window_splits_at_the_cursor() {
        let snapshot = VisualizationSnapshot {
            samples: vec![4.0, 5.0, 1.0, 2.0, 3.0],
            cursor: 2,
        };
        assert_eq!(snapshot.window(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn frames_map_amplitude_to_pixels_and_flag_clipping() {
        let window = [0.0, 1.0, -1.0, 0.5, 1.5, -0.5];
        let frame = render_frame(&window, 2, 101, 200);

        assert_eq!(frame.polylines.len(), 2);
        let left = &frame.polylines[0];
        assert_eq!(
            left.points.iter().map(|p| p.y).collect::<Vec<_>>(),
            vec![100.0, 200.0, 0.0]
        );
        assert_eq!(
            left.points.iter().map(|p| p.x).collect::<Vec<_>>(),
            vec![0.0, 50.0, 100.0]
        );
        assert_eq!(
            left.points.iter().map(|p| p.clipped).collect::<Vec<_>>(),
            vec![false, true, true]
        );
        assert!(frame.polylines[1].clipped());
        assert_eq!(frame.polylines[1].points[2].y, 150.0);
    }

    #[test]
    fn ring_publishes_wrapped_blocks() {
        let (mut ring, reader) = ScopeRing::new(4);
        let capture = ScopeCapture::new(reader, 2, ScopeConfig::default());

        ring.append(&[1.0, 2.0, 3.0]);
        ring.append(&[4.0, 5.0]);
        assert_eq!(capture.current_frame().unwrap(), 0);

        ring.publish();
        let snapshot = capture.snapshot().unwrap();
        assert_eq!(snapshot.samples, vec![5.0, 2.0, 3.0, 4.0]);
        assert_eq!(snapshot.cursor, 1);
        assert_eq!(capture.window().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn draw_loop_runs_until_stopped() {
        let (mut ring, reader) = ScopeRing::new(4);
        ring.append(&[0.5, -0.5, 1.0, 0.0]);
        ring.publish();

        let capture = ScopeCapture::new(
            reader,
            2,
            ScopeConfig {
                fps: 50,
                ..ScopeConfig::default()
            },
        );
        let surface = RecordingSurface::default();
        capture.start(surface.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(capture.is_running());
        assert!(surface.frames.lock().unwrap().len() >= 3);
        assert!(capture.last_frame().unwrap().polylines[0].clipped());

        capture.stop().unwrap();
        capture.stop().unwrap();
        assert!(!capture.is_running());
        assert!(capture.last_frame().is_none());
        assert!(*surface.cleared.lock().unwrap());

        let drawn = surface.frames.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(surface.frames.lock().unwrap().len(), drawn);
    }
}

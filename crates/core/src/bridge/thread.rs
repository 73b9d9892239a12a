//! Render thread: owns the engine and renders one block at a time.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::engine::{EngineLoader, RenderEngine};
use super::output::{AudioInput, AudioOutput};
use crate::config::AudioConfig;
use crate::scope::ScopeRing;
use crate::timeline::ClockTick;
use crate::{BridgeError, Result};

/// Control side to render thread.
#[derive(Debug)]
pub(crate) enum RenderMessage {
    Command(Vec<u8>),
    Pcm { offset: usize, data: Arc<[f32]> },
    Panic,
    Hush,
    Resume,
    Shutdown,
}

/// Render thread to control side.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Feedback {
    Ready {
        sample_rate: u32,
        pool_capacity: usize,
    },
    Failed(String),
    PcmLoaded { offset: usize },
    PcmRejected { offset: usize, reason: String },
    Tick(ClockTick),
    Suspended,
    Resumed,
    EngineFault(String),
}

pub(crate) struct RenderSetup {
    pub binary: Vec<u8>,
    pub loader: Arc<dyn EngineLoader>,
    pub output: Box<dyn AudioOutput>,
    pub input: Option<Box<dyn AudioInput>>,
    pub scope: ScopeRing,
    pub audio: AudioConfig,
}

pub(crate) fn spawn_render_thread(
    setup: RenderSetup,
    rx: Receiver<RenderMessage>,
    feedback: Sender<Feedback>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("doux-render".into())
        .spawn(move || {
            let RenderSetup {
                binary,
                loader,
                output,
                input,
                scope,
                audio,
            } = setup;

            let mut engine =
                match loader.instantiate(&binary, audio.sample_rate, audio.max_voices) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = feedback.send(Feedback::Failed(e.to_string()));
                        return;
                    }
                };
            drop(binary);

            if engine.output_len() != audio.block_len() {
                let reason = BridgeError::Engine(format!(
                    "engine output holds {} floats, a block needs {}",
                    engine.output_len(),
                    audio.block_len()
                ));
                let _ = feedback.send(Feedback::Failed(reason.to_string()));
                return;
            }

            let sample_rate = match engine.sample_rate() {
                Ok(rate) if rate > 0.0 => rate.round() as u32,
                _ => audio.sample_rate,
            };
            let start_time = engine.time().unwrap_or(0.0);
            let ready = Feedback::Ready {
                sample_rate,
                pool_capacity: engine.sample_capacity(),
            };
            if feedback.send(ready).is_err() {
                return;
            }

            RenderThread {
                block: vec![0.0; audio.block_len()],
                input_block: vec![0.0; audio.block_len()],
                report_latency: AudioConfig {
                    sample_rate,
                    ..audio.clone()
                }
                .report_interval_secs(),
                engine,
                rx,
                feedback,
                output,
                input,
                scope,
                audio,
                blocks: 0,
                last_report_time: start_time,
                suspended: false,
                hush_remaining: None,
            }
            .run();
        })?;
    Ok(handle)
}

struct RenderThread {
    engine: Box<dyn RenderEngine>,
    rx: Receiver<RenderMessage>,
    feedback: Sender<Feedback>,
    output: Box<dyn AudioOutput>,
    input: Option<Box<dyn AudioInput>>,
    scope: ScopeRing,
    audio: AudioConfig,
    /// Pre-allocated interleaved output block.
    block: Vec<f32>,
    input_block: Vec<f32>,
    report_latency: f64,
    blocks: u64,
    last_report_time: f64,
    suspended: bool,
    /// Blocks left to render before a hush suspends the thread.
    hush_remaining: Option<u32>,
}

impl RenderThread {
    fn run(&mut self) {
        loop {
            if self.suspended {
                match self.rx.recv() {
                    Ok(message) => {
                        if !self.handle(message) {
                            return;
                        }
                    }
                    Err(_) => return,
                }
                continue;
            }

            // Only what was queued before this block; anything later waits.
            for _ in 0..self.rx.len().max(1) {
                match self.rx.try_recv() {
                    Ok(message) => {
                        if !self.handle(message) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if !self.suspended {
                self.render_one();
            }
        }
    }

    /// Applies one message. Returns `false` on shutdown.
    fn handle(&mut self, message: RenderMessage) -> bool {
        match message {
            RenderMessage::Command(bytes) => {
                if let Err(e) = self.engine.dispatch(&bytes) {
                    self.report(Feedback::EngineFault(e.to_string()));
                }
            }
            RenderMessage::Pcm { offset, data } => {
                let reply = match self.engine.write_samples(offset, &data) {
                    Ok(()) => Feedback::PcmLoaded { offset },
                    Err(e) => Feedback::PcmRejected {
                        offset,
                        reason: e.to_string(),
                    },
                };
                self.report(reply);
            }
            RenderMessage::Panic => {
                self.hush_remaining = None;
                if let Err(e) = self.engine.panic() {
                    self.report(Feedback::EngineFault(e.to_string()));
                }
            }
            RenderMessage::Hush => {
                if let Err(e) = self.engine.hush() {
                    self.report(Feedback::EngineFault(e.to_string()));
                }
                if self.suspended {
                    self.report(Feedback::Suspended);
                } else if self.audio.hush_flush_blocks == 0 {
                    self.suspend();
                } else {
                    self.hush_remaining = Some(self.audio.hush_flush_blocks);
                }
            }
            RenderMessage::Resume => {
                self.hush_remaining = None;
                if self.suspended {
                    self.suspended = false;
                    self.output.reset();
                }
                self.report(Feedback::Resumed);
            }
            RenderMessage::Shutdown => return false,
        }
        true
    }

    fn render_one(&mut self) {
        if let Err(e) = self.render_block() {
            self.report(Feedback::EngineFault(e.to_string()));
            self.suspend();
            return;
        }

        self.blocks += 1;
        if self.blocks % self.audio.report_interval_blocks as u64 == 0 {
            self.scope.publish();
            if self.audio.clock_enabled {
                let current_time = self.engine.time().unwrap_or(self.last_report_time);
                self.report(Feedback::Tick(ClockTick {
                    previous_time: self.last_report_time,
                    current_time,
                    report_latency: self.report_latency,
                }));
                self.last_report_time = current_time;
            }
        }

        if let Some(remaining) = self.hush_remaining {
            if remaining <= 1 {
                self.suspend();
            } else {
                self.hush_remaining = Some(remaining - 1);
            }
        }
    }

    fn render_block(&mut self) -> Result<()> {
        if let Some(input) = self.input.as_mut() {
            if input.read_block(&mut self.input_block) {
                self.engine.write_input(&self.input_block)?;
            }
        }
        self.engine.render_block()?;
        self.engine.read_output(&mut self.block)?;
        self.output.write_block(&self.block)?;
        self.scope.append(&self.block);
        Ok(())
    }

    fn suspend(&mut self) {
        self.suspended = true;
        self.hush_remaining = None;
        self.output.reset();
        self.report(Feedback::Suspended);
    }

    fn report(&self, feedback: Feedback) {
        // A closed channel means the control side is gone; shutdown follows.
        let _ = self.feedback.send(feedback);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::bridge::output::DiscardOutput;

    #[derive(Default)]
    struct Log {
        commands: Vec<String>,
        pool: Vec<(usize, usize)>,
        blocks: usize,
        hushes: usize,
    }

    struct CountingEngine {
        log: Arc<Mutex<Log>>,
        time: f64,
        output_len: usize,
    }

    impl RenderEngine for CountingEngine {
        fn write_command(&mut self, command: &[u8]) -> Result<()> {
            let text = String::from_utf8_lossy(&command[..command.len() - 1]).to_string();
            self.log.lock().unwrap().commands.push(text);
            Ok(())
        }
        fn evaluate(&mut self) -> Result<i32> {
            Ok(-1)
        }
        fn write_samples(&mut self, offset: usize, data: &[f32]) -> Result<()> {
            if offset + data.len() > 16 {
                return Err(BridgeError::Engine("pool overflow".into()));
            }
            self.log.lock().unwrap().pool.push((offset, data.len()));
            Ok(())
        }
        fn write_input(&mut self, _block: &[f32]) -> Result<()> {
            Ok(())
        }
        fn render_block(&mut self) -> Result<()> {
            self.log.lock().unwrap().blocks += 1;
            self.time += 1.0;
            Ok(())
        }
        fn read_output(&mut self, block: &mut [f32]) -> Result<()> {
            block.fill(0.5);
            Ok(())
        }
        fn output_len(&self) -> usize {
            self.output_len
        }
        fn time(&mut self) -> Result<f64> {
            Ok(self.time)
        }
        fn sample_rate(&mut self) -> Result<f32> {
            Ok(1_000.0)
        }
        fn panic(&mut self) -> Result<()> {
            Ok(())
        }
        fn hush(&mut self) -> Result<()> {
            self.log.lock().unwrap().hushes += 1;
            Ok(())
        }
        fn sample_capacity(&self) -> usize {
            16
        }
    }

    struct CountingLoader {
        log: Arc<Mutex<Log>>,
        output_len: usize,
    }

    impl EngineLoader for CountingLoader {
        fn instantiate(&self, _: &[u8], _: u32, _: usize) -> Result<Box<dyn RenderEngine>> {
            Ok(Box::new(CountingEngine {
                log: Arc::clone(&self.log),
                time: 0.0,
                output_len: self.output_len,
            }))
        }
    }

    fn audio() -> AudioConfig {
        AudioConfig {
            block_size: 4,
            report_interval_blocks: 2,
            hush_flush_blocks: 3,
            ..AudioConfig::default()
        }
    }

    fn start(
        log: &Arc<Mutex<Log>>,
    ) -> (Sender<RenderMessage>, Receiver<Feedback>, JoinHandle<()>) {
        start_with_output(log, audio().block_len())
    }

    fn start_with_output(
        log: &Arc<Mutex<Log>>,
        output_len: usize,
    ) -> (Sender<RenderMessage>, Receiver<Feedback>, JoinHandle<()>) {
        let (scope, _reader) = ScopeRing::new(8);
        let (tx, rx) = unbounded();
        let (fb_tx, fb_rx) = unbounded();
        let setup = RenderSetup {
            binary: Vec::new(),
            loader: Arc::new(CountingLoader {
                log: Arc::clone(log),
                output_len,
            }),
            output: Box::new(DiscardOutput),
            input: None,
            scope,
            audio: audio(),
        };
        let handle = spawn_render_thread(setup, rx, fb_tx).unwrap();
        (tx, fb_rx, handle)
    }

    fn wait_for(rx: &Receiver<Feedback>, wanted: impl Fn(&Feedback) -> bool) -> Feedback {
        loop {
            let feedback = rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("feedback before timeout");
            if wanted(&feedback) {
                return feedback;
            }
        }
    }

    #[test]
    fn reports_ready_then_ticks_with_advancing_time() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, fb, handle) = start(&log);

        assert_eq!(
            wait_for(&fb, |f| matches!(f, Feedback::Ready { .. })),
            Feedback::Ready {
                sample_rate: 1_000,
                pool_capacity: 16,
            }
        );
        let Feedback::Tick(tick) = wait_for(&fb, |f| matches!(f, Feedback::Tick(_))) else {
            unreachable!()
        };
        assert_eq!(tick.current_time - tick.previous_time, 2.0);
        assert!((tick.report_latency - 0.008).abs() < 1e-12);

        tx.send(RenderMessage::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn applies_commands_and_acknowledges_pcm() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, fb, handle) = start(&log);

        tx.send(RenderMessage::Command(b"s/sine\0".to_vec())).unwrap();
        tx.send(RenderMessage::Pcm {
            offset: 4,
            data: Arc::from(vec![0.0f32; 8]),
        })
        .unwrap();
        tx.send(RenderMessage::Pcm {
            offset: 12,
            data: Arc::from(vec![0.0f32; 8]),
        })
        .unwrap();

        assert_eq!(
            wait_for(&fb, |f| matches!(f, Feedback::PcmLoaded { .. })),
            Feedback::PcmLoaded { offset: 4 }
        );
        assert!(matches!(
            wait_for(&fb, |f| matches!(f, Feedback::PcmRejected { .. })),
            Feedback::PcmRejected { offset: 12, .. }
        ));

        tx.send(RenderMessage::Shutdown).unwrap();
        handle.join().unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.commands, vec!["s/sine".to_string()]);
        assert_eq!(log.pool, vec![(4, 8)]);
    }

    #[test]
    fn hush_renders_the_tail_then_suspends_until_resumed() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, fb, handle) = start(&log);
        wait_for(&fb, |f| matches!(f, Feedback::Ready { .. }));

        tx.send(RenderMessage::Hush).unwrap();
        wait_for(&fb, |f| *f == Feedback::Suspended);
        let rendered = log.lock().unwrap().blocks;
        assert_eq!(log.lock().unwrap().hushes, 1);

        tx.send(RenderMessage::Command(b"s/saw\0".to_vec())).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(log.lock().unwrap().blocks, rendered);
        assert_eq!(log.lock().unwrap().commands, vec!["s/saw".to_string()]);

        tx.send(RenderMessage::Resume).unwrap();
        wait_for(&fb, |f| *f == Feedback::Resumed);
        wait_for(&fb, |f| matches!(f, Feedback::Tick(_)));
        assert!(log.lock().unwrap().blocks > rendered);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn failed_instantiation_is_reported() {
        struct Broken;
        impl EngineLoader for Broken {
            fn instantiate(&self, _: &[u8], _: u32, _: usize) -> Result<Box<dyn RenderEngine>> {
                Err(BridgeError::Engine("bad magic".into()))
            }
        }

        let (scope, _reader) = ScopeRing::new(8);
        let (_tx, rx) = unbounded();
        let (fb_tx, fb_rx) = unbounded();
        let setup = RenderSetup {
            binary: b"nope".to_vec(),
            loader: Arc::new(Broken),
            output: Box::new(DiscardOutput),
            input: None,
            scope,
            audio: audio(),
        };
        let handle = spawn_render_thread(setup, rx, fb_tx).unwrap();

        assert!(matches!(fb_rx.recv().unwrap(), Feedback::Failed(reason) if reason.contains("bad magic")));
        handle.join().unwrap();
    }

    #[test]
    fn mismatched_output_region_fails_before_ready() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (_tx, fb, handle) = start_with_output(&log, audio().block_len() / 2);

        let Feedback::Failed(reason) = fb.recv().unwrap() else {
            panic!("expected a failure");
        };
        assert!(reason.contains("4 floats"), "{reason}");
        assert!(reason.contains("needs 8"), "{reason}");
        handle.join().unwrap();
        assert_eq!(log.lock().unwrap().blocks, 0);
    }
}

//! Host of the isolated render thread.
//!
//! [`EngineBridge`] waits for its [`AuthorizationGate`], fetches the compiled
//! engine, starts the render thread and relays commands and PCM to it. Commands
//! dispatched before the engine is ready wait for readiness instead of failing.

mod engine;
mod gate;
mod output;
mod thread;
#[cfg(feature = "wasm")]
mod wasm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

pub use engine::{check_command, EngineLoader, EngineSource, RenderEngine};
pub use engine::{BLOCK_SIZE, EVENT_INPUT_SIZE};
pub use gate::AuthorizationGate;
#[cfg(feature = "device")]
pub use output::{DeviceOutput, DeviceStream};
pub use output::{AudioInput, AudioOutput, DiscardOutput, PacedOutput};
#[cfg(feature = "wasm")]
pub use wasm::WasmEngineLoader;

use self::thread::{spawn_render_thread, Feedback, RenderMessage, RenderSetup};
use crate::config::BridgeConfig;
use crate::protocol::EncodedCommand;
use crate::samples::{AssetFetcher, DefaultFetcher, PoolLayout, PoolTransfer};
use crate::scope::{ScopeCapture, ScopeRing};
use crate::timeline::{ClockTick, TransportClock};
use crate::{BridgeError, Result};

/// Lifecycle of the render-thread connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    /// Waiting for the host to open the gate.
    Authorizing,
    /// Fetching and instantiating the engine.
    Loading,
    /// Engine instantiated, nothing dispatched yet.
    Ready,
    Running,
    Suspended,
    /// Instantiation failed; readiness never resolves.
    Failed,
}

impl BridgeState {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            BridgeState::Ready | BridgeState::Running | BridgeState::Suspended
        )
    }
}

const TICK_CAPACITY: usize = 64;

struct BridgeInner {
    state: watch::Sender<BridgeState>,
    layout: OnceLock<PoolLayout>,
    failure: Mutex<Option<String>>,
    tx: OnceLock<Sender<RenderMessage>>,
    acks: Mutex<HashMap<usize, oneshot::Sender<Result<()>>>>,
    suspend_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    ticks: broadcast::Sender<ClockTick>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl BridgeInner {
    fn new() -> Self {
        let (state, _) = watch::channel(BridgeState::Uninitialized);
        let (ticks, _) = broadcast::channel(TICK_CAPACITY);
        Self {
            state,
            layout: OnceLock::new(),
            failure: Mutex::new(None),
            tx: OnceLock::new(),
            acks: Mutex::new(HashMap::new()),
            suspend_waiters: Mutex::new(Vec::new()),
            ticks,
            threads: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Moves to `next` unless the bridge has failed.
    fn set_state(&self, next: BridgeState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == BridgeState::Failed {
                return false;
            }
            debug!(from = ?*state, to = ?next, "bridge state changed");
            *state = next;
            true
        });
    }

    async fn wait_for_state(&self, accept: impl Fn(BridgeState) -> bool) -> Result<BridgeState> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| accept(*state))
            .await
            .map_err(|_| BridgeError::Disconnected)?;
        Ok(*state)
    }

    async fn wait_ready(&self) -> Result<()> {
        self.wait_for_state(BridgeState::is_ready).await.map(|_| ())
    }

    fn post(&self, message: RenderMessage) -> Result<()> {
        self.tx
            .get()
            .ok_or(BridgeError::Disconnected)?
            .send(message)
            .map_err(|_| BridgeError::Disconnected)
    }

    /// Awaits readiness and an active render loop, resuming it if suspended.
    async fn ensure_running(&self) -> Result<()> {
        self.wait_ready().await?;
        match self.state() {
            BridgeState::Running => Ok(()),
            BridgeState::Suspended => self.resume().await,
            _ => {
                self.set_state(BridgeState::Running);
                Ok(())
            }
        }
    }

    async fn resume(&self) -> Result<()> {
        self.wait_ready().await?;
        if self.state() == BridgeState::Suspended {
            self.post(RenderMessage::Resume)?;
            self.wait_for_state(|s| s == BridgeState::Running).await?;
        } else {
            self.set_state(BridgeState::Running);
        }
        Ok(())
    }

    async fn hush(&self) -> Result<()> {
        self.wait_ready().await?;
        if self.state() == BridgeState::Suspended {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        lock(&self.suspend_waiters, "suspend waiters")?.push(done_tx);
        self.post(RenderMessage::Hush)?;
        done_rx.await.map_err(|_| BridgeError::Disconnected)
    }

    async fn transfer(&self, offset: usize, data: Arc<[f32]>) -> Result<()> {
        self.wait_ready().await?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let replaced = lock(&self.acks, "pcm acks")?.insert(offset, ack_tx).is_some();
        if replaced {
            warn!(offset, "replacing an unacknowledged transfer at the same offset");
        }
        let len = data.len();
        self.post(RenderMessage::Pcm { offset, data })?;
        ack_rx.await.map_err(|_| BridgeError::Disconnected)??;
        debug!(offset, len, "pcm transfer acknowledged");
        Ok(())
    }

    fn fail(&self, reason: String) {
        error!(%reason, "engine bridge failed");
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason);
        }
        self.state.send_replace(BridgeState::Failed);
    }

    fn handle_feedback(&self, feedback: Feedback) {
        match feedback {
            Feedback::Ready {
                sample_rate,
                pool_capacity,
            } => {
                let _ = self.layout.set(PoolLayout {
                    sample_rate,
                    capacity: pool_capacity,
                });
                info!(sample_rate, pool_capacity, "render thread ready");
                self.set_state(BridgeState::Ready);
            }
            Feedback::Failed(reason) => self.fail(reason),
            Feedback::PcmLoaded { offset } => self.ack(offset, Ok(())),
            Feedback::PcmRejected { offset, reason } => {
                self.ack(offset, Err(BridgeError::Engine(reason)))
            }
            Feedback::Tick(tick) => {
                // No subscribers is fine.
                let _ = self.ticks.send(tick);
            }
            Feedback::Suspended => {
                self.set_state(BridgeState::Suspended);
                if let Ok(mut waiters) = self.suspend_waiters.lock() {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
            }
            Feedback::Resumed => self.set_state(BridgeState::Running),
            Feedback::EngineFault(reason) => warn!(%reason, "engine reported a fault"),
        }
    }

    fn ack(&self, offset: usize, result: Result<()>) {
        let waiter = self.acks.lock().ok().and_then(|mut acks| acks.remove(&offset));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(offset, "acknowledgement without a waiting transfer"),
        }
    }
}

/// Forwards render-thread feedback until the thread exits or the bridge is gone.
fn spawn_feedback_pump(
    inner: Weak<BridgeInner>,
    feedback: Receiver<Feedback>,
) -> Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("doux-feedback".into())
        .spawn(move || {
            for message in feedback.iter() {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_feedback(message);
            }
        })?;
    Ok(handle)
}

/// [`PoolTransfer`] backed by the render thread.
#[derive(Clone)]
pub struct BridgeTransfer {
    inner: Arc<BridgeInner>,
}

impl PoolTransfer for BridgeTransfer {
    fn layout(&self) -> BoxFuture<'static, Result<PoolLayout>> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.wait_ready().await?;
            inner.layout.get().copied().ok_or(BridgeError::Disconnected)
        }
        .boxed()
    }

    fn transfer(&self, offset: usize, data: Arc<[f32]>) -> BoxFuture<'static, Result<()>> {
        let inner = Arc::clone(&self.inner);
        async move { inner.transfer(offset, data).await }.boxed()
    }
}

/// Configures and starts an [`EngineBridge`].
pub struct EngineBridgeBuilder {
    source: EngineSource,
    config: BridgeConfig,
    gate: AuthorizationGate,
    fetcher: Option<Arc<dyn AssetFetcher>>,
    loader: Option<Arc<dyn EngineLoader>>,
    output: Option<Box<dyn AudioOutput>>,
    input: Option<Box<dyn AudioInput>>,
}

impl EngineBridgeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Gate to wait on before loading. Defaults to an open gate.
    pub fn gate(mut self, gate: AuthorizationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn EngineLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn output(mut self, output: impl AudioOutput + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn input(mut self, input: impl AudioInput + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    /// Starts the bridge. Must be called within a tokio runtime.
    pub fn spawn(self) -> Result<EngineBridge> {
        self.config.validate()?;
        let fetcher: Arc<dyn AssetFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(DefaultFetcher::new(Duration::from_secs(
                self.config.samples.fetch_timeout_secs,
            ))?),
        };
        let loader = match self.loader {
            Some(loader) => loader,
            None => default_loader()?,
        };
        let audio = self.config.audio.clone();
        let output = self
            .output
            .unwrap_or_else(|| Box::new(PacedOutput::new(audio.block_size, audio.sample_rate)));

        let (scope_ring, scope_reader) = ScopeRing::new(self.config.scope.snapshot_capacity);
        let scope = ScopeCapture::new(scope_reader, audio.channels, self.config.scope.clone());

        let inner = Arc::new(BridgeInner::new());
        inner.set_state(BridgeState::Authorizing);

        let task_inner = Arc::clone(&inner);
        let gate = self.gate;
        let source = self.source;
        let input = self.input;
        let startup = tokio::spawn(async move {
            gate.authorized().await;
            task_inner.set_state(BridgeState::Loading);
            info!(?source, "loading engine");

            let binary = match source.load(fetcher.as_ref()).await {
                Ok(binary) => binary,
                Err(e) => return task_inner.fail(e.to_string()),
            };

            let (tx, rx) = unbounded();
            let (feedback_tx, feedback_rx) = unbounded();
            // Readiness may be reported before this task resumes.
            let _ = task_inner.tx.set(tx);
            let setup = RenderSetup {
                binary,
                loader,
                output,
                input,
                scope: scope_ring,
                audio,
            };
            let started = spawn_render_thread(setup, rx, feedback_tx).and_then(|render| {
                let pump = spawn_feedback_pump(Arc::downgrade(&task_inner), feedback_rx)?;
                Ok([render, pump])
            });
            match started {
                Ok(handles) => {
                    if let Ok(mut threads) = task_inner.threads.lock() {
                        threads.extend(handles);
                    }
                }
                Err(e) => task_inner.fail(e.to_string()),
            }
        });

        Ok(EngineBridge {
            inner,
            scope,
            startup: Some(startup),
        })
    }
}

#[cfg(feature = "wasm")]
fn default_loader() -> Result<Arc<dyn EngineLoader>> {
    Ok(Arc::new(WasmEngineLoader::new()))
}

#[cfg(not(feature = "wasm"))]
fn default_loader() -> Result<Arc<dyn EngineLoader>> {
    Err(BridgeError::Config(
        "no engine loader configured and the `wasm` feature is disabled".into(),
    ))
}

/// Connection to the render thread.
pub struct EngineBridge {
    inner: Arc<BridgeInner>,
    scope: ScopeCapture,
    startup: Option<tokio::task::JoinHandle<()>>,
}

impl EngineBridge {
    pub fn builder(source: impl Into<EngineSource>) -> EngineBridgeBuilder {
        EngineBridgeBuilder {
            source: source.into(),
            config: BridgeConfig::default(),
            gate: AuthorizationGate::open(),
            fetcher: None,
            loader: None,
            output: None,
            input: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.inner.state.subscribe()
    }

    /// Why instantiation failed, once the bridge is [`BridgeState::Failed`].
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().ok()?.clone()
    }

    /// Sample rate reported by the engine, once ready.
    pub fn sample_rate(&self) -> Option<u32> {
        self.inner.layout.get().map(|layout| layout.sample_rate)
    }

    /// Resolves once the engine is ready. Never resolves after a failure.
    pub async fn wait_ready(&self) -> Result<()> {
        self.inner.wait_ready().await
    }

    /// Queues a command for the next block, waiting for readiness first.
    pub async fn send(&self, command: &EncodedCommand) -> Result<()> {
        self.send_bytes(command.as_bytes().to_vec()).await
    }

    pub async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        check_command(&bytes)?;
        self.inner.ensure_running().await?;
        self.inner.post(RenderMessage::Command(bytes))
    }

    /// Silences every voice immediately.
    pub async fn panic(&self) -> Result<()> {
        self.inner.wait_ready().await?;
        self.inner.post(RenderMessage::Panic)
    }

    /// Releases every voice, lets the tails render, then suspends the thread.
    pub async fn hush(&self) -> Result<()> {
        self.inner.hush().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.resume().await
    }

    /// Handle the sample loader uses to move PCM into the pool.
    pub fn pool_transfer(&self) -> BridgeTransfer {
        BridgeTransfer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn scope(&self) -> &ScopeCapture {
        &self.scope
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<ClockTick> {
        self.inner.ticks.subscribe()
    }

    pub fn clock(&self) -> TransportClock {
        TransportClock::new(self.subscribe_ticks())
    }
}

impl Drop for EngineBridge {
    fn drop(&mut self) {
        if let Some(startup) = self.startup.take() {
            startup.abort();
        }
        // Shutdown first, then join; the render thread exits on either.
        let _ = self.inner.post(RenderMessage::Shutdown);
        let handles = self
            .inner
            .threads
            .lock()
            .map(|mut threads| std::mem::take(&mut *threads))
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EngineBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBridge")
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate())
            .finish()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| BridgeError::msg(format!("{what} has been poisoned")))
}

//! Command surface tying the sample loader to the engine bridge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::{AuthorizationGate, BridgeState, EngineBridge, EngineBridgeBuilder};
use crate::config::BridgeConfig;
use crate::protocol::{encode_path, parse_path, EncodedCommand, Event};
use crate::samples::{scan_sample_dir, AssetFetcher, DefaultFetcher, SampleBanks, SampleLoader};
use crate::scope::ScopeCapture;
use crate::timeline::TransportClock;
use crate::Result;

/// An event whose samples are loaded and whose command is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMessage {
    pub event: Event,
    pub command: EncodedCommand,
}

/// One engine, its sample pool and its banks.
pub struct Session {
    bridge: EngineBridge,
    loader: SampleLoader,
}

impl Session {
    /// Starts the bridge from `builder` and attaches a sample loader to it.
    pub fn start(builder: EngineBridgeBuilder, config: &BridgeConfig) -> Result<Self> {
        let fetcher: Arc<dyn AssetFetcher> = Arc::new(DefaultFetcher::new(
            std::time::Duration::from_secs(config.samples.fetch_timeout_secs),
        )?);
        Self::start_with_fetcher(builder, config, fetcher)
    }

    pub fn start_with_fetcher(
        builder: EngineBridgeBuilder,
        config: &BridgeConfig,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Result<Self> {
        let bridge = builder
            .config(config.clone())
            .fetcher(Arc::clone(&fetcher))
            .spawn()?;
        let loader = SampleLoader::new(
            Arc::new(SampleBanks::new()),
            fetcher,
            Arc::new(bridge.pool_transfer()),
            config.samples.clone(),
        );
        Ok(Self { bridge, loader })
    }

    /// Loads any sample the event references, then encodes it.
    pub async fn prepare(&self, event: Event) -> Result<PreparedMessage> {
        let event = self.loader.annotate_event(event).await?;
        let command = encode_path(&event);
        Ok(PreparedMessage { event, command })
    }

    pub async fn send(&self, message: &PreparedMessage) -> Result<()> {
        debug!(command = %message.command, "dispatching");
        self.bridge.send(&message.command).await
    }

    /// Prepares and sends one event.
    pub async fn evaluate(&self, event: Event) -> Result<PreparedMessage> {
        let message = self.prepare(event).await?;
        self.send(&message).await?;
        Ok(message)
    }

    /// Parses a command path and evaluates it. Empty paths are ignored.
    pub async fn play(&self, path: &str) -> Result<Option<PreparedMessage>> {
        let event = parse_path(path);
        if event.is_empty() {
            return Ok(None);
        }
        self.evaluate(event).await.map(Some)
    }

    pub async fn panic(&self) -> Result<()> {
        info!("panic");
        self.bridge.panic().await
    }

    pub async fn hush(&self) -> Result<()> {
        info!("hush");
        self.bridge.hush().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.bridge.resume().await
    }

    pub fn register_bank<I, S>(&self, map: I, base_url: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        self.loader.register_bank(map, base_url)
    }

    pub async fn load_manifest(&self, source: &str) -> Result<usize> {
        self.loader.load_manifest(source).await
    }

    /// Loads a manifest in the background; see [`SampleLoader::register_manifest`].
    pub fn register_manifest(&self, source: impl Into<String>) -> JoinHandle<Result<usize>> {
        self.loader.register_manifest(source)
    }

    /// Registers every sample folder and loose audio file under `dir`.
    pub fn register_sample_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let banks = scan_sample_dir(dir)?;
        info!(dir = %dir.display(), banks = banks.len(), "scanned sample directory");
        self.loader.register_bank(banks, None)
    }

    pub fn clear_pool(&self) -> Result<()> {
        self.loader.clear_pool()
    }

    pub fn banks(&self) -> Vec<String> {
        self.loader.banks().names()
    }

    pub fn loader(&self) -> &SampleLoader {
        &self.loader
    }

    pub fn bridge(&self) -> &EngineBridge {
        &self.bridge
    }

    pub fn state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub async fn wait_ready(&self) -> Result<()> {
        self.bridge.wait_ready().await
    }

    pub fn scope(&self) -> &ScopeCapture {
        self.bridge.scope()
    }

    pub fn clock(&self) -> TransportClock {
        self.bridge.clock()
    }
}

/// Builds a bank map from `(name, urls)` pairs.
pub fn bank_map<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a [&'a str])>,
) -> HashMap<String, Vec<String>> {
    entries
        .into_iter()
        .map(|(name, urls)| {
            (
                name.to_string(),
                urls.iter().map(|url| url.to_string()).collect(),
            )
        })
        .collect()
}

/// Gate helper for hosts that authorise later.
pub fn gated(builder: EngineBridgeBuilder) -> (EngineBridgeBuilder, AuthorizationGate) {
    let gate = AuthorizationGate::new();
    (builder.gate(gate.clone()), gate)
}

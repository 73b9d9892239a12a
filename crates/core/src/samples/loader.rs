use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{decode_mono, AssetFetcher, SampleBanks, SampleRecord, SoundKey};
use crate::config::SampleConfig;
use crate::protocol::{is_builtin_source, Event};
use crate::{BridgeError, Result};

/// What the running engine reports about its sample pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    /// Rate the engine renders at. Decoded samples are resampled to it.
    pub sample_rate: u32,
    /// Pool size in floats.
    pub capacity: usize,
}

/// Destination of decoded PCM: the render thread's sample pool.
pub trait PoolTransfer: Send + Sync {
    /// Resolves once the engine is ready.
    fn layout(&self) -> BoxFuture<'static, Result<PoolLayout>>;

    /// Copies `data` into the pool at `offset`, resolving once the render
    /// thread acknowledges the write.
    fn transfer(&self, offset: usize, data: Arc<[f32]>) -> BoxFuture<'static, Result<()>>;
}

type SharedLoad = Shared<BoxFuture<'static, std::result::Result<SampleRecord, Arc<BridgeError>>>>;

#[derive(Default)]
struct CacheState {
    records: HashMap<SoundKey, SampleRecord>,
    /// In-flight loads tagged with the generation that started them.
    pending: HashMap<SoundKey, (u64, SharedLoad)>,
    high_water: usize,
    generation: u64,
}

struct LoaderInner {
    banks: Arc<SampleBanks>,
    fetcher: Arc<dyn AssetFetcher>,
    transfer: Arc<dyn PoolTransfer>,
    config: SampleConfig,
    state: Mutex<CacheState>,
}

/// Resolves sound references to pool-resident samples.
///
/// At most one load runs per [`SoundKey`]; concurrent callers await the same
/// shared future. Pool offsets only grow until [`SampleLoader::clear_pool`].
#[derive(Clone)]
pub struct SampleLoader {
    inner: Arc<LoaderInner>,
}

impl SampleLoader {
    pub fn new(
        banks: Arc<SampleBanks>,
        fetcher: Arc<dyn AssetFetcher>,
        transfer: Arc<dyn PoolTransfer>,
        config: SampleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                banks,
                fetcher,
                transfer,
                config,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub fn banks(&self) -> &Arc<SampleBanks> {
        &self.inner.banks
    }

    /// Returns the record for `key`, loading it on first use.
    pub async fn resolve(&self, key: SoundKey) -> Result<SampleRecord> {
        let load = {
            let mut state = self.inner.lock()?;
            if let Some(record) = state.records.get(&key) {
                return Ok(*record);
            }
            match state.pending.get(&key) {
                Some((_, load)) => load.clone(),
                None => {
                    let generation = state.generation;
                    let load = spawn_load(Arc::clone(&self.inner), key.clone(), generation);
                    state.pending.insert(key, (generation, load.clone()));
                    load
                }
            }
        };
        load.await.map_err(BridgeError::Shared)
    }

    /// Adds pool fields to events that reference a registered sample.
    ///
    /// Built-in sources, events without a sound and unregistered names pass
    /// through unchanged. Fetch and decode failures are returned.
    pub async fn annotate_event(&self, mut event: Event) -> Result<Event> {
        match event.sound() {
            Some(sound) if !is_builtin_source(sound) => {}
            _ => return Ok(event),
        }
        let Some(key) = SoundKey::from_event(&event) else {
            return Ok(event);
        };
        if !self.inner.banks.contains(&key.name) {
            debug!(sound = %key.name, "no bank registered, forwarding event unchanged");
            return Ok(event);
        }

        match self.resolve(key).await {
            Ok(record) => {
                record.annotate(&mut event);
                Ok(event)
            }
            Err(e) if e.is_sound_not_found() => Ok(event),
            Err(e) => Err(e),
        }
    }

    /// Forgets every record and pending load and rewinds the pool to zero.
    ///
    /// Loads already in flight still resolve for their awaiters but are not
    /// published.
    pub fn clear_pool(&self) -> Result<()> {
        let mut state = self.inner.lock()?;
        state.generation += 1;
        state.records.clear();
        state.pending.clear();
        state.high_water = 0;
        info!(generation = state.generation, "sample pool cleared");
        Ok(())
    }

    /// Registers banks, falling back to the configured base URL.
    pub fn register_bank<I, S>(&self, map: I, base_url: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let base_url = base_url.or(self.inner.config.base_url.as_deref());
        self.inner.banks.register_bank(map, base_url)
    }

    /// Fetches a manifest and registers its banks.
    pub async fn load_manifest(&self, source: &str) -> Result<usize> {
        self.inner
            .banks
            .load_manifest(self.inner.fetcher.as_ref(), source)
            .await
    }

    /// Starts loading a manifest in the background. Events annotated after
    /// the handle resolves see the new banks.
    pub fn register_manifest(&self, source: impl Into<String>) -> JoinHandle<Result<usize>> {
        let loader = self.clone();
        let source = source.into();
        tokio::spawn(async move {
            let result = loader.load_manifest(&source).await;
            if let Err(e) = &result {
                warn!(manifest = %source, error = %e, "deferred manifest registration failed");
            }
            result
        })
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// First free pool offset, in floats.
    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().map(|s| s.high_water).unwrap_or(0)
    }
}

impl LoaderInner {
    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| BridgeError::msg("sample cache has been poisoned"))
    }

    /// Claims `len` floats at the high-water mark.
    /// Reserves `len` floats below the smaller of the configured and the
    /// engine's capacity.
    fn reserve(&self, len: usize, engine_capacity: usize) -> Result<usize> {
        let capacity = self.config.pool_capacity.min(engine_capacity);
        let mut state = self.lock()?;
        let offset = state.high_water;
        let end = offset + len;
        if end > capacity {
            return Err(BridgeError::msg(format!(
                "sample pool exhausted: {len} floats requested at offset {offset}, capacity {capacity}"
            )));
        }
        state.high_water = end;
        Ok(offset)
    }

    /// Publishes a finished load and drops its pending entry, unless the pool
    /// was cleared while it ran.
    fn settle(&self, key: &SoundKey, generation: u64, record: Option<SampleRecord>) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if state.generation != generation {
            debug!(sound = %key.name, index = key.index, "discarding load from a cleared pool");
            return;
        }
        state.pending.remove(key);
        if let Some(record) = record {
            state.records.insert(key.clone(), record);
        }
    }
}

fn spawn_load(inner: Arc<LoaderInner>, key: SoundKey, generation: u64) -> SharedLoad {
    let handle = tokio::spawn(async move {
        let result = load(&inner, &key).await;
        match &result {
            Ok(record) => {
                debug!(
                    sound = %key.name,
                    index = key.index,
                    offset = record.pool_offset,
                    frames = record.frame_count,
                    "sample loaded"
                );
            }
            Err(e) => warn!(sound = %key.name, index = key.index, error = %e, "sample load failed"),
        }
        inner.settle(&key, generation, result.as_ref().ok().copied());
        result.map_err(Arc::new)
    });

    async move {
        handle.await.unwrap_or_else(|e| {
            Err(Arc::new(BridgeError::msg(format!(
                "sample load task failed: {e}"
            ))))
        })
    }
    .boxed()
    .shared()
}

async fn load(inner: &LoaderInner, key: &SoundKey) -> Result<SampleRecord> {
    let urls = inner.banks.lookup(&key.name)?;
    let url = urls
        .get(key.index % urls.len().max(1))
        .cloned()
        .ok_or_else(|| BridgeError::SoundNotFound {
            name: key.name.clone(),
        })?;

    let bytes = inner.fetcher.fetch(&url).await?;
    let layout = inner.transfer.layout().await?;
    let samples =
        tokio::task::spawn_blocking(move || decode_mono(bytes, &url, layout.sample_rate))
            .await
            .map_err(|e| BridgeError::msg(format!("decode task failed: {e}")))??;

    let frame_count = samples.len();
    let pool_offset = inner.reserve(frame_count, layout.capacity)?;
    inner.transfer.transfer(pool_offset, Arc::from(samples)).await?;

    Ok(SampleRecord {
        pool_offset,
        frame_count,
        channel_count: 1,
        root_frequency: inner.config.root_frequency,
    })
}

use std::path::PathBuf;
use std::sync::Arc;

use crate::samples::AssetFetcher;
use crate::{BridgeError, Result};

/// Frames per engine render call.
pub const BLOCK_SIZE: usize = 128;
/// Capacity of the engine's event-input region, terminator included.
pub const EVENT_INPUT_SIZE: usize = 1024;

/// Engine instance living on the render thread.
///
/// Regions are addressed the way the engine exposes them: commands go to the
/// event-input region, PCM to the sample pool, live input to the input region,
/// and each rendered block is read back from the output region.
pub trait RenderEngine {
    /// Copies a zero-terminated command into the event-input region.
    fn write_command(&mut self, command: &[u8]) -> Result<()>;

    /// Executes the pending command. Negative results are engine-defined.
    fn evaluate(&mut self) -> Result<i32>;

    /// Copies samples into the pool at `offset`, in floats.
    fn write_samples(&mut self, offset: usize, data: &[f32]) -> Result<()>;

    fn write_input(&mut self, block: &[f32]) -> Result<()>;

    /// Renders one block into the output region.
    fn render_block(&mut self) -> Result<()>;

    fn read_output(&mut self, block: &mut [f32]) -> Result<()>;

    /// Output region size in floats.
    fn output_len(&self) -> usize;

    /// Engine logical time in seconds.
    fn time(&mut self) -> Result<f64>;

    fn sample_rate(&mut self) -> Result<f32>;

    /// Silences every voice immediately.
    fn panic(&mut self) -> Result<()>;

    /// Releases every voice so tails fade out.
    fn hush(&mut self) -> Result<()> {
        self.panic()
    }

    /// Pool size in floats.
    fn sample_capacity(&self) -> usize;

    /// Send a command: write it, then evaluate it.
    fn dispatch(&mut self, command: &[u8]) -> Result<i32> {
        self.write_command(command)?;
        self.evaluate()
    }
}

/// Builds an engine from its compiled binary on the render thread.
pub trait EngineLoader: Send + Sync {
    fn instantiate(
        &self,
        binary: &[u8],
        sample_rate: u32,
        max_voices: usize,
    ) -> Result<Box<dyn RenderEngine>>;
}

/// Where the compiled engine comes from.
#[derive(Debug, Clone)]
pub enum EngineSource {
    Url(String),
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl EngineSource {
    pub async fn load(&self, fetcher: &dyn AssetFetcher) -> Result<Vec<u8>> {
        match self {
            EngineSource::Url(url) => fetcher.fetch(url).await,
            EngineSource::Path(path) => tokio::fs::read(path).await.map_err(|e| {
                BridgeError::Fetch {
                    url: path.display().to_string(),
                    reason: e.to_string(),
                }
            }),
            EngineSource::Bytes(bytes) => Ok(bytes.to_vec()),
        }
    }
}

impl From<PathBuf> for EngineSource {
    fn from(path: PathBuf) -> Self {
        EngineSource::Path(path)
    }
}

impl From<Vec<u8>> for EngineSource {
    fn from(bytes: Vec<u8>) -> Self {
        EngineSource::Bytes(bytes.into())
    }
}

/// Rejects commands that do not fit the event-input region.
pub fn check_command(command: &[u8]) -> Result<()> {
    if command.len() > EVENT_INPUT_SIZE {
        return Err(BridgeError::Engine(format!(
            "command of {} bytes exceeds the {EVENT_INPUT_SIZE}-byte event input",
            command.len()
        )));
    }
    if command.last() != Some(&0) {
        return Err(BridgeError::Engine("command is not zero-terminated".into()));
    }
    Ok(())
}

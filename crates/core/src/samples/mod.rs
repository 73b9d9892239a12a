//! Sample resolution, fetching, decoding and pool bookkeeping.

mod banks;
mod decode;
mod fetch;
mod loader;
mod scan;

pub use banks::{join_url, resolve_manifest_url, SampleBanks};
pub use decode::decode_mono;
pub use fetch::{AssetFetcher, DefaultFetcher, FileFetcher, HttpFetcher};
pub use loader::{PoolLayout, PoolTransfer, SampleLoader};
pub use scan::scan_sample_dir;

use serde::{Deserialize, Serialize};

use crate::protocol::Event;

/// Identifies one sample within a named bank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoundKey {
    pub name: String,
    pub index: usize,
}

impl SoundKey {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Builds the key an event refers to, honouring `bank` and `n`.
    pub fn from_event(event: &Event) -> Option<Self> {
        Some(Self::new(event.bank_sound()?, event.sound_index()))
    }
}

/// Placement of a decoded sample inside the engine's sample pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Offset of the first frame, in floats.
    pub pool_offset: usize,
    pub frame_count: usize,
    pub channel_count: u16,
    pub root_frequency: f64,
}

impl SampleRecord {
    /// First pool offset past this sample.
    pub fn end(&self) -> usize {
        self.pool_offset + self.frame_count * self.channel_count as usize
    }

    /// Adds the fields the engine reads to locate the sample.
    pub fn annotate(&self, event: &mut Event) {
        event.insert("file_pcm", self.pool_offset);
        event.insert("file_frames", self.frame_count);
        event.insert("file_channels", self.channel_count as usize);
        event.insert("file_freq", self.root_frequency);
    }
}

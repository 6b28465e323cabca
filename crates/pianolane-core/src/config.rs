use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;
pub const DEFAULT_BLOCK_FRAMES: u32 = 256;
pub const DEFAULT_RELEASE_SECONDS: f64 = 2.0;
pub const DEFAULT_MAX_RENDER_SECONDS: f64 = 21_600.0;
pub const DEFAULT_END_MARGIN_SECONDS: f64 = 5.0;
pub const PERCUSSION_CHANNEL: u8 = 9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_frames: u32,
    pub release_seconds: f64,
    pub max_render_seconds: f64,
    pub soundfont_path: Option<PathBuf>,
    pub output_device_index: Option<usize>,
    pub drum_channel: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_frames: DEFAULT_BLOCK_FRAMES,
            release_seconds: DEFAULT_RELEASE_SECONDS,
            max_render_seconds: DEFAULT_MAX_RENDER_SECONDS,
            soundfont_path: None,
            output_device_index: None,
            drum_channel: PERCUSSION_CHANNEL,
        }
    }
}

/// How a note-off narrows the notes already placed on its key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Every note on the key ends no later than the note-off.
    #[default]
    AllNotesOnKey,
    /// Only the most recent note on the key is closed.
    LatestNoteOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SequencerConfig {
    pub clamp_policy: ClampPolicy,
    pub end_margin_seconds: f64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            clamp_policy: ClampPolicy::default(),
            end_margin_seconds: DEFAULT_END_MARGIN_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RecorderConfig {
    pub output_dir: Option<PathBuf>,
    pub port_index: usize,
}

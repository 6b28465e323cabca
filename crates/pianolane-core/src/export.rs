use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::{codec::MidiFile, model::SequenceTrack, render::mixdown};

/// Writes the summed stereo render of `tracks` as 16-bit PCM and returns the
/// number of frames written.
#[instrument(skip(tracks), fields(tracks = tracks.len(), path = %path.display()))]
pub fn export_wav(tracks: &[SequenceTrack], sample_rate: u32, path: &Path) -> Result<usize> {
    create_parent_dir(path)?;

    let mixed = mixdown(tracks);
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create wav file: {}", path.display()))?;

    for sample in &mixed {
        let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
        writer
            .write_sample(quantized)
            .context("failed to write wav sample")?;
    }

    writer.finalize().context("failed to finalize wav file")?;
    let frames = mixed.len() / 2;
    info!(frames, "wav export completed");
    Ok(frames)
}

/// Encodes `file` and replaces `path` atomically through a temp file in the
/// same directory.
#[instrument(skip(file), fields(tracks = file.tracks.len(), path = %path.display()))]
pub fn write_midi(file: &MidiFile, path: &Path) -> Result<()> {
    create_parent_dir(path)?;

    let bytes = file.encode().context("failed to encode midi file")?;
    let mut temp_file = tempfile::NamedTempFile::new_in(
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf),
    )
    .context("failed to create temp midi file")?;

    temp_file
        .write_all(&bytes)
        .context("failed to write temp midi file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist midi file: {}", path.display()))?;

    debug!(bytes = bytes.len(), "midi file written");
    Ok(())
}

/// Directory holding the running executable.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("executable has no parent directory: {}", exe.display()))
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    Ok(())
}

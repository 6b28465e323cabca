use tracing::{debug, instrument};

use crate::{
    config::{EngineConfig, PERCUSSION_CHANNEL},
    instrument::InstrumentBank,
    model::{LOWEST_KEY, SequenceTrack},
};

const SCRATCH_FRAMES: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub sample_rate: u32,
    pub release_seconds: f64,
    pub max_render_seconds: f64,
    pub drum_channel: u8,
}

impl From<&EngineConfig> for RenderSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            release_seconds: config.release_seconds,
            max_render_seconds: config.max_render_seconds,
            drum_channel: config.drum_channel,
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl RenderSettings {
    #[must_use]
    pub fn frame_at(&self, seconds: f64) -> usize {
        if seconds <= 0.0 || seconds.is_nan() {
            return 0;
        }
        (seconds * f64::from(self.sample_rate)) as usize
    }

    /// Frames needed to hold a track whose last note releases at `latest_sustain_off`.
    #[must_use]
    pub fn frames_for(&self, latest_sustain_off: f64) -> usize {
        if latest_sustain_off <= 0.0 || latest_sustain_off.is_nan() {
            return 0;
        }
        let seconds = (latest_sustain_off + self.release_seconds).min(self.max_render_seconds);
        (seconds * f64::from(self.sample_rate)).ceil() as usize
    }

    /// Channel the bank plays a track on: the configured drum channel is
    /// swapped with the General MIDI percussion channel.
    #[must_use]
    pub fn synth_channel(&self, channel: u8) -> u8 {
        if channel == self.drum_channel {
            PERCUSSION_CHANNEL
        } else if channel == PERCUSSION_CHANNEL {
            self.drum_channel
        } else {
            channel
        }
    }
}

/// Renders one track into a fresh interleaved stereo buffer. Silent tracks
/// produce an empty buffer; unknown programs produce a silent one.
#[instrument(skip(bank, track), fields(channel = track.channel, notes = track.note_count()))]
pub fn render_track(
    bank: &mut dyn InstrumentBank,
    track: &SequenceTrack,
    settings: &RenderSettings,
) -> Vec<f32> {
    let frames = settings.frames_for(track.latest_sustain_off());
    if frames == 0 {
        return Vec::new();
    }
    let mut buffer = vec![0.0_f32; frames * 2];

    if usize::from(track.instrument) >= bank.program_count() {
        debug!(
            instrument = track.instrument,
            programs = bank.program_count(),
            "program out of range, leaving track silent"
        );
        return buffer;
    }

    let channel = settings.synth_channel(track.channel);
    let mut scratch = Scratch::new();
    let release = settings.release_seconds.max(0.0);

    for (index, lane) in track.lanes().iter().enumerate() {
        let key = LOWEST_KEY + index as u8;
        for note in lane {
            let on = settings.frame_at(note.on).min(frames);
            let off = settings.frame_at(note.sustain_off).clamp(on, frames);
            let end = settings.frame_at(note.sustain_off + release).clamp(off, frames);
            if on == end {
                continue;
            }

            // Notes are rendered one at a time into their own spans, so any voice
            // still releasing from the previous note would be written a second
            // time at this note's offset. Resetting clears it, and a reset also
            // drops the channel program.
            bank.reset();
            bank.select_program(channel, track.instrument);
            bank.note_on(channel, key, note.velocity);
            scratch.render_into(bank, &mut buffer, on, off);
            bank.note_off(channel, key);
            scratch.render_into(bank, &mut buffer, off, end);
        }
    }
    bank.reset();

    debug!(samples = buffer.len(), "track rendered");
    buffer
}

/// Sums every track's buffer, padding shorter ones with silence.
#[must_use]
pub fn mixdown(tracks: &[SequenceTrack]) -> Vec<f32> {
    let len = tracks
        .iter()
        .map(|track| track.samples().len())
        .max()
        .unwrap_or_default();
    let mut mixed = vec![0.0_f32; len];
    for track in tracks {
        for (out, sample) in mixed.iter_mut().zip(track.samples().iter()) {
            *out += sample;
        }
    }
    mixed
}

struct Scratch {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Scratch {
    fn new() -> Self {
        Self {
            left: vec![0.0; SCRATCH_FRAMES],
            right: vec![0.0; SCRATCH_FRAMES],
        }
    }

    fn render_into(
        &mut self,
        bank: &mut dyn InstrumentBank,
        buffer: &mut [f32],
        start_frame: usize,
        end_frame: usize,
    ) {
        let mut frame = start_frame;
        while frame < end_frame {
            let count = (end_frame - frame).min(SCRATCH_FRAMES);
            let left = &mut self.left[..count];
            let right = &mut self.right[..count];
            bank.render(left, right);

            let out = &mut buffer[frame * 2..(frame + count) * 2];
            for ((pair, l), r) in out.chunks_exact_mut(2).zip(left.iter()).zip(right.iter()) {
                pair[0] += l;
                pair[1] += r;
            }
            frame += count;
        }
    }
}

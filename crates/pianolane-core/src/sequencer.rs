use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::{
    codec::{CodecError, MidiFile, TrackChunk},
    config::{ClampPolicy, SequencerConfig},
    engine::AudioEngine,
    model::{
        KEY_COUNT, LOWEST_KEY, NoteBlock, NoteEvent, PEDAL_PRESSED_THRESHOLD, PedalChange,
        SUSTAIN_CONTROLLER, SequenceTrack, TrackSummary, key_index, palette_color,
    },
    stream::PlaybackCursor,
    tempo::TempoMap,
};

pub const TEMPO_SCALE_MIN: f64 = 0.5;
pub const TEMPO_SCALE_MAX: f64 = 2.0;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("malformed midi file: {0}")]
    Codec(#[from] CodecError),
    #[error("midi format {0} is not supported")]
    UnsupportedFormat(u16),
    #[error("midi file contains no tracks")]
    NoTracks,
    #[error("midi file declares zero ticks per quarter note")]
    ZeroDivision,
    #[error("cannot regenerate while the audio stream is active")]
    StreamActive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceSummary {
    pub name: String,
    pub ticks_per_quarter: u16,
    pub tempo_changes: usize,
    pub initial_bpm: f64,
    pub time_scale: f64,
    pub duration_seconds: f64,
    pub max_sample_count: usize,
    pub tracks: Vec<TrackSummary>,
}

#[derive(Debug)]
pub struct Sequencer {
    config: SequencerConfig,
    name: String,
    tracks: Vec<SequenceTrack>,
    tempo_map: TempoMap,
    time_scale: f64,
    cursor: Arc<PlaybackCursor>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(SequencerConfig::default())
    }
}

impl Sequencer {
    #[must_use]
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            name: String::new(),
            tracks: Vec::new(),
            tempo_map: TempoMap::new(1),
            time_scale: 1.0,
            cursor: Arc::new(PlaybackCursor::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn set_clamp_policy(&mut self, policy: ClampPolicy) {
        self.config.clamp_policy = policy;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tracks(&self) -> &[SequenceTrack] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [SequenceTrack] {
        &mut self.tracks
    }

    #[must_use]
    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    #[must_use]
    pub fn ticks_per_quarter(&self) -> u16 {
        self.tempo_map.ticks_per_quarter()
    }

    #[must_use]
    pub fn cursor(&self) -> &Arc<PlaybackCursor> {
        &self.cursor
    }

    #[must_use]
    pub fn max_sample_count(&self) -> usize {
        self.cursor.max()
    }

    #[must_use]
    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Latest nominal note end across every track, in scaled seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.tracks
            .iter()
            .map(SequenceTrack::latest_off)
            .fold(0.0, f64::max)
    }

    pub fn clear(&mut self) {
        self.name.clear();
        self.tracks.clear();
        self.tempo_map = TempoMap::new(1);
        self.time_scale = 1.0;
        self.detach_cursor();
    }

    /// Swaps in an empty cursor. A stream that still holds the old one keeps
    /// its position and its samples.
    fn detach_cursor(&mut self) {
        self.cursor = Arc::new(PlaybackCursor::new());
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load(&mut self, path: &Path) -> Result<(), SequencerError> {
        self.clear();
        let bytes = fs::read(path).map_err(|err| {
            let err = SequencerError::Io {
                path: path.display().to_string(),
                message: err.to_string(),
            };
            error!(%err, "could not read midi file");
            err
        })?;
        self.load_bytes(&bytes)
    }

    /// Replaces the current sequence. The sequencer is cleared first, so a
    /// failure always leaves it empty.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), SequencerError> {
        self.clear();
        let result = MidiFile::decode(bytes)
            .map_err(SequencerError::from)
            .and_then(|file| self.load_file(&file));
        if let Err(err) = &result {
            error!(%err, "midi file rejected");
            self.clear();
        }
        result
    }

    pub fn load_file(&mut self, file: &MidiFile) -> Result<(), SequencerError> {
        self.clear();
        let header = file.header;
        if header.format > 1 {
            return Err(SequencerError::UnsupportedFormat(header.format));
        }
        if header.is_smpte() {
            return Err(CodecError::SmpteDivision(header.division).into());
        }
        let Some(first) = file.tracks.first() else {
            return Err(SequencerError::NoTracks);
        };
        if header.division == 0 {
            return Err(SequencerError::ZeroDivision);
        }

        self.name = first.name();
        let skip = usize::from(header.format == 1);
        let mut pedal_by_channel: BTreeMap<u8, Vec<PedalChange>> = BTreeMap::new();

        for (index, chunk) in file.tracks.iter().enumerate().skip(skip) {
            let track_name = if index == 0 {
                String::new()
            } else {
                chunk.name()
            };
            self.tracks
                .extend(demux_channels(chunk, &track_name, &mut pedal_by_channel));
        }

        for pedal in pedal_by_channel.values_mut() {
            pedal.sort_by_key(|change| change.tick);
        }
        for (index, track) in self.tracks.iter_mut().enumerate() {
            track.colors = palette_color(index);
            if let Some(pedal) = pedal_by_channel.get(&track.channel) {
                track.pedal_changes.clone_from(pedal);
            }
        }

        self.tempo_map = TempoMap::from_tracks(&file.tracks, header.division);
        info!(
            name = %self.name,
            tracks = self.tracks.len(),
            tempo_changes = self.tempo_map.len(),
            division = header.division,
            "sequence loaded"
        );
        Ok(())
    }

    /// Rebuilds every note block at `tempo_scale` and renders each track
    /// through the engine.
    #[instrument(skip(self, engine), fields(tracks = self.tracks.len()))]
    pub fn generate(
        &mut self,
        engine: &mut AudioEngine,
        tempo_scale: f64,
    ) -> Result<(), SequencerError> {
        engine.collect_finished_stream();
        if engine.has_stream() {
            return Err(SequencerError::StreamActive);
        }

        self.build_notes(tempo_scale);
        let mut max_samples = 0;
        for track in &mut self.tracks {
            let samples = engine.render_track(track);
            max_samples = max_samples.max(samples.len());
            track.set_samples(samples);
        }
        self.cursor.reset(0, max_samples);
        info!(max_samples, time_scale = self.time_scale, "sequence generated");
        Ok(())
    }

    /// Note-block half of [`Sequencer::generate`]; clears rendered samples.
    pub fn build_notes(&mut self, tempo_scale: f64) {
        let tempo_scale = if tempo_scale.is_finite() {
            tempo_scale.clamp(TEMPO_SCALE_MIN, TEMPO_SCALE_MAX)
        } else {
            1.0
        };
        self.time_scale = 1.0 / tempo_scale;

        let mut time_max = 0.0_f64;
        for track in &mut self.tracks {
            track.clear_notes();
            track.clear_samples();
            let events = std::mem::take(&mut track.note_events);
            for event in &events {
                if let Some(time) = apply_note_event(
                    track,
                    event,
                    &self.tempo_map,
                    self.time_scale,
                    self.config.clamp_policy,
                ) {
                    time_max = time_max.max(time);
                }
            }
            track.note_events = events;
        }

        let time_max = time_max + self.config.end_margin_seconds;
        for note in self.tracks.iter_mut().flat_map(SequenceTrack::lanes_mut) {
            note.off = note.off.min(time_max);
            note.sustain_off = note.sustain_off.min(time_max);
        }
        self.detach_cursor();
        debug!(time_max, "note blocks built");
    }

    /// Keys sounding in any track at `time`, indexed from A0.
    #[must_use]
    pub fn sounding_keys(&self, time: f64) -> [bool; KEY_COUNT] {
        let mut keys = [false; KEY_COUNT];
        for (index, key) in keys.iter_mut().enumerate() {
            let midi_key = LOWEST_KEY + index as u8;
            *key = self
                .tracks
                .iter()
                .any(|track| track.is_key_sounding(midi_key, time));
        }
        keys
    }

    #[must_use]
    pub fn summary(&self) -> SequenceSummary {
        SequenceSummary {
            name: self.name.clone(),
            ticks_per_quarter: self.ticks_per_quarter(),
            tempo_changes: self.tempo_map.len(),
            initial_bpm: self.tempo_map.bpm_at(0),
            time_scale: self.time_scale,
            duration_seconds: self.duration_seconds(),
            max_sample_count: self.max_sample_count(),
            tracks: self.tracks.iter().map(TrackSummary::from).collect(),
        }
    }
}

/// Splits one source track into per-channel tracks in channel order, keeping
/// only channels with note events. Sustain pedal changes are collected per
/// channel across all source tracks.
fn demux_channels(
    chunk: &TrackChunk,
    name: &str,
    pedal_by_channel: &mut BTreeMap<u8, Vec<PedalChange>>,
) -> Vec<SequenceTrack> {
    let mut by_channel: BTreeMap<u8, SequenceTrack> = BTreeMap::new();
    for event in &chunk.events {
        let Some(command) = event.command() else {
            continue;
        };
        let channel = event.channel();
        match (command, event.data.as_slice()) {
            (0xC0, &[program]) => {
                by_channel
                    .entry(channel)
                    .or_insert_with(|| SequenceTrack::new(channel, name))
                    .instrument = program;
            }
            (0x80 | 0x90, &[key, velocity]) => {
                by_channel
                    .entry(channel)
                    .or_insert_with(|| SequenceTrack::new(channel, name))
                    .note_events
                    .push(NoteEvent {
                        tick: event.absolute_ticks,
                        key,
                        velocity: velocity & 0x7F,
                        on: command == 0x90 && velocity & 0x7F != 0,
                    });
            }
            (0xB0, &[SUSTAIN_CONTROLLER, value]) => {
                pedal_by_channel.entry(channel).or_default().push(PedalChange {
                    tick: event.absolute_ticks,
                    pressed: value >= PEDAL_PRESSED_THRESHOLD,
                });
            }
            _ => {}
        }
    }

    by_channel
        .into_values()
        .filter(|track| !track.note_events.is_empty())
        .collect()
}

/// Applies one buffered note event to its key lane and returns the scaled
/// event time, or `None` for keys off the keyboard.
fn apply_note_event(
    track: &mut SequenceTrack,
    event: &NoteEvent,
    tempo_map: &TempoMap,
    time_scale: f64,
    policy: ClampPolicy,
) -> Option<f64> {
    let index = key_index(event.key)?;
    let time = time_scale * tempo_map.ticks_to_seconds(event.tick);

    if event.on {
        let velocity = f64::from(event.velocity) / 127.0;
        track.lane_mut(index).push(NoteBlock::open(velocity, time));
        return Some(time);
    }

    let sustain_release = pedal_pressed_at(&track.pedal_changes, event.tick).then(|| {
        next_pedal_release(&track.pedal_changes, event.tick)
            .map_or(f64::INFINITY, |tick| time_scale * tempo_map.ticks_to_seconds(tick))
    });

    let lane = track.lane_mut(index);
    if let Some(last) = lane.last_mut() {
        last.off = last.off.min(time);
        last.sustain_off = sustain_release.unwrap_or(last.off);
    }
    if policy == ClampPolicy::AllNotesOnKey {
        for note in lane.iter_mut() {
            note.off = note.off.min(time);
        }
    }
    Some(time)
}

/// Pedal state at `tick`: the last change at or before it, released if none.
#[must_use]
pub fn pedal_pressed_at(changes: &[PedalChange], tick: u64) -> bool {
    changes
        .iter()
        .take_while(|change| change.tick <= tick)
        .last()
        .is_some_and(|change| change.pressed)
}

/// Tick of the first release strictly after `tick`.
#[must_use]
pub fn next_pedal_release(changes: &[PedalChange], tick: u64) -> Option<u64> {
    changes
        .iter()
        .find(|change| change.tick > tick && !change.pressed)
        .map(|change| change.tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn pedal(tick: u64, pressed: bool) -> PedalChange {
        PedalChange { tick, pressed }
    }

    #[test]
    fn pedal_queries_follow_change_list() {
        let changes = [pedal(100, true), pedal(200, false), pedal(300, true)];
        assert!(!pedal_pressed_at(&changes, 99));
        assert!(pedal_pressed_at(&changes, 100));
        assert!(pedal_pressed_at(&changes, 199));
        assert!(!pedal_pressed_at(&changes, 200));
        assert_eq!(next_pedal_release(&changes, 100), Some(200));
        assert_eq!(next_pedal_release(&changes, 200), None);
        assert!(!pedal_pressed_at(&[], 0));
    }

    #[test]
    fn tempo_scale_is_clamped() {
        let mut sequencer = Sequencer::default();
        sequencer
            .load_bytes(&fixtures::single_note_bytes())
            .expect("fixture should load");

        sequencer.build_notes(4.0);
        assert!((sequencer.time_scale() - 0.5).abs() < 1e-12);
        sequencer.build_notes(0.1);
        assert!((sequencer.time_scale() - 2.0).abs() < 1e-12);
        sequencer.build_notes(f64::NAN);
        assert!((sequencer.time_scale() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn channels_split_into_ordered_tracks() {
        let mut sequencer = Sequencer::default();
        sequencer
            .load_bytes(&fixtures::multi_channel_bytes())
            .expect("fixture should load");

        let channels: Vec<u8> = sequencer.tracks().iter().map(|track| track.channel).collect();
        assert_eq!(channels, vec![0, 1, 9]);
        assert_eq!(sequencer.tracks()[1].instrument, 40);
        assert_eq!(sequencer.tracks()[0].colors, palette_color(0));
        assert_eq!(sequencer.tracks()[2].colors, palette_color(2));
        assert_eq!(sequencer.name(), "Multi");
        assert_eq!(sequencer.tracks()[0].name, "Band");
    }

    #[test]
    fn failed_load_leaves_sequencer_empty() {
        let mut sequencer = Sequencer::default();
        sequencer
            .load_bytes(&fixtures::single_note_bytes())
            .expect("fixture should load");
        assert!(!sequencer.is_empty());

        let err = sequencer
            .load_bytes(b"MThd\0\0\0\x06garbage")
            .expect_err("garbage must fail");
        assert!(matches!(err, SequencerError::Codec(_)));
        assert!(sequencer.is_empty());
        assert_eq!(sequencer.name(), "");
    }

    #[test]
    fn unsupported_headers_are_rejected() {
        let mut sequencer = Sequencer::default();
        let format2 = MidiFile::new(2, 480, vec![TrackChunk::default()]);
        assert!(matches!(
            sequencer.load_file(&format2),
            Err(SequencerError::UnsupportedFormat(2))
        ));

        let empty = MidiFile::new(1, 480, Vec::new());
        assert!(matches!(
            sequencer.load_file(&empty),
            Err(SequencerError::NoTracks)
        ));

        let zero = MidiFile::new(0, 0, vec![TrackChunk::default()]);
        assert!(matches!(
            sequencer.load_file(&zero),
            Err(SequencerError::ZeroDivision)
        ));
    }
}

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use midir::{Ignore, MidiInput, MidiInputConnection};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{
    codec::{
        MAX_VARIABLE_LENGTH, META_END_OF_TRACK, META_TEMPO, META_TIME_SIGNATURE, META_TRACK_NAME,
        MidiEvent, MidiFile, RunningStatus, STATUS_META, STATUS_SYSEX, TrackChunk,
        is_terminated_sysex,
    },
    config::RecorderConfig,
    export::{executable_dir, write_midi},
    model::{NoteBlock, RECORDER_COLORS, SequenceTrack, key_index},
};

pub const RECORDING_DIVISION: u16 = 0x7800;
pub const RECORDING_SECONDS_PER_QUARTER: f64 = 0.5;
const CLIENT_NAME: &str = "pianolane";
const TEMPO_120_BPM: [u8; 3] = [0x07, 0xA1, 0x20];
const TIME_SIGNATURE_4_4: [u8; 4] = [0x04, 0x02, 0x18, 0x08];

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create midi input: {0}")]
    Init(String),
    #[error("no midi input port at index {index} ({count} available)")]
    NoPort { index: usize, count: usize },
    #[error("failed to open midi input port: {0}")]
    Connect(String),
    #[error("recording is active")]
    RecordingActive,
    #[error("io error: {0}")]
    Io(String),
}

impl From<anyhow::Error> for RecorderError {
    fn from(value: anyhow::Error) -> Self {
        Self::Io(format!("{value:#}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    /// Port open, waiting for the first message to start the clock.
    Armed,
    Recording,
}

/// One captured message. Messages that relied on running status are stored
/// with their status byte restored.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub delta_seconds: f64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Capture {
    state: RecorderState,
    track: SequenceTrack,
    raw: Vec<RawEvent>,
    running: RunningStatus,
    started_at: Option<Instant>,
    last_message_at: Option<Instant>,
    stopped_at_seconds: f64,
}

impl Capture {
    fn new() -> Self {
        let mut track = SequenceTrack::new(0, "");
        track.colors = RECORDER_COLORS;
        Self {
            state: RecorderState::Idle,
            track,
            raw: Vec::new(),
            running: RunningStatus::default(),
            started_at: None,
            last_message_at: None,
            stopped_at_seconds: 0.0,
        }
    }

    fn elapsed(&self, now: Instant) -> f64 {
        self.started_at
            .map_or(0.0, |start| now.saturating_duration_since(start).as_secs_f64())
    }

    fn receive(&mut self, now: Instant, bytes: &[u8]) {
        if self.state == RecorderState::Idle || bytes.is_empty() {
            return;
        }

        let delta_seconds = if self.state == RecorderState::Armed {
            self.state = RecorderState::Recording;
            self.started_at = Some(now);
            0.0
        } else {
            self.last_message_at
                .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f64())
        };
        self.last_message_at = Some(now);
        let time = self.elapsed(now);

        let (status, data) = if bytes[0] & 0x80 != 0 {
            self.running.observe(bytes[0]);
            (Some(bytes[0]), &bytes[1..])
        } else {
            (self.running.current(), bytes)
        };

        if let (Some(status), &[key, velocity]) = (status, data) {
            self.apply_note(status, key, velocity, time);
        }

        let mut stored = Vec::with_capacity(data.len() + 1);
        if let Some(status) = status {
            stored.push(status);
        }
        stored.extend_from_slice(data);
        self.raw.push(RawEvent {
            delta_seconds,
            bytes: stored,
        });
    }

    fn apply_note(&mut self, status: u8, key: u8, velocity: u8, time: f64) {
        let command = status & 0xF0;
        if command != 0x80 && command != 0x90 {
            return;
        }
        let Some(index) = key_index(key) else {
            return;
        };
        let velocity = velocity & 0x7F;
        let lane = self.track.lane_mut(index);
        if command == 0x90 && velocity != 0 {
            lane.push(NoteBlock::open(f64::from(velocity) / 127.0, time));
        } else if let Some(last) = lane.last_mut() {
            last.off = time;
            last.sustain_off = time;
        }
    }
}

/// Live MIDI capture. The input callback and readers share one lock over
/// the note lanes and the raw event list.
pub struct Recorder {
    config: RecorderConfig,
    capture: Arc<Mutex<Capture>>,
    connection: Option<MidiInputConnection<()>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl Recorder {
    #[must_use]
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            capture: Arc::new(Mutex::new(Capture::new())),
            connection: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.capture.lock().state
    }

    #[must_use]
    pub fn is_port_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Opens the configured input port and arms the capture. On failure the
    /// previous capture is left untouched.
    #[instrument(skip(self), fields(port_index = self.config.port_index))]
    pub fn start_recording(&mut self) -> Result<(), RecorderError> {
        self.stop_recording();
        let connection = match self.open_port() {
            Ok(connection) => connection,
            Err(err) => {
                error!(%err, "could not start recording");
                return Err(err);
            }
        };
        self.connection = Some(connection);
        // Anything delivered before arming was dropped as stale input.
        self.arm();
        info!("recording armed");
        Ok(())
    }

    fn open_port(&self) -> Result<MidiInputConnection<()>, RecorderError> {
        let mut input =
            MidiInput::new(CLIENT_NAME).map_err(|err| RecorderError::Init(err.to_string()))?;
        input.ignore(Ignore::None);

        let ports = input.ports();
        let index = self.config.port_index;
        let port = ports.get(index).cloned().ok_or(RecorderError::NoPort {
            index,
            count: ports.len(),
        })?;
        let port_name = input.port_name(&port).unwrap_or_default();

        let capture = Arc::clone(&self.capture);
        let connection = input
            .connect(
                &port,
                "pianolane-input",
                move |_stamp, bytes, _| capture.lock().receive(Instant::now(), bytes),
                (),
            )
            .map_err(|err| RecorderError::Connect(err.to_string()))?;
        info!(port = %port_name, "midi input connected");
        Ok(connection)
    }

    /// Clears prior capture data and waits for the first message.
    pub fn arm(&self) {
        let mut capture = self.capture.lock();
        capture.track.clear_notes();
        capture.raw.clear();
        capture.running.clear();
        capture.started_at = None;
        capture.last_message_at = None;
        capture.stopped_at_seconds = 0.0;
        capture.state = RecorderState::Armed;
    }

    /// Closes the port and keeps the capture for export.
    pub fn stop_recording(&mut self) {
        if let Some(connection) = self.connection.take() {
            let (_input, ()) = connection.close();
            info!("midi input closed");
        }
        let mut capture = self.capture.lock();
        if capture.state != RecorderState::Idle {
            capture.stopped_at_seconds = capture.elapsed(Instant::now());
            capture.state = RecorderState::Idle;
            info!(
                events = capture.raw.len(),
                notes = capture.track.note_count(),
                "recording stopped"
            );
        }
    }

    /// Entry point of the input callback; ignored while idle.
    pub fn receive_at(&self, now: Instant, bytes: &[u8]) {
        self.capture.lock().receive(now, bytes);
    }

    #[must_use]
    pub fn time_pointer(&self) -> f64 {
        let capture = self.capture.lock();
        match capture.state {
            RecorderState::Idle => capture.stopped_at_seconds,
            RecorderState::Armed => 0.0,
            RecorderState::Recording => capture.elapsed(Instant::now()),
        }
    }

    pub fn with_track<R>(&self, read: impl FnOnce(&SequenceTrack) -> R) -> R {
        read(&self.capture.lock().track)
    }

    pub fn raw_events(&self) -> Result<Vec<RawEvent>, RecorderError> {
        let capture = self.capture.lock();
        if capture.state != RecorderState::Idle {
            return Err(RecorderError::RecordingActive);
        }
        Ok(capture.raw.clone())
    }

    pub fn to_midi_file(&self) -> Result<MidiFile, RecorderError> {
        Ok(build_recording_file(&self.raw_events()?))
    }

    /// Saves into the configured output directory, or next to the executable.
    pub fn save(&self) -> Result<PathBuf, RecorderError> {
        let dir = match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => executable_dir()?,
        };
        self.save_to(&dir)
    }

    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf, RecorderError> {
        let file = self.to_midi_file()?;
        let path = dir.join(recording_file_name());
        write_midi(&file, &path)?;
        info!(path = %path.display(), "recording saved");
        Ok(path)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop_recording();
    }
}

#[must_use]
pub fn recording_file_name() -> String {
    Utc::now().format("Recording%Y%m%d%H%M%S.mid").to_string()
}

/// Two-track format 1 file at 30720 ticks per quarter and a fixed 120 BPM.
#[must_use]
pub fn build_recording_file(raw: &[RawEvent]) -> MidiFile {
    let mut info_track = TrackChunk::new(vec![
        MidiEvent::meta(0, META_TRACK_NAME, &[]),
        MidiEvent::meta(0, META_TEMPO, &TEMPO_120_BPM),
        MidiEvent::meta(0, META_TIME_SIGNATURE, &TIME_SIGNATURE_4_4),
        MidiEvent::meta(0, META_END_OF_TRACK, &[]),
    ]);

    let mut events = Vec::with_capacity(raw.len() + 18);
    events.push(MidiEvent::meta(0, META_TRACK_NAME, &[]));
    events.extend((0..16_u8).map(|channel| MidiEvent::new(0, 0xC0 | channel, vec![0])));

    let ticks_per_second = f64::from(RECORDING_DIVISION) / RECORDING_SECONDS_PER_QUARTER;
    let mut pending_seconds = 0.0;
    let mut tick_error = 0.0;
    for event in raw {
        pending_seconds += event.delta_seconds.max(0.0);
        let Some((&status, data)) = event.bytes.split_first() else {
            continue;
        };
        // 0xFF is system reset on the wire but a meta marker inside a file.
        if status & 0x80 == 0
            || status == STATUS_META
            || (status == STATUS_SYSEX && !is_terminated_sysex(data))
        {
            warn!(status, "skipping message that cannot be stored in a track");
            continue;
        }

        let ticks = tick_error + ticks_per_second * pending_seconds;
        let whole = ticks.floor();
        tick_error = ticks - whole;
        pending_seconds = 0.0;
        let delta_time = whole.min(f64::from(MAX_VARIABLE_LENGTH)) as u32;
        events.push(MidiEvent::new(delta_time, status, data.to_vec()));
    }
    events.push(MidiEvent::meta(0, META_END_OF_TRACK, &[]));

    let mut track = TrackChunk::new(events);
    track.recompute_absolute_ticks();
    info_track.recompute_absolute_ticks();
    MidiFile::new(1, RECORDING_DIVISION, vec![info_track, track])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn raw(delta_seconds: f64, bytes: &[u8]) -> RawEvent {
        RawEvent {
            delta_seconds,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn idle_recorder_ignores_input() {
        let recorder = Recorder::default();
        recorder.receive_at(Instant::now(), &[0x90, 60, 100]);
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.raw_events().expect("idle").is_empty());
    }

    #[test]
    fn first_message_starts_the_clock() {
        let mut recorder = Recorder::default();
        recorder.arm();
        assert_eq!(recorder.state(), RecorderState::Armed);
        assert!(recorder.time_pointer().abs() < f64::EPSILON);

        let start = Instant::now();
        recorder.receive_at(start, &[0x90, 60, 100]);
        recorder.receive_at(start + Duration::from_millis(500), &[60, 0]);
        assert_eq!(recorder.state(), RecorderState::Recording);
        assert!(matches!(
            recorder.raw_events(),
            Err(RecorderError::RecordingActive)
        ));

        recorder.with_track(|track| {
            let lane = track.lane(60);
            assert_eq!(lane.len(), 1);
            assert!(lane[0].on.abs() < f64::EPSILON);
            assert!((lane[0].off - 0.5).abs() < 1e-9);
        });

        recorder.stop_recording();
        let events = recorder.raw_events().expect("stopped recorder is idle");
        assert_eq!(events.len(), 2);
        assert!(events[0].delta_seconds.abs() < f64::EPSILON);
        assert!((events[1].delta_seconds - 0.5).abs() < 1e-9);
        assert_eq!(events[1].bytes, vec![0x90, 60, 0]);
    }

    #[test]
    fn out_of_range_and_non_note_messages_are_only_captured_raw() {
        let recorder = Recorder::default();
        recorder.arm();
        let now = Instant::now();
        recorder.receive_at(now, &[0x90, 10, 100]);
        recorder.receive_at(now, &[0xB0, 64, 127]);
        recorder.receive_at(now, &[0xF8]);
        recorder.with_track(|track| assert_eq!(track.note_count(), 0));
        assert_eq!(recorder.capture.lock().raw.len(), 3);
        assert_eq!(recorder.with_track(|track| track.colors), RECORDER_COLORS);
    }

    #[test]
    fn ticks_carry_rounding_error() {
        let events = [
            raw(0.0, &[0x90, 60, 100]),
            raw(0.000_01, &[0x80, 60, 0]),
            raw(0.000_01, &[0x90, 62, 100]),
        ];
        let file = build_recording_file(&events);
        let deltas: Vec<u32> = file.tracks[1].events[17..20]
            .iter()
            .map(|event| event.delta_time)
            .collect();
        // 0.6144 ticks per event: floor(0.6144) then floor(1.2288).
        assert_eq!(deltas, vec![0, 0, 1]);
    }

    #[test]
    fn system_reset_time_carries_into_next_event() {
        let events = [
            raw(0.0, &[0x90, 60, 100]),
            raw(0.25, &[0xFF]),
            raw(0.25, &[0x80, 60, 0]),
        ];
        let file = build_recording_file(&events);
        let track = &file.tracks[1];
        assert_eq!(track.events.len(), 1 + 16 + 2 + 1);
        assert_eq!(track.events[18].status, 0x80);
        assert_eq!(track.events[18].delta_time, 30_720);
    }

    #[test]
    fn only_complete_sysex_is_exported() {
        let events = [
            raw(0.0, &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]),
            raw(0.5, &[0xF0, 0x43, 0x12]),
            raw(0.0, &[0x90, 60, 100]),
        ];
        let file = build_recording_file(&events);
        let track = &file.tracks[1];
        assert_eq!(track.events[17].status, 0xF0);
        assert_eq!(track.events[17].data, vec![0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert_eq!(track.events[18].status, 0x90);
        assert_eq!(track.events[18].delta_time, 30_720);
        assert!(file.encode().is_ok());
    }

    #[test]
    fn recording_file_layout_is_fixed() {
        let file = build_recording_file(&[]);
        assert_eq!(file.header.format, 1);
        assert_eq!(file.header.division, 0x7800);
        let info = &file.tracks[0];
        assert_eq!(info.events[1].data, vec![0x51, 0x03, 0x07, 0xA1, 0x20]);
        assert_eq!(info.events[2].data, vec![0x58, 0x04, 0x04, 0x02, 0x18, 0x08]);
        assert!(file.tracks[1].events[1..17]
            .iter()
            .enumerate()
            .all(|(channel, event)| event.status == (0xC0 | channel as u8) && event.data == [0]));
    }

    #[test]
    fn file_name_follows_utc_pattern() {
        let name = recording_file_name();
        assert!(name.starts_with("Recording"));
        assert!(name.ends_with(".mid"));
        assert_eq!(name.len(), "Recording".len() + 14 + 4);
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const KEY_COUNT: usize = 88;
pub const LOWEST_KEY: u8 = 21;
pub const HIGHEST_KEY: u8 = 108;
pub const SUSTAIN_CONTROLLER: u8 = 0x40;
pub const PEDAL_PRESSED_THRESHOLD: u8 = 64;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    #[must_use]
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Lane colors for white and black keys of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPair {
    pub white: Rgb,
    pub black: Rgb,
}

pub const PALETTE: [ColorPair; 7] = [
    ColorPair {
        white: Rgb(145, 222, 64),
        black: Rgb(94, 154, 27),
    },
    ColorPair {
        white: Rgb(116, 155, 196),
        black: Rgb(62, 101, 145),
    },
    ColorPair {
        white: Rgb(237, 177, 32),
        black: Rgb(151, 109, 13),
    },
    ColorPair {
        white: Rgb(217, 83, 25),
        black: Rgb(156, 60, 18),
    },
    ColorPair {
        white: Rgb(126, 47, 142),
        black: Rgb(84, 31, 95),
    },
    ColorPair {
        white: Rgb(162, 20, 47),
        black: Rgb(131, 16, 39),
    },
    ColorPair {
        white: Rgb(0, 114, 189),
        black: Rgb(0, 91, 153),
    },
];

pub const RECORDER_COLORS: ColorPair = ColorPair {
    white: Rgb(180, 0, 0),
    black: Rgb(100, 0, 0),
};

#[must_use]
pub fn palette_color(index: usize) -> ColorPair {
    PALETTE[index % PALETTE.len()]
}

/// Lane index for a MIDI key, `None` outside A0..=C8.
#[must_use]
pub fn key_index(key: u8) -> Option<usize> {
    (LOWEST_KEY..=HIGHEST_KEY)
        .contains(&key)
        .then(|| usize::from(key - LOWEST_KEY))
}

#[must_use]
pub fn is_black_key(key: u8) -> bool {
    matches!(key % 12, 1 | 3 | 6 | 8 | 10)
}

/// Scientific pitch name, middle C (60) is `C4`.
#[must_use]
pub fn key_name(key: u8) -> String {
    let octave = i32::from(key / 12) - 1;
    format!("{}{octave}", NOTE_NAMES[usize::from(key % 12)])
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteBlock {
    pub velocity: f64,
    pub on: f64,
    pub off: f64,
    pub sustain_off: f64,
}

impl NoteBlock {
    /// An open note: both off times start at infinity until a note-off arrives.
    #[must_use]
    pub fn open(velocity: f64, on: f64) -> Self {
        Self {
            velocity,
            on,
            off: f64::INFINITY,
            sustain_off: f64::INFINITY,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.off.is_infinite()
    }

    #[must_use]
    pub fn is_sounding(&self, time: f64) -> bool {
        self.on <= time && time < self.off
    }

    #[must_use]
    pub fn duration(&self) -> f64 {
        self.off - self.on
    }
}

/// Buffered note-on/off from the source file, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub tick: u64,
    pub key: u8,
    pub velocity: u8,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PedalChange {
    pub tick: u64,
    pub pressed: bool,
}

#[derive(Debug, Clone)]
pub struct SequenceTrack {
    pub channel: u8,
    pub name: String,
    pub instrument: u8,
    pub colors: ColorPair,
    lanes: Vec<Vec<NoteBlock>>,
    samples: Arc<[f32]>,
    pub(crate) note_events: Vec<NoteEvent>,
    pub(crate) pedal_changes: Vec<PedalChange>,
}

impl SequenceTrack {
    #[must_use]
    pub fn new(channel: u8, name: impl Into<String>) -> Self {
        Self {
            channel,
            name: name.into(),
            instrument: 0,
            colors: PALETTE[0],
            lanes: vec![Vec::new(); KEY_COUNT],
            samples: Arc::from(Vec::new()),
            note_events: Vec::new(),
            pedal_changes: Vec::new(),
        }
    }

    #[must_use]
    pub fn lanes(&self) -> &[Vec<NoteBlock>] {
        &self.lanes
    }

    /// Notes of one MIDI key, empty outside the piano range.
    #[must_use]
    pub fn lane(&self, key: u8) -> &[NoteBlock] {
        key_index(key).map_or(&[][..], |index| self.lanes[index].as_slice())
    }

    pub(crate) fn lane_mut(&mut self, index: usize) -> &mut Vec<NoteBlock> {
        &mut self.lanes[index]
    }

    pub(crate) fn lanes_mut(&mut self) -> impl Iterator<Item = &mut NoteBlock> {
        self.lanes.iter_mut().flatten()
    }

    pub fn clear_notes(&mut self) {
        for lane in &mut self.lanes {
            lane.clear();
        }
    }

    #[must_use]
    pub fn note_events(&self) -> &[NoteEvent] {
        &self.note_events
    }

    #[must_use]
    pub fn pedal_changes(&self) -> &[PedalChange] {
        &self.pedal_changes
    }

    #[must_use]
    pub fn note_count(&self) -> usize {
        self.lanes.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_key_sounding(&self, key: u8, time: f64) -> bool {
        self.lane(key).iter().any(|note| note.is_sounding(time))
    }

    /// Latest audible end across every lane, `0.0` for a silent track.
    #[must_use]
    pub fn latest_sustain_off(&self) -> f64 {
        self.lanes
            .iter()
            .flatten()
            .map(|note| note.sustain_off)
            .fold(0.0, f64::max)
    }

    #[must_use]
    pub fn latest_off(&self) -> f64 {
        self.lanes
            .iter()
            .flatten()
            .map(|note| note.off)
            .fold(0.0, f64::max)
    }

    /// Interleaved stereo render output, shared with the audio callback.
    #[must_use]
    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn set_samples(&mut self, samples: Vec<f32>) {
        self.samples = Arc::from(samples);
    }

    pub fn clear_samples(&mut self) {
        self.samples = Arc::from(Vec::new());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackSummary {
    pub channel: u8,
    pub name: String,
    pub instrument: u8,
    pub color: String,
    pub note_count: usize,
    pub pedal_changes: usize,
    pub rendered_samples: usize,
    pub latest_off_seconds: f64,
}

impl From<&SequenceTrack> for TrackSummary {
    fn from(track: &SequenceTrack) -> Self {
        Self {
            channel: track.channel,
            name: track.name.clone(),
            instrument: track.instrument,
            color: track.colors.white.hex(),
            note_count: track.note_count(),
            pedal_changes: track.pedal_changes.len(),
            rendered_samples: track.samples.len(),
            latest_off_seconds: track.latest_off(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_index_covers_piano_range_only() {
        assert_eq!(key_index(20), None);
        assert_eq!(key_index(21), Some(0));
        assert_eq!(key_index(60), Some(39));
        assert_eq!(key_index(108), Some(87));
        assert_eq!(key_index(109), None);
    }

    #[test]
    fn key_names_follow_scientific_pitch() {
        assert_eq!(key_name(21), "A0");
        assert_eq!(key_name(60), "C4");
        assert_eq!(key_name(61), "C#4");
        assert_eq!(key_name(108), "C8");
        assert!(is_black_key(61));
        assert!(!is_black_key(60));
    }

    #[test]
    fn palette_cycles_after_seven_tracks() {
        assert_eq!(palette_color(0), palette_color(7));
        assert_ne!(palette_color(0), palette_color(1));
        assert_eq!(palette_color(6).white.hex(), "#0072bd");
    }

    #[test]
    fn sounding_interval_is_half_open() {
        let note = NoteBlock {
            velocity: 1.0,
            on: 1.0,
            off: 2.0,
            sustain_off: 3.0,
        };
        assert!(!note.is_sounding(0.999));
        assert!(note.is_sounding(1.0));
        assert!(note.is_sounding(1.5));
        assert!(!note.is_sounding(2.0));
    }

    #[test]
    fn track_queries_scan_all_lanes() {
        let mut track = SequenceTrack::new(0, "Piano");
        assert!(track.lane(10).is_empty());
        assert!(track.latest_sustain_off().abs() < f64::EPSILON);

        let index = key_index(60).expect("middle c is on the keyboard");
        track.lane_mut(index).push(NoteBlock {
            velocity: 0.5,
            on: 0.0,
            off: 0.5,
            sustain_off: 2.0,
        });

        assert_eq!(track.note_count(), 1);
        assert!(track.is_key_sounding(60, 0.25));
        assert!(!track.is_key_sounding(60, 0.75));
        assert!(!track.is_key_sounding(61, 0.25));
        assert!((track.latest_sustain_off() - 2.0).abs() < f64::EPSILON);

        let summary = TrackSummary::from(&track);
        assert_eq!(summary.note_count, 1);
        assert_eq!(summary.color, "#91de40");
    }
}

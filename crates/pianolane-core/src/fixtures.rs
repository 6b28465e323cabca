use crate::codec::{
    META_END_OF_TRACK, META_TEMPO, META_TIME_SIGNATURE, META_TRACK_NAME, MidiEvent, MidiFile,
    TrackChunk,
};

pub const FIXTURE_DIVISION: u16 = 480;
const MICROS_120_BPM: [u8; 3] = [0x07, 0xA1, 0x20];

fn track(events: Vec<MidiEvent>) -> TrackChunk {
    let mut chunk = TrackChunk::new(events);
    chunk.recompute_absolute_ticks();
    chunk
}

fn conductor_track(name: &str) -> TrackChunk {
    track(vec![
        MidiEvent::meta(0, META_TRACK_NAME, name.as_bytes()),
        MidiEvent::meta(0, META_TEMPO, &MICROS_120_BPM),
        MidiEvent::meta(0, META_TIME_SIGNATURE, &[0x04, 0x02, 0x18, 0x08]),
        MidiEvent::meta(0, META_END_OF_TRACK, &[]),
    ])
}

fn encode(file: &MidiFile) -> Vec<u8> {
    file.encode().expect("fixture midi file should encode")
}

/// Format 1, 120 BPM, one C4 on channel 0 lasting one quarter note.
#[must_use]
pub fn single_note_file() -> MidiFile {
    MidiFile::new(
        1,
        FIXTURE_DIVISION,
        vec![
            conductor_track("Single Note"),
            track(vec![
                MidiEvent::meta(0, META_TRACK_NAME, b"Piano"),
                MidiEvent::new(0, 0xC0, vec![0]),
                MidiEvent::new(0, 0x90, vec![60, 100]),
                MidiEvent::new(480, 0x80, vec![60, 64]),
                MidiEvent::meta(0, META_END_OF_TRACK, &[]),
            ]),
        ],
    )
}

#[must_use]
pub fn single_note_bytes() -> Vec<u8> {
    encode(&single_note_file())
}

/// C4 held for one second while the pedal goes down at 0.5 s and up at 3 s.
#[must_use]
pub fn sustain_file() -> MidiFile {
    MidiFile::new(
        1,
        FIXTURE_DIVISION,
        vec![
            conductor_track("Sustain"),
            track(vec![
                MidiEvent::new(0, 0xC0, vec![0]),
                MidiEvent::new(0, 0x90, vec![60, 100]),
                MidiEvent::new(480, 0xB0, vec![0x40, 127]),
                MidiEvent::new(480, 0x80, vec![60, 0]),
                MidiEvent::new(1_920, 0xB0, vec![0x40, 0]),
                MidiEvent::new(0, 0x90, vec![64, 90]),
                MidiEvent::new(480, 0x90, vec![64, 0]),
                MidiEvent::meta(0, META_END_OF_TRACK, &[]),
            ]),
        ],
    )
}

#[must_use]
pub fn sustain_bytes() -> Vec<u8> {
    encode(&sustain_file())
}

/// One source track carrying drums, piano and strings, plus a channel that
/// only changes program.
#[must_use]
pub fn multi_channel_file() -> MidiFile {
    MidiFile::new(
        1,
        FIXTURE_DIVISION,
        vec![
            conductor_track("Multi"),
            track(vec![
                MidiEvent::meta(0, META_TRACK_NAME, b"Band"),
                MidiEvent::new(0, 0xC5, vec![12]),
                MidiEvent::new(0, 0x99, vec![36, 110]),
                MidiEvent::new(0, 0xC1, vec![40]),
                MidiEvent::new(0, 0x91, vec![67, 80]),
                MidiEvent::new(0, 0x90, vec![48, 90]),
                MidiEvent::new(240, 0x89, vec![36, 0]),
                MidiEvent::new(720, 0x81, vec![67, 0]),
                MidiEvent::new(0, 0x80, vec![48, 0]),
                MidiEvent::meta(0, META_END_OF_TRACK, &[]),
            ]),
        ],
    )
}

#[must_use]
pub fn multi_channel_bytes() -> Vec<u8> {
    encode(&multi_channel_file())
}

/// Format 0 file whose only note (key 10) lies below A0.
#[must_use]
pub fn out_of_range_bytes() -> Vec<u8> {
    encode(&MidiFile::new(
        0,
        FIXTURE_DIVISION,
        vec![track(vec![
            MidiEvent::meta(0, META_TEMPO, &MICROS_120_BPM),
            MidiEvent::new(0, 0x90, vec![10, 100]),
            MidiEvent::new(480, 0x80, vec![10, 0]),
            MidiEvent::meta(0, META_END_OF_TRACK, &[]),
        ])],
    ))
}

/// A two-bar C major phrase with a bass line and a pedalled final chord.
#[must_use]
pub fn demo_file() -> MidiFile {
    let eighth = u32::from(FIXTURE_DIVISION / 2);
    let mut melody = vec![
        MidiEvent::meta(0, META_TRACK_NAME, b"Melody"),
        MidiEvent::new(0, 0xC0, vec![0]),
    ];
    for key in [60_u8, 64, 67, 72, 71, 67, 64, 62] {
        melody.push(MidiEvent::new(0, 0x90, vec![key, 96]));
        melody.push(MidiEvent::new(eighth, 0x80, vec![key, 64]));
    }
    melody.push(MidiEvent::new(0, 0xB0, vec![0x40, 127]));
    for key in [60_u8, 64, 67] {
        melody.push(MidiEvent::new(0, 0x90, vec![key, 88]));
    }
    for key in [60_u8, 64, 67] {
        let delta = if key == 60 { eighth } else { 0 };
        melody.push(MidiEvent::new(delta, 0x80, vec![key, 64]));
    }
    melody.push(MidiEvent::new(eighth * 7, 0xB0, vec![0x40, 0]));
    melody.push(MidiEvent::meta(0, META_END_OF_TRACK, &[]));

    let quarter = u32::from(FIXTURE_DIVISION);
    let mut bass = vec![
        MidiEvent::meta(0, META_TRACK_NAME, b"Bass"),
        MidiEvent::new(0, 0xC1, vec![32]),
    ];
    for key in [36_u8, 43, 41, 43, 36] {
        bass.push(MidiEvent::new(0, 0x91, vec![key, 100]));
        bass.push(MidiEvent::new(quarter, 0x81, vec![key, 64]));
    }
    bass.push(MidiEvent::meta(0, META_END_OF_TRACK, &[]));

    MidiFile::new(
        1,
        FIXTURE_DIVISION,
        vec![conductor_track("Demo"), track(melody), track(bass)],
    )
}

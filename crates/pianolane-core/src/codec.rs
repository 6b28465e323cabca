//! Standard MIDI File chunk codec.
//!
//! Decoding keeps every event byte it reads: meta events carry their type byte,
//! the raw variable-length length field and the payload in `data`, so encoding
//! writes them back untouched.

use std::{fs, path::Path};

use thiserror::Error;
use tracing::{debug, instrument};

pub const HEADER_MAGIC: [u8; 4] = *b"MThd";
pub const TRACK_MAGIC: [u8; 4] = *b"MTrk";
pub const HEADER_LENGTH: u32 = 6;
pub const MAX_VARIABLE_LENGTH: u32 = 0x0FFF_FFFF;

pub const STATUS_SYSEX: u8 = 0xF0;
pub const STATUS_END_OF_SYSEX: u8 = 0xF7;
pub const STATUS_META: u8 = 0xFF;
pub const META_TRACK_NAME: u8 = 0x03;
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;

const MIN_FILE_LENGTH: usize = 14;
const SMPTE_DIVISION_FLAG: u16 = 0x8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("file too short: {len} bytes")]
    TooShort { len: usize },
    #[error("missing MThd header chunk")]
    BadHeaderMagic,
    #[error("header chunk length must be 6, found {0}")]
    BadHeaderLength(u32),
    #[error("SMPTE timecode division {0:#06x} is not supported")]
    SmpteDivision(u16),
    #[error("header declares {declared} tracks but {decoded} were decoded")]
    TrackCountMismatch { declared: u16, decoded: usize },
    #[error("data byte {byte:#04x} at offset {offset} without running status")]
    MissingRunningStatus { offset: usize, byte: u8 },
    #[error("delta time {0} exceeds the variable-length range")]
    DeltaOutOfRange(u32),
    #[error("system exclusive event {index} must end with its only 0xF7 byte")]
    UnterminatedSysex { index: usize },
    #[error("too many tracks to encode: {0}")]
    TooManyTracks(usize),
    #[error("chunk at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedChunk {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("variable-length quantity at offset {offset} runs past the end of data")]
    TruncatedVariableLength { offset: usize },
    #[error("event at offset {offset} needs {needed} bytes but the chunk ends at {end}")]
    TruncatedEvent {
        offset: usize,
        needed: usize,
        end: usize,
    },
    #[error("io error: {0}")]
    Io(String),
}

impl CodecError {
    /// Truncation-class errors: a declared length runs past the available bytes.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            Self::TruncatedChunk { .. }
                | Self::TruncatedVariableLength { .. }
                | Self::TruncatedEvent { .. }
        )
    }
}

impl From<std::io::Error> for CodecError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MidiEvent {
    pub delta_time: u32,
    pub status: u8,
    pub data: Vec<u8>,
    /// Running sum of `delta_time` within the owning track, recomputed on decode.
    pub absolute_ticks: u64,
}

impl MidiEvent {
    #[must_use]
    pub fn new(delta_time: u32, status: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            delta_time,
            status,
            data: data.into(),
            absolute_ticks: 0,
        }
    }

    /// Builds a meta event, encoding the payload length in front of the payload.
    #[must_use]
    pub fn meta(delta_time: u32, meta_type: u8, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 2);
        data.push(meta_type);
        write_variable_length(payload.len() as u32, &mut data);
        data.extend_from_slice(payload);
        Self::new(delta_time, STATUS_META, data)
    }

    #[must_use]
    pub fn is_meta(&self, meta_type: u8) -> bool {
        self.status == STATUS_META && self.data.first() == Some(&meta_type)
    }

    /// High nibble of a channel-voice status, `None` for system and meta events.
    #[must_use]
    pub fn command(&self) -> Option<u8> {
        is_channel_status(self.status).then_some(self.status & 0xF0)
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    /// Payload of a meta event, without its type byte and length prefix.
    #[must_use]
    pub fn meta_payload(&self) -> Option<&[u8]> {
        if self.status != STATUS_META || self.data.len() < 2 {
            return None;
        }
        let (len, read) = read_variable_length(&self.data[1..]).ok()?;
        let payload = &self.data[1 + read..];
        (payload.len() == len as usize).then_some(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackChunk {
    pub events: Vec<MidiEvent>,
}

impl TrackChunk {
    #[must_use]
    pub fn new(events: Vec<MidiEvent>) -> Self {
        Self { events }
    }

    /// Text of the first sequence/track name meta event, empty when absent or malformed.
    #[must_use]
    pub fn name(&self) -> String {
        self.events
            .iter()
            .find(|event| event.is_meta(META_TRACK_NAME))
            .and_then(MidiEvent::meta_payload)
            .map(|payload| payload.iter().map(|&byte| char::from(byte)).collect())
            .unwrap_or_default()
    }

    pub fn recompute_absolute_ticks(&mut self) {
        let mut ticks = 0_u64;
        for event in &mut self.events {
            ticks += u64::from(event.delta_time);
            event.absolute_ticks = ticks;
        }
    }

    pub fn decode(chunk: &[u8]) -> Result<Self, CodecError> {
        let mut events = Vec::new();
        let mut index = 0_usize;
        let mut running = RunningStatus::default();

        while index < chunk.len() {
            let (delta_time, read) = read_variable_length(&chunk[index..])
                .map_err(|_| CodecError::TruncatedVariableLength { offset: index })?;
            index += read;

            let Some(&next) = chunk.get(index) else {
                return Err(CodecError::TruncatedEvent {
                    offset: index,
                    needed: 1,
                    end: chunk.len(),
                });
            };
            let status = if next & 0x80 == 0 {
                running
                    .current()
                    .ok_or(CodecError::MissingRunningStatus {
                        offset: index,
                        byte: next,
                    })?
            } else {
                index += 1;
                next
            };
            running.observe(status);

            let data = match payload_shape(status) {
                PayloadShape::Fixed(len) => take(chunk, &mut index, len)?.to_vec(),
                PayloadShape::UntilEndOfExclusive => {
                    let start = index;
                    while index < chunk.len() {
                        index += 1;
                        if chunk[index - 1] == STATUS_END_OF_SYSEX {
                            break;
                        }
                    }
                    chunk[start..index].to_vec()
                }
                PayloadShape::Meta => {
                    let start = index;
                    take(chunk, &mut index, 1)?;
                    let (len, read) = read_variable_length(&chunk[index..])
                        .map_err(|_| CodecError::TruncatedVariableLength { offset: index })?;
                    index += read;
                    take(chunk, &mut index, len as usize)?;
                    chunk[start..index].to_vec()
                }
            };

            events.push(MidiEvent::new(delta_time, status, data));
        }

        let mut track = Self { events };
        track.recompute_absolute_ticks();
        Ok(track)
    }

    /// Every status byte is written explicitly; running status is never emitted.
    /// A system exclusive payload must end with its only 0xF7, otherwise the
    /// decoder would read the following events into it.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        for (index, event) in self.events.iter().enumerate() {
            if event.delta_time > MAX_VARIABLE_LENGTH {
                return Err(CodecError::DeltaOutOfRange(event.delta_time));
            }
            if event.status == STATUS_SYSEX && !is_terminated_sysex(&event.data) {
                return Err(CodecError::UnterminatedSysex { index });
            }
            write_variable_length(event.delta_time, out);
            out.push(event.status);
            out.extend_from_slice(&event.data);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    pub format: u16,
    pub num_tracks: u16,
    pub division: u16,
}

impl FileHeader {
    #[must_use]
    pub fn is_smpte(&self) -> bool {
        self.division & SMPTE_DIVISION_FLAG != 0
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            format: u16::from_be_bytes([bytes[0], bytes[1]]),
            num_tracks: u16::from_be_bytes([bytes[2], bytes[3]]),
            division: u16::from_be_bytes([bytes[4], bytes[5]]),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.format.to_be_bytes());
        out.extend_from_slice(&self.num_tracks.to_be_bytes());
        out.extend_from_slice(&self.division.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MidiFile {
    pub header: FileHeader,
    pub tracks: Vec<TrackChunk>,
}

impl MidiFile {
    #[must_use]
    pub fn new(format: u16, division: u16, tracks: Vec<TrackChunk>) -> Self {
        let num_tracks = u16::try_from(tracks.len()).unwrap_or(u16::MAX);
        Self {
            header: FileHeader {
                format,
                num_tracks,
                division,
            },
            tracks,
        }
    }

    #[instrument(fields(path = %path.display()))]
    pub fn read(path: &Path) -> Result<Self, CodecError> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn write(&self, path: &Path) -> Result<(), CodecError> {
        let bytes = self.encode()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    #[instrument(skip(bytes), fields(len = bytes.len()))]
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < MIN_FILE_LENGTH {
            return Err(CodecError::TooShort { len: bytes.len() });
        }
        if bytes[0..4] != HEADER_MAGIC {
            return Err(CodecError::BadHeaderMagic);
        }
        let header_length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if header_length != HEADER_LENGTH {
            return Err(CodecError::BadHeaderLength(header_length));
        }
        let header = FileHeader::decode(&bytes[8..14]);
        if header.is_smpte() {
            return Err(CodecError::SmpteDivision(header.division));
        }

        let mut tracks = Vec::with_capacity(usize::from(header.num_tracks));
        let mut index = MIN_FILE_LENGTH;
        while index + 8 <= bytes.len() {
            let tag = &bytes[index..index + 4];
            let length = u32::from_be_bytes([
                bytes[index + 4],
                bytes[index + 5],
                bytes[index + 6],
                bytes[index + 7],
            ]) as usize;
            index += 8;

            let available = bytes.len() - index;
            if length > available {
                return Err(CodecError::TruncatedChunk {
                    offset: index - 8,
                    declared: length,
                    available,
                });
            }

            if tag == TRACK_MAGIC {
                tracks.push(TrackChunk::decode(&bytes[index..index + length])?);
            } else {
                debug!(
                    tag = %String::from_utf8_lossy(tag),
                    length, "skipping unknown chunk"
                );
            }
            index += length;
        }

        if usize::from(header.num_tracks) != tracks.len() {
            return Err(CodecError::TrackCountMismatch {
                declared: header.num_tracks,
                decoded: tracks.len(),
            });
        }

        debug!(
            format = header.format,
            tracks = tracks.len(),
            division = header.division,
            "midi file decoded"
        );
        Ok(Self { header, tracks })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if usize::from(self.header.num_tracks) != self.tracks.len() {
            return Err(CodecError::TrackCountMismatch {
                declared: self.header.num_tracks,
                decoded: self.tracks.len(),
            });
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&HEADER_MAGIC);
        bytes.extend_from_slice(&HEADER_LENGTH.to_be_bytes());
        self.header.encode(&mut bytes);

        let mut chunk = Vec::new();
        for track in &self.tracks {
            chunk.clear();
            track.encode(&mut chunk)?;
            let length = u32::try_from(chunk.len())
                .map_err(|_| CodecError::TooManyTracks(self.tracks.len()))?;
            bytes.extend_from_slice(&TRACK_MAGIC);
            bytes.extend_from_slice(&length.to_be_bytes());
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Decodes up to four 7-bit groups, big-endian, returning the value and the
/// number of bytes consumed. Fails if a continuation bit points past the input.
pub fn read_variable_length(bytes: &[u8]) -> Result<(u32, usize), CodecError> {
    let mut value = 0_u32;
    for (read, &byte) in bytes.iter().take(4).enumerate() {
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 || read == 3 {
            return Ok((value, read + 1));
        }
    }
    Err(CodecError::TruncatedVariableLength { offset: 0 })
}

/// Appends the shortest encoding of `value` (masked to 28 bits).
pub fn write_variable_length(value: u32, out: &mut Vec<u8>) {
    let value = value & MAX_VARIABLE_LENGTH;
    let mut shift = 21;
    while shift > 0 && value >> shift == 0 {
        shift -= 7;
    }
    while shift > 0 {
        out.push(0x80 | ((value >> shift) & 0x7F) as u8);
        shift -= 7;
    }
    out.push((value & 0x7F) as u8);
}

/// True when a system exclusive payload ends with its first and only 0xF7.
#[must_use]
pub fn is_terminated_sysex(data: &[u8]) -> bool {
    data.iter().position(|&byte| byte == STATUS_END_OF_SYSEX) == data.len().checked_sub(1)
}

#[must_use]
pub fn is_channel_status(status: u8) -> bool {
    (0x80..0xF0).contains(&status)
}

/// Running-status bookkeeping shared by the file decoder and live capture.
///
/// Channel-voice statuses become the running status, system real-time
/// statuses leave it untouched and every other system or meta status clears it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningStatus(Option<u8>);

impl RunningStatus {
    #[must_use]
    pub fn current(self) -> Option<u8> {
        self.0
    }

    pub fn observe(&mut self, status: u8) {
        if is_channel_status(status) {
            self.0 = Some(status);
        } else if !(0xF8..=0xFE).contains(&status) {
            self.0 = None;
        }
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    Fixed(usize),
    UntilEndOfExclusive,
    Meta,
}

fn payload_shape(status: u8) -> PayloadShape {
    match status {
        0x80..=0xBF | 0xE0..=0xEF | 0xF2 => PayloadShape::Fixed(2),
        0xC0..=0xDF | 0xF3 => PayloadShape::Fixed(1),
        STATUS_SYSEX => PayloadShape::UntilEndOfExclusive,
        STATUS_META => PayloadShape::Meta,
        _ => PayloadShape::Fixed(0),
    }
}

fn take<'a>(chunk: &'a [u8], index: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    let end = index
        .checked_add(len)
        .filter(|&end| end <= chunk.len())
        .ok_or(CodecError::TruncatedEvent {
            offset: *index,
            needed: len,
            end: chunk.len(),
        })?;
    let slice = &chunk[*index..end];
    *index = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_chunks(num_tracks: u16, chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MThd");
        bytes.extend_from_slice(&6_u32.to_be_bytes());
        bytes.extend_from_slice(&1_u16.to_be_bytes());
        bytes.extend_from_slice(&num_tracks.to_be_bytes());
        bytes.extend_from_slice(&480_u16.to_be_bytes());
        for (tag, payload) in chunks {
            bytes.extend_from_slice(*tag);
            bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn variable_length_boundaries_use_minimal_width() {
        let cases = [
            (0x00, 1),
            (0x7F, 1),
            (0x80, 2),
            (0x3FFF, 2),
            (0x4000, 3),
            (0x1F_FFFF, 3),
            (0x20_0000, 4),
            (0x0FFF_FFFF, 4),
        ];
        for (value, width) in cases {
            let mut out = Vec::new();
            write_variable_length(value, &mut out);
            assert_eq!(out.len(), width, "width for {value:#x}");
            assert_eq!(read_variable_length(&out), Ok((value, width)));
        }
    }

    #[test]
    fn variable_length_stops_after_four_bytes() {
        let (value, read) = read_variable_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F])
            .expect("four bytes are always accepted");
        assert_eq!(read, 4);
        assert_eq!(value, 0x0FFF_FFFF);
    }

    #[test]
    fn variable_length_with_dangling_continuation_fails() {
        assert!(read_variable_length(&[0x81, 0x80]).is_err());
        assert!(read_variable_length(&[]).is_err());
    }

    #[test]
    fn running_status_reuses_previous_channel_status() {
        let chunk = [
            0x00, 0x90, 60, 100, // note on
            0x10, 64, 90, // running status note on
            0x10, 60, 0, // running status note off via velocity 0
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track = TrackChunk::decode(&chunk).expect("track should decode");
        assert_eq!(track.events.len(), 4);
        assert_eq!(track.events[1].status, 0x90);
        assert_eq!(track.events[1].data, vec![64, 90]);
        assert_eq!(track.events[2].absolute_ticks, 0x20);
        assert!(track.events[3].is_meta(META_END_OF_TRACK));
    }

    #[test]
    fn data_byte_after_meta_has_no_running_status() {
        let chunk = [0x00, 0x90, 60, 100, 0x00, 0xFF, 0x01, 0x00, 0x00, 60, 0];
        assert!(matches!(
            TrackChunk::decode(&chunk),
            Err(CodecError::MissingRunningStatus { offset: 9, byte: 60 })
        ));
    }

    #[test]
    fn sysex_reads_through_terminator() {
        let chunk = [0x00, 0xF0, 0x43, 0x12, 0xF7, 0x00, 0xC0, 0x05];
        let track = TrackChunk::decode(&chunk).expect("track should decode");
        assert_eq!(track.events[0].data, vec![0x43, 0x12, 0xF7]);
        assert_eq!(track.events[1].status, 0xC0);
        assert_eq!(track.events[1].data, vec![0x05]);
    }

    #[test]
    fn undefined_statuses_carry_no_payload() {
        let chunk = [0x00, 0xF4, 0x00, 0xFD, 0x00, 0xF8];
        let track = TrackChunk::decode(&chunk).expect("track should decode");
        assert_eq!(track.events.len(), 3);
        assert!(track.events.iter().all(|event| event.data.is_empty()));
    }

    #[test]
    fn meta_payload_past_chunk_end_fails() {
        let chunk = [0x00, 0xFF, 0x03, 0x05, b'a', b'b'];
        let error = TrackChunk::decode(&chunk).expect_err("meta overrun must fail");
        assert!(error.is_truncated());
    }

    #[test]
    fn track_name_reads_meta_payload() {
        let track = TrackChunk::new(vec![
            MidiEvent::new(0, 0xC0, vec![0]),
            MidiEvent::meta(0, META_TRACK_NAME, b"Piano"),
        ]);
        assert_eq!(track.name(), "Piano");
        assert_eq!(TrackChunk::default().name(), "");

        let malformed = TrackChunk::new(vec![MidiEvent::new(
            0,
            STATUS_META,
            vec![META_TRACK_NAME, 0x09, b'x'],
        )]);
        assert_eq!(malformed.name(), "");
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let track = [0x00, 0xFF, 0x2F, 0x00];
        let bytes = file_with_chunks(1, &[(b"XFIH", &[1, 2, 3]), (b"MTrk", &track)]);
        let file = MidiFile::decode(&bytes).expect("alien chunk is not an error");
        assert_eq!(file.tracks.len(), 1);
    }

    #[test]
    fn header_validation_rejects_bad_input() {
        assert_eq!(
            MidiFile::decode(b"MThd"),
            Err(CodecError::TooShort { len: 4 })
        );

        let mut bytes = file_with_chunks(0, &[]);
        bytes[0] = b'X';
        assert_eq!(MidiFile::decode(&bytes), Err(CodecError::BadHeaderMagic));

        let mut bytes = file_with_chunks(0, &[]);
        bytes[7] = 7;
        assert_eq!(MidiFile::decode(&bytes), Err(CodecError::BadHeaderLength(7)));

        let mut bytes = file_with_chunks(0, &[]);
        bytes[12] = 0xE7;
        assert!(matches!(
            MidiFile::decode(&bytes),
            Err(CodecError::SmpteDivision(_))
        ));
    }

    #[test]
    fn declared_track_count_must_match() {
        let track = [0x00, 0xFF, 0x2F, 0x00];
        let bytes = file_with_chunks(2, &[(b"MTrk", &track)]);
        assert_eq!(
            MidiFile::decode(&bytes),
            Err(CodecError::TrackCountMismatch {
                declared: 2,
                decoded: 1
            })
        );
    }

    #[test]
    fn oversized_chunk_length_is_truncation() {
        let mut bytes = file_with_chunks(1, &[(b"MTrk", &[0x00, 0xFF, 0x2F, 0x00])]);
        let len_offset = 14 + 4;
        bytes[len_offset + 3] = 0x40;
        let error = MidiFile::decode(&bytes).expect_err("chunk overrun must fail");
        assert!(error.is_truncated());
    }

    #[test]
    fn encode_rejects_header_mismatch_and_large_delta() {
        let mut file = MidiFile::new(1, 480, vec![TrackChunk::default()]);
        file.header.num_tracks = 3;
        assert!(matches!(
            file.encode(),
            Err(CodecError::TrackCountMismatch { .. })
        ));

        let file = MidiFile::new(
            0,
            480,
            vec![TrackChunk::new(vec![MidiEvent::new(
                0x1000_0000,
                0x90,
                vec![60, 1],
            )])],
        );
        assert_eq!(file.encode(), Err(CodecError::DeltaOutOfRange(0x1000_0000)));
    }

    #[test]
    fn sysex_without_single_trailing_terminator_is_rejected() {
        let encode = |data: Vec<u8>| {
            TrackChunk::new(vec![
                MidiEvent::new(0, 0xC0, vec![1]),
                MidiEvent::new(0, STATUS_SYSEX, data),
                MidiEvent::new(10, 0x90, vec![60, 100]),
            ])
            .encode(&mut Vec::new())
        };

        assert_eq!(
            encode(vec![0x43, 0x12]),
            Err(CodecError::UnterminatedSysex { index: 1 })
        );
        assert_eq!(
            encode(vec![0x43, STATUS_END_OF_SYSEX, 0x12, STATUS_END_OF_SYSEX]),
            Err(CodecError::UnterminatedSysex { index: 1 })
        );
        assert_eq!(
            encode(Vec::new()),
            Err(CodecError::UnterminatedSysex { index: 1 })
        );

        let mut out = Vec::new();
        let track = TrackChunk::new(vec![
            MidiEvent::new(0, STATUS_SYSEX, vec![0x43, 0x12, STATUS_END_OF_SYSEX]),
            MidiEvent::new(10, 0x90, vec![60, 100]),
        ]);
        track.encode(&mut out).expect("terminated sysex should encode");
        let decoded = TrackChunk::decode(&out).expect("encoded track should decode");
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[1].absolute_ticks, 10);
    }
}

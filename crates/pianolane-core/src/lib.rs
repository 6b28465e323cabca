pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod export;
pub mod fixtures;
pub mod instrument;
pub mod model;
pub mod recorder;
pub mod render;
pub mod sequencer;
pub mod stream;
pub mod tempo;

pub use codec::{
    CodecError, FileHeader, MidiEvent, MidiFile, TrackChunk, read_variable_length,
    write_variable_length,
};
pub use config::{ClampPolicy, EngineConfig, RecorderConfig, SequencerConfig};
pub use diagnostics::{TelemetryGuard, init_tracing, init_tracing_with_options};
pub use engine::{AudioEngine, EngineError, load_bank};
pub use export::{export_wav, write_midi};
pub use instrument::{InstrumentBank, InstrumentError, OscillatorBank, SoundFontBank};
pub use model::{
    ColorPair, KEY_COUNT, NoteBlock, PedalChange, Rgb, SequenceTrack, TrackSummary, key_name,
};
pub use recorder::{RawEvent, Recorder, RecorderError, RecorderState};
pub use render::{RenderSettings, mixdown, render_track};
pub use sequencer::{SequenceSummary, Sequencer, SequencerError};
pub use stream::{BlockStatus, PlaybackCursor, fill_block};
pub use tempo::TempoMap;

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use thiserror::Error;
use tracing::{info, instrument};

const CHANNEL_COUNT: usize = 16;
const PROGRAM_CHANGE: i32 = 0xC0;
const OSCILLATOR_PROGRAMS: usize = 128;
const OSCILLATOR_RELEASE_SECONDS: f64 = 0.25;
const OSCILLATOR_GAIN: f32 = 0.2;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("failed to open soundfont {path}: {message}")]
    Open { path: String, message: String },
    #[error("invalid soundfont: {0}")]
    SoundFont(String),
    #[error("failed to create synthesizer: {0}")]
    Synthesizer(String),
}

/// A synthesis backend driven one track at a time by the offline renderer.
pub trait InstrumentBank {
    fn program_count(&self) -> usize;

    fn reset(&mut self);

    fn select_program(&mut self, channel: u8, program: u8);

    fn note_on(&mut self, channel: u8, key: u8, velocity: f64);

    fn note_off(&mut self, channel: u8, key: u8);

    /// Overwrites both slices with the next `left.len()` frames.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]);
}

pub struct SoundFontBank {
    synthesizer: Synthesizer,
    preset_count: usize,
}

impl SoundFontBank {
    #[instrument(fields(path = %path.display()))]
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self, InstrumentError> {
        let file = File::open(path).map_err(|err| InstrumentError::Open {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let mut reader = BufReader::new(file);
        let sound_font = SoundFont::new(&mut reader)
            .map_err(|err| InstrumentError::SoundFont(err.to_string()))?;
        let bank = Self::from_sound_font(Arc::new(sound_font), sample_rate)?;
        info!(presets = bank.preset_count, "soundfont loaded");
        Ok(bank)
    }

    pub fn from_sound_font(
        sound_font: Arc<SoundFont>,
        sample_rate: u32,
    ) -> Result<Self, InstrumentError> {
        let rate = i32::try_from(sample_rate)
            .map_err(|_| InstrumentError::Synthesizer(format!("sample rate {sample_rate}")))?;
        let settings = SynthesizerSettings::new(rate);
        let synthesizer = Synthesizer::new(&sound_font, &settings)
            .map_err(|err| InstrumentError::Synthesizer(err.to_string()))?;
        Ok(Self {
            preset_count: sound_font.get_presets().len(),
            synthesizer,
        })
    }
}

impl InstrumentBank for SoundFontBank {
    fn program_count(&self) -> usize {
        self.preset_count
    }

    fn reset(&mut self) {
        self.synthesizer.reset();
    }

    fn select_program(&mut self, channel: u8, program: u8) {
        self.synthesizer.process_midi_message(
            i32::from(channel),
            PROGRAM_CHANGE,
            i32::from(program),
            0,
        );
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: f64) {
        let velocity = (velocity.clamp(0.0, 1.0) * 127.0).round() as i32;
        self.synthesizer
            .note_on(i32::from(channel), i32::from(key), velocity.max(1));
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        self.synthesizer.note_off(i32::from(channel), i32::from(key));
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        self.synthesizer.render(left, right);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waveform {
    Triangle,
    Square,
}

#[derive(Debug, Clone)]
struct Voice {
    channel: u8,
    key: u8,
    phase: u32,
    phase_increment: u32,
    amplitude: f32,
    waveform: Waveform,
    release_remaining: Option<u32>,
}

/// Polyphonic triangle/square oscillators with a linear release ramp.
#[derive(Debug, Clone)]
pub struct OscillatorBank {
    sample_rate: u32,
    release_samples: u32,
    programs: [u8; CHANNEL_COUNT],
    voices: Vec<Voice>,
}

impl OscillatorBank {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            sample_rate,
            release_samples: ((f64::from(sample_rate) * OSCILLATOR_RELEASE_SECONDS) as u32).max(1),
            programs: [0; CHANNEL_COUNT],
            voices: Vec::new(),
        }
    }

    #[must_use]
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn waveform_for(program: u8) -> Waveform {
        // GM synth leads get the square wave.
        if (80..88).contains(&program) {
            Waveform::Square
        } else {
            Waveform::Triangle
        }
    }
}

impl InstrumentBank for OscillatorBank {
    fn program_count(&self) -> usize {
        OSCILLATOR_PROGRAMS
    }

    fn reset(&mut self) {
        self.voices.clear();
        self.programs = [0; CHANNEL_COUNT];
    }

    fn select_program(&mut self, channel: u8, program: u8) {
        if let Some(slot) = self.programs.get_mut(usize::from(channel)) {
            *slot = program;
        }
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: f64) {
        let program = self
            .programs
            .get(usize::from(channel))
            .copied()
            .unwrap_or_default();
        self.voices.push(Voice {
            channel,
            key,
            phase: 0,
            phase_increment: frequency_to_phase_increment(note_frequency_hz(key), self.sample_rate),
            amplitude: velocity.clamp(0.0, 1.0) as f32 * OSCILLATOR_GAIN,
            waveform: Self::waveform_for(program),
            release_remaining: None,
        });
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        for voice in &mut self.voices {
            if voice.channel == channel && voice.key == key && voice.release_remaining.is_none() {
                voice.release_remaining = Some(self.release_samples);
            }
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        let frames = left.len().min(right.len());
        let release_samples = self.release_samples as f32;

        for voice in &mut self.voices {
            for frame in 0..frames {
                let gain = match voice.release_remaining {
                    Some(0) => break,
                    Some(remaining) => {
                        voice.release_remaining = Some(remaining - 1);
                        remaining as f32 / release_samples
                    }
                    None => 1.0,
                };
                let osc = match voice.waveform {
                    Waveform::Triangle => triangle_osc(voice.phase),
                    Waveform::Square => square_osc(voice.phase),
                };
                let sample = osc * voice.amplitude * gain;
                left[frame] += sample;
                right[frame] += sample;
                voice.phase = voice.phase.wrapping_add(voice.phase_increment);
            }
        }

        self.voices.retain(|voice| voice.release_remaining != Some(0));
    }
}

fn frequency_to_phase_increment(frequency_hz: f64, sample_rate: u32) -> u32 {
    let normalized = frequency_hz / f64::from(sample_rate.max(1));
    let increment = normalized * f64::from(u32::MAX);
    increment.clamp(1.0, f64::from(u32::MAX)) as u32
}

fn note_frequency_hz(key: u8) -> f64 {
    let semitone_offset = f64::from(i16::from(key) - 69);
    440.0 * 2_f64.powf(semitone_offset / 12.0)
}

fn square_osc(phase: u32) -> f32 {
    if phase < 0x8000_0000 { 1.0 } else { -1.0 }
}

fn triangle_osc(phase: u32) -> f32 {
    let phase_unit = phase as f32 / u32::MAX as f32;
    if phase_unit < 0.5 {
        (phase_unit * 4.0) - 1.0
    } else {
        3.0 - (phase_unit * 4.0)
    }
}

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::EngineConfig,
    instrument::{InstrumentBank, InstrumentError, OscillatorBank, SoundFontBank},
    model::SequenceTrack,
    render::{RenderSettings, render_track},
    sequencer::Sequencer,
    stream::{PlaybackCursor, fill_block},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("output device index {index} out of range ({count} available)")]
    DeviceIndex { index: usize, count: usize },
    #[error("failed to enumerate output devices: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("failed to query output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format: {0}")]
    SampleFormat(String),
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
    #[error("operation not allowed while the audio stream is active")]
    StreamActive,
}

/// Builds the configured instrument bank: the SoundFont when one is set,
/// otherwise the built-in oscillators.
pub fn load_bank(config: &EngineConfig) -> Result<Box<dyn InstrumentBank>, EngineError> {
    match &config.soundfont_path {
        Some(path) => Ok(Box::new(SoundFontBank::open(path, config.sample_rate)?)),
        None => Ok(Box::new(OscillatorBank::new(config.sample_rate))),
    }
}

struct ActiveStream {
    // Dropping the handle stops the device callback.
    handle: Option<cpal::Stream>,
    cursor: Arc<PlaybackCursor>,
    started_at: Instant,
    start_pointer: f64,
    // Nanoseconds between callback and playback, written by the callback.
    measured_latency: Arc<AtomicU64>,
    estimated_latency: f64,
    max_time: f64,
}

impl ActiveStream {
    /// The backend's reported latency once a callback has run, the buffer
    /// estimate before that.
    fn output_latency(&self) -> f64 {
        match self.measured_latency.load(Ordering::Relaxed) {
            0 => self.estimated_latency,
            nanos => Duration::from_nanos(nanos).as_secs_f64(),
        }
    }

    fn time_pointer(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64() - self.output_latency();
        (self.start_pointer + elapsed.max(0.0)).min(self.max_time)
    }
}

pub struct AudioEngine {
    config: EngineConfig,
    settings: RenderSettings,
    bank: Box<dyn InstrumentBank>,
    device: Option<cpal::Device>,
    stream: Option<ActiveStream>,
    time_pointer: f64,
}

impl fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("config", &self.config)
            .field("has_device", &self.device.is_some())
            .field("streaming", &self.stream.is_some())
            .field("time_pointer", &self.time_pointer)
            .finish_non_exhaustive()
    }
}

impl AudioEngine {
    /// Opens the configured output device and instrument bank.
    #[instrument(skip(config), fields(sample_rate = config.sample_rate, block_frames = config.block_frames))]
    pub fn initialize(config: EngineConfig) -> Result<Self, EngineError> {
        let result = Self::open(config);
        if let Err(err) = &result {
            error!(%err, "audio engine initialization failed");
        }
        result
    }

    fn open(config: EngineConfig) -> Result<Self, EngineError> {
        if config.sample_rate == 0 {
            return Err(EngineError::ZeroSampleRate);
        }
        let device = output_device(config.output_device_index)?;
        let bank = load_bank(&config)?;
        info!(
            device = %device.name().unwrap_or_default(),
            programs = bank.program_count(),
            "audio engine initialized"
        );
        let mut engine = Self::offline_with_config(config, bank);
        engine.device = Some(device);
        Ok(engine)
    }

    /// An engine without an output device, for rendering and tests.
    #[must_use]
    pub fn offline(sample_rate: u32, bank: Box<dyn InstrumentBank>) -> Self {
        Self::offline_with_config(
            EngineConfig {
                sample_rate: sample_rate.max(1),
                ..EngineConfig::default()
            },
            bank,
        )
    }

    #[must_use]
    pub fn offline_with_config(config: EngineConfig, bank: Box<dyn InstrumentBank>) -> Self {
        Self {
            settings: RenderSettings::from(&config),
            config,
            bank,
            device: None,
            stream: None,
            time_pointer: 0.0,
        }
    }

    /// Stops any stream and releases the output device. Safe to call repeatedly.
    pub fn terminate(&mut self) {
        self.stop_stream();
        if self.device.take().is_some() {
            info!("audio engine terminated");
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    #[must_use]
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    #[must_use]
    pub fn program_count(&self) -> usize {
        self.bank.program_count()
    }

    pub fn render_track(&mut self, track: &SequenceTrack) -> Vec<f32> {
        render_track(self.bank.as_mut(), track, &self.settings)
    }

    #[must_use]
    pub fn max_time(&self, sequencer: &Sequencer) -> f64 {
        sequencer.max_sample_count() as f64 / 2.0 / f64::from(self.sample_rate())
    }

    #[instrument(skip(self, sequencer), fields(time_pointer = self.time_pointer))]
    pub fn start_stream(&mut self, sequencer: &Sequencer) -> Result<(), EngineError> {
        if self.stream_is_playing() {
            debug!("stream already active");
            return Ok(());
        }
        self.stop_stream();
        let device = self.device.as_ref().ok_or(EngineError::NoDevice)?;

        let sample_rate = self.sample_rate();
        let max_time = self.max_time(sequencer);
        let start_pointer = self.time_pointer.clamp(0.0, max_time);
        let cursor = Arc::clone(sequencer.cursor());
        let start_index = (start_pointer * f64::from(sample_rate)) as usize * 2;
        cursor.reset(start_index, sequencer.max_sample_count());

        let tracks: Vec<Arc<[f32]>> = sequencer
            .tracks()
            .iter()
            .map(|track| Arc::clone(track.samples()))
            .collect();
        let measured_latency = Arc::new(AtomicU64::new(0));
        let (handle, fixed_frames) = open_stream(
            device,
            &self.config,
            tracks,
            Arc::clone(&cursor),
            Arc::clone(&measured_latency),
        )?;
        handle.play()?;

        let estimated_latency =
            fixed_frames.map_or(0.0, |frames| f64::from(frames) / f64::from(sample_rate));
        self.time_pointer = start_pointer;
        self.stream = Some(ActiveStream {
            handle: Some(handle),
            cursor,
            started_at: Instant::now(),
            start_pointer,
            measured_latency,
            estimated_latency,
            max_time,
        });
        info!(start_pointer, max_time, estimated_latency, "stream started");
        Ok(())
    }

    /// Freezes the time pointer and drops the stream.
    pub fn stop_stream(&mut self) {
        if let Some(mut active) = self.stream.take() {
            self.time_pointer = active.time_pointer();
            if let Some(handle) = active.handle.take() {
                if let Err(err) = handle.pause() {
                    warn!(%err, "failed to pause output stream");
                }
                drop(handle);
            }
            info!(time_pointer = self.time_pointer, "stream stopped");
        }
    }

    /// True while a stream handle is held, finished or not.
    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// True while a stream exists and its cursor has not run out of samples.
    #[must_use]
    pub fn stream_is_playing(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|active| !active.cursor.is_finished())
    }

    /// Drops a stream whose cursor reached the end; returns whether it did.
    pub fn collect_finished_stream(&mut self) -> bool {
        let finished = self
            .stream
            .as_ref()
            .is_some_and(|active| active.cursor.is_finished());
        if finished {
            self.stop_stream();
        }
        finished
    }

    #[must_use]
    pub fn time_pointer(&self) -> f64 {
        self.stream
            .as_ref()
            .map_or(self.time_pointer, ActiveStream::time_pointer)
    }

    pub fn set_time_pointer(
        &mut self,
        sequencer: &Sequencer,
        seconds: f64,
    ) -> Result<f64, EngineError> {
        if self.stream_is_playing() {
            return Err(EngineError::StreamActive);
        }
        self.stop_stream();
        let seconds = if seconds.is_finite() { seconds } else { 0.0 };
        self.time_pointer = seconds.clamp(0.0, self.max_time(sequencer));
        Ok(self.time_pointer)
    }

    #[cfg(test)]
    fn attach_silent_stream(&mut self, sequencer: &Sequencer) {
        let cursor = Arc::clone(sequencer.cursor());
        cursor.reset(0, sequencer.max_sample_count());
        self.stream = Some(ActiveStream {
            handle: None,
            cursor,
            started_at: Instant::now(),
            start_pointer: self.time_pointer,
            measured_latency: Arc::new(AtomicU64::new(0)),
            estimated_latency: 0.0,
            max_time: self.max_time(sequencer),
        });
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn output_device(index: Option<usize>) -> Result<cpal::Device, EngineError> {
    let host = cpal::default_host();
    match index {
        Some(index) => {
            let devices: Vec<_> = host.output_devices()?.collect();
            let count = devices.len();
            devices
                .into_iter()
                .nth(index)
                .ok_or(EngineError::DeviceIndex { index, count })
        }
        None => host.default_output_device().ok_or(EngineError::NoDevice),
    }
}

/// Builds the output stream at the render sample rate, asking for the
/// configured block size first and the device default after. Returns the
/// fixed block size when the device accepted it.
fn open_stream(
    device: &cpal::Device,
    config: &EngineConfig,
    tracks: Vec<Arc<[f32]>>,
    cursor: Arc<PlaybackCursor>,
    latency: Arc<AtomicU64>,
) -> Result<(cpal::Stream, Option<u32>), EngineError> {
    let supported = device.default_output_config()?;
    let mut stream_config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.block_frames),
    };
    let format = supported.sample_format();

    let first_attempt = build_for_format(
        device,
        format,
        &stream_config,
        tracks.clone(),
        Arc::clone(&cursor),
        Arc::clone(&latency),
    );
    match first_attempt {
        Ok(stream) => Ok((stream, Some(config.block_frames))),
        Err(EngineError::BuildStream(err)) => {
            warn!(
                %err,
                block_frames = config.block_frames,
                "fixed block size rejected, using device default"
            );
            stream_config.buffer_size = cpal::BufferSize::Default;
            let stream =
                build_for_format(device, format, &stream_config, tracks, cursor, latency)?;
            Ok((stream, None))
        }
        Err(err) => Err(err),
    }
}

fn build_for_format(
    device: &cpal::Device,
    format: cpal::SampleFormat,
    config: &cpal::StreamConfig,
    tracks: Vec<Arc<[f32]>>,
    cursor: Arc<PlaybackCursor>,
    latency: Arc<AtomicU64>,
) -> Result<cpal::Stream, EngineError> {
    match format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, tracks, cursor, latency),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, tracks, cursor, latency),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, tracks, cursor, latency),
        other => Err(EngineError::SampleFormat(format!("{other:?}"))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tracks: Vec<Arc<[f32]>>,
    cursor: Arc<PlaybackCursor>,
    latency: Arc<AtomicU64>,
) -> Result<cpal::Stream, EngineError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = usize::from(config.channels);
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
            let timestamp = info.timestamp();
            if let Some(delay) = timestamp.playback.duration_since(&timestamp.callback) {
                let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
                latency.store(nanos, Ordering::Relaxed);
            }
            fill_block(data, channels, &tracks, &cursor);
        },
        |err| warn!(%err, "output stream error"),
        Some(Duration::from_secs(2)),
    )?;
    Ok(stream)
}

pub mod config;

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow, bail};
use pianolane_core::{
    AudioEngine, Recorder, RecorderState, Sequencer,
    engine::load_bank,
    key_name,
    model::{HIGHEST_KEY, LOWEST_KEY},
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;

/// Which half of the app owns the keyboard: file playback or live capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Performance,
    Recording,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load(PathBuf),
    TogglePlay,
    Seek(f64),
    Tempo(f64),
    Status,
    Keys,
    RecordMode,
    PerformMode,
    ToggleRecording,
    Save,
    Help,
    Quit,
}

impl Command {
    /// Parses one input line; blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));

        let command = match word {
            "" => return Ok(None),
            "load" if !rest.is_empty() => Self::Load(PathBuf::from(rest)),
            "load" => bail!("usage: load <path>"),
            "play" | "space" => Self::TogglePlay,
            "seek" => Self::Seek(parse_number(rest, "seek <seconds>")?),
            "tempo" => Self::Tempo(parse_number(rest, "tempo <scale>")?),
            "status" => Self::Status,
            "keys" => Self::Keys,
            "record" => Self::RecordMode,
            "perform" => Self::PerformMode,
            "rec" => Self::ToggleRecording,
            "save" => Self::Save,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}', try 'help'"),
        };
        Ok(Some(command))
    }
}

fn parse_number(value: &str, usage: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .ok_or_else(|| anyhow!("usage: {usage}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Quit,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub mode: Mode,
    pub sequence: String,
    pub tracks: usize,
    pub tempo_scale: f64,
    pub playing: bool,
    pub time_pointer: f64,
    pub max_time: f64,
    pub recorder: RecorderState,
    pub recorded_notes: usize,
}

const HELP: &str = "commands: load <path>, play|space, seek <seconds>, tempo <scale>, \
status, keys, record, perform, rec, save, quit";

/// The control thread: owns the engine, sequencer and recorder and turns
/// commands into calls on them.
pub struct Session {
    engine: AudioEngine,
    sequencer: Sequencer,
    recorder: Recorder,
    mode: Mode,
    tempo_scale: f64,
}

impl Session {
    /// Opens the output device, falling back to an offline engine so files
    /// can still be loaded and inspected without audio hardware.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let engine = match AudioEngine::initialize(config.audio.clone()) {
            Ok(engine) => engine,
            Err(err) => {
                warn!(%err, "audio output unavailable, continuing without playback");
                let bank = load_bank(&config.audio).context("failed to load instrument bank")?;
                AudioEngine::offline_with_config(config.audio.clone(), bank)
            }
        };
        Ok(Self::with_engine(config, engine))
    }

    #[must_use]
    pub fn with_engine(config: &AppConfig, engine: AudioEngine) -> Self {
        Self {
            engine,
            sequencer: Sequencer::new(config.sequencer.clone()),
            recorder: Recorder::new(config.recorder.clone()),
            mode: Mode::Performance,
            tempo_scale: 1.0,
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    #[must_use]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    #[must_use]
    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    /// Drops a stream that played to its end.
    pub fn poll(&mut self) {
        if self.engine.collect_finished_stream() {
            info!("playback reached the end");
        }
    }

    #[instrument(skip(self))]
    pub fn execute(&mut self, command: Command) -> Result<Outcome> {
        self.poll();
        let message = match command {
            Command::Load(path) => self.load(path)?,
            Command::TogglePlay => self.toggle_play()?,
            Command::Seek(seconds) => self.seek(seconds)?,
            Command::Tempo(scale) => self.set_tempo(scale)?,
            Command::Status => serde_json::to_string(&self.status())?,
            Command::Keys => self.sounding_keys(),
            Command::RecordMode => self.switch_mode(Mode::Recording),
            Command::PerformMode => self.switch_mode(Mode::Performance),
            Command::ToggleRecording => self.toggle_recording()?,
            Command::Save => {
                let path = self.recorder.save()?;
                format!("saved {}", path.display())
            }
            Command::Help => HELP.to_string(),
            Command::Quit => {
                self.shutdown();
                return Ok(Outcome::Quit);
            }
        };
        Ok(Outcome::Continue(message))
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport {
            mode: self.mode,
            sequence: self.sequencer.name().to_string(),
            tracks: self.sequencer.tracks().len(),
            tempo_scale: self.tempo_scale,
            playing: self.engine.stream_is_playing(),
            time_pointer: self.time_pointer(),
            max_time: self.engine.max_time(&self.sequencer),
            recorder: self.recorder.state(),
            recorded_notes: self.recorder.with_track(|track| track.note_count()),
        }
    }

    #[must_use]
    pub fn time_pointer(&self) -> f64 {
        match self.mode {
            Mode::Performance => self.engine.time_pointer(),
            Mode::Recording => self.recorder.time_pointer(),
        }
    }

    pub fn shutdown(&mut self) {
        self.recorder.stop_recording();
        self.engine.terminate();
    }

    fn require_mode(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            bail!(
                "not available in {} mode",
                match self.mode {
                    Mode::Performance => "performance",
                    Mode::Recording => "recording",
                }
            );
        }
        Ok(())
    }

    fn load(&mut self, path: PathBuf) -> Result<String> {
        self.switch_mode(Mode::Performance);
        self.engine.stop_stream();
        self.sequencer.load(&path)?;
        self.sequencer.generate(&mut self.engine, self.tempo_scale)?;
        self.engine.set_time_pointer(&self.sequencer, 0.0)?;
        Ok(format!(
            "loaded '{}': {} tracks, {:.1}s",
            self.sequencer.name(),
            self.sequencer.tracks().len(),
            self.engine.max_time(&self.sequencer)
        ))
    }

    fn toggle_play(&mut self) -> Result<String> {
        self.require_mode(Mode::Performance)?;
        if self.engine.stream_is_playing() {
            self.engine.stop_stream();
            return Ok(format!("paused at {:.2}s", self.engine.time_pointer()));
        }
        if self.sequencer.is_empty() {
            bail!("nothing loaded");
        }

        let max_time = self.engine.max_time(&self.sequencer);
        if self.engine.time_pointer() >= max_time {
            self.engine.set_time_pointer(&self.sequencer, 0.0)?;
        }
        self.engine.start_stream(&self.sequencer)?;
        Ok(format!("playing from {:.2}s", self.engine.time_pointer()))
    }

    /// Scrubbing pauses the stream, moves the pointer and resumes if it was playing.
    fn seek(&mut self, seconds: f64) -> Result<String> {
        self.require_mode(Mode::Performance)?;
        let was_playing = self.engine.stream_is_playing();
        self.engine.stop_stream();
        let pointer = self.engine.set_time_pointer(&self.sequencer, seconds)?;
        if was_playing {
            self.engine.start_stream(&self.sequencer)?;
        }
        Ok(format!("time pointer {pointer:.2}s"))
    }

    fn set_tempo(&mut self, scale: f64) -> Result<String> {
        self.require_mode(Mode::Performance)?;
        self.engine.stop_stream();
        let pointer = self.engine.time_pointer();
        self.sequencer.generate(&mut self.engine, scale)?;
        self.tempo_scale = 1.0 / self.sequencer.time_scale();
        self.engine.set_time_pointer(&self.sequencer, pointer)?;
        Ok(format!("tempo scale {:.2}", self.tempo_scale))
    }

    fn sounding_keys(&self) -> String {
        let time = self.time_pointer();
        let names: Vec<String> = match self.mode {
            Mode::Performance => self
                .sequencer
                .sounding_keys(time)
                .iter()
                .enumerate()
                .filter(|(_, sounding)| **sounding)
                .map(|(index, _)| key_name(LOWEST_KEY + index as u8))
                .collect(),
            Mode::Recording => self.recorder.with_track(|track| {
                (LOWEST_KEY..=HIGHEST_KEY)
                    .filter(|&key| track.is_key_sounding(key, time))
                    .map(key_name)
                    .collect()
            }),
        };
        if names.is_empty() {
            "no keys sounding".to_string()
        } else {
            names.join(" ")
        }
    }

    /// Leaving a mode stops whatever that mode had running.
    fn switch_mode(&mut self, mode: Mode) -> String {
        if self.mode != mode {
            match self.mode {
                Mode::Performance => self.engine.stop_stream(),
                Mode::Recording => self.recorder.stop_recording(),
            }
            self.mode = mode;
            info!(?mode, "mode switched");
        }
        format!("{mode:?} mode").to_lowercase()
    }

    fn toggle_recording(&mut self) -> Result<String> {
        self.require_mode(Mode::Recording)?;
        if self.recorder.state() == RecorderState::Idle {
            self.recorder.start_recording()?;
            Ok("recording armed, play to start".to_string())
        } else {
            self.recorder.stop_recording();
            Ok(format!(
                "recording stopped after {:.2}s",
                self.recorder.time_pointer()
            ))
        }
    }
}

/// Reads commands line by line until `quit` or end of input. Command errors
/// are reported and the loop continues.
pub fn run<R: BufRead, W: Write>(session: &mut Session, input: R, mut output: W) -> Result<()> {
    writeln!(output, "{HELP}")?;
    for line in input.lines() {
        let line = line.context("failed to read command")?;
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                writeln!(output, "error: {err}")?;
                continue;
            }
        };

        match session.execute(command) {
            Ok(Outcome::Continue(message)) => writeln!(output, "{message}")?,
            Ok(Outcome::Quit) => return Ok(()),
            Err(err) => {
                error!(error = %format!("{err:#}"), "command failed");
                writeln!(output, "error: {err:#}")?;
            }
        }
    }
    session.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pianolane_core::{OscillatorBank, fixtures};

    use super::*;

    fn offline_session(config: &AppConfig) -> Session {
        let engine = AudioEngine::offline(1_000, Box::new(OscillatorBank::new(1_000)));
        Session::with_engine(config, engine)
    }

    fn write_fixture(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("single.mid");
        std::fs::write(&path, fixtures::single_note_bytes()).expect("fixture write should work");
        path
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(
            Command::parse("load  songs/a b.mid ").expect("parse"),
            Some(Command::Load(PathBuf::from("songs/a b.mid")))
        );
        assert_eq!(Command::parse("space").expect("parse"), Some(Command::TogglePlay));
        assert_eq!(Command::parse("seek 1.5").expect("parse"), Some(Command::Seek(1.5)));
        assert_eq!(Command::parse("   ").expect("parse"), None);
        assert!(Command::parse("seek").is_err());
        assert!(Command::parse("tempo NaN").is_err());
        assert!(Command::parse("dance").is_err());
    }

    #[test]
    fn load_seek_and_tempo_drive_the_core() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let path = write_fixture(temp.path());
        let mut session = offline_session(&AppConfig::default());

        let loaded = session.execute(Command::Load(path)).expect("load should work");
        assert!(matches!(loaded, Outcome::Continue(message) if message.contains("1 tracks")));
        assert!((session.status().max_time - 2.5).abs() < 1e-9);

        session.execute(Command::Seek(0.25)).expect("seek should work");
        assert!(matches!(
            session.execute(Command::Keys).expect("keys"),
            Outcome::Continue(message) if message == "C4"
        ));

        session.execute(Command::Seek(99.0)).expect("seek should clamp");
        assert!((session.time_pointer() - 2.5).abs() < 1e-9);

        session.execute(Command::Tempo(2.0)).expect("tempo should work");
        assert!((session.status().tempo_scale - 2.0).abs() < 1e-12);
        assert!((session.status().max_time - 2.25).abs() < 1e-9);
        assert!(session.time_pointer() <= 2.25 + 1e-9);
    }

    #[test]
    fn playback_without_device_reports_error() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let path = write_fixture(temp.path());
        let mut session = offline_session(&AppConfig::default());

        assert!(session.execute(Command::TogglePlay).is_err());
        session.execute(Command::Load(path)).expect("load should work");
        assert!(session.execute(Command::TogglePlay).is_err());
        assert!(!session.status().playing);
    }

    #[test]
    fn recording_commands_respect_mode() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let mut config = AppConfig::default();
        config.recorder.output_dir = Some(temp.path().to_path_buf());
        let mut session = offline_session(&config);

        assert!(session.execute(Command::ToggleRecording).is_err());
        session.execute(Command::RecordMode).expect("mode switch");
        assert_eq!(session.mode(), Mode::Recording);
        assert!(session.execute(Command::TogglePlay).is_err());

        let saved = session.execute(Command::Save).expect("idle recorder saves");
        assert!(matches!(saved, Outcome::Continue(message) if message.starts_with("saved")));
        assert_eq!(
            std::fs::read_dir(temp.path()).expect("output dir").count(),
            1
        );

        session.execute(Command::PerformMode).expect("mode switch");
        assert_eq!(session.mode(), Mode::Performance);
    }

    #[test]
    fn run_loop_reports_errors_and_stops_on_quit() {
        let mut session = offline_session(&AppConfig::default());
        let input = Cursor::new("status\nbogus\nseek 1\nquit\nstatus\n");
        let mut output = Vec::new();

        run(&mut session, input, &mut output).expect("loop should finish");
        let text = String::from_utf8(output).expect("utf8 output");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("\"mode\":\"performance\""));
        assert!(lines[2].starts_with("error: unknown command"));
        assert_eq!(lines[3], "time pointer 0.00s");
    }
}

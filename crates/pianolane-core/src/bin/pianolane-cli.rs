use std::{path::PathBuf, thread, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use pianolane_core::{
    AudioEngine, EngineConfig, OscillatorBank, RecorderConfig, Sequencer,
    diagnostics::init_tracing,
    engine::load_bank,
    export::{export_wav, write_midi},
    fixtures::demo_file,
    recorder::Recorder,
};

#[derive(Debug, Parser)]
#[command(name = "pianolane-cli")]
#[command(about = "Headless tools for Pianolane inspect/render/playback/recording workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the decoded sequence summary as JSON.
    Inspect {
        input: PathBuf,

        #[arg(long, default_value_t = 1.0)]
        tempo_scale: f64,
    },
    /// Render a MIDI file to a 16-bit stereo WAV.
    Render {
        input: PathBuf,

        #[arg(long, default_value = "data/exports/render.wav")]
        output: PathBuf,

        #[arg(long, default_value_t = 1.0)]
        tempo_scale: f64,

        #[arg(long)]
        sample_rate: Option<u32>,

        #[arg(long)]
        soundfont: Option<PathBuf>,
    },
    /// Play a MIDI file on the default output device until it ends.
    Play {
        input: PathBuf,

        #[arg(long, default_value_t = 1.0)]
        tempo_scale: f64,

        #[arg(long, default_value_t = 0.0)]
        start_seconds: f64,

        #[arg(long)]
        soundfont: Option<PathBuf>,
    },
    /// Capture from a MIDI input port for a fixed number of seconds.
    Record {
        #[arg(long, default_value_t = 0)]
        port: usize,

        #[arg(long, default_value_t = 10)]
        seconds: u64,

        #[arg(long, default_value = "data/recordings")]
        output_dir: PathBuf,
    },
    /// Write the built-in demo phrase as MIDI and WAV.
    Demo {
        #[arg(long, default_value = "data/exports")]
        output_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(&cli.log_dir)?;

    match cli.command {
        Commands::Inspect { input, tempo_scale } => {
            let mut sequencer = Sequencer::default();
            sequencer.load(&input)?;
            sequencer.build_notes(tempo_scale);
            println!("{}", serde_json::to_string_pretty(&sequencer.summary())?);
        }
        Commands::Render {
            input,
            output,
            tempo_scale,
            sample_rate,
            soundfont,
        } => {
            let mut config = EngineConfig {
                soundfont_path: soundfont,
                ..EngineConfig::default()
            };
            if let Some(sample_rate) = sample_rate {
                config.sample_rate = sample_rate;
            }
            let bank = load_bank(&config)?;
            let mut engine = AudioEngine::offline_with_config(config, bank);
            let mut sequencer = Sequencer::default();
            sequencer.load(&input)?;
            sequencer.generate(&mut engine, tempo_scale)?;
            let frames = export_wav(sequencer.tracks(), engine.sample_rate(), &output)?;
            tracing::info!(frames, path = %output.display(), "render written");
        }
        Commands::Play {
            input,
            tempo_scale,
            start_seconds,
            soundfont,
        } => {
            let mut engine = AudioEngine::initialize(EngineConfig {
                soundfont_path: soundfont,
                ..EngineConfig::default()
            })?;
            let mut sequencer = Sequencer::default();
            sequencer.load(&input)?;
            sequencer.generate(&mut engine, tempo_scale)?;
            engine.set_time_pointer(&sequencer, start_seconds)?;
            engine.start_stream(&sequencer)?;
            while !engine.collect_finished_stream() {
                thread::sleep(Duration::from_millis(250));
                tracing::debug!(time_pointer = engine.time_pointer(), "playing");
            }
            tracing::info!("playback finished");
        }
        Commands::Record {
            port,
            seconds,
            output_dir,
        } => {
            let mut recorder = Recorder::new(RecorderConfig {
                output_dir: Some(output_dir),
                port_index: port,
            });
            recorder.start_recording()?;
            thread::sleep(Duration::from_secs(seconds));
            recorder.stop_recording();
            let path = recorder.save()?;
            tracing::info!(path = %path.display(), "recording written");
        }
        Commands::Demo { output_dir } => {
            std::fs::create_dir_all(&output_dir).with_context(|| {
                format!("failed to create output directory: {}", output_dir.display())
            })?;
            let file = demo_file();
            write_midi(&file, &output_dir.join("demo.mid"))?;

            let config = EngineConfig::default();
            let mut engine = AudioEngine::offline_with_config(
                config.clone(),
                Box::new(OscillatorBank::new(config.sample_rate)),
            );
            let mut sequencer = Sequencer::default();
            sequencer.load_file(&file)?;
            sequencer.generate(&mut engine, 1.0)?;
            export_wav(
                sequencer.tracks(),
                engine.sample_rate(),
                &output_dir.join("demo.wav"),
            )?;
            tracing::info!(path = %output_dir.display(), "demo files written");
        }
    }

    Ok(())
}

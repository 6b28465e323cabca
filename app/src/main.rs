use std::io;

use anyhow::Context;
use pianolane_app::{Command, Session, config::AppConfig, run};
use pianolane_core::init_tracing_with_options;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let telemetry = init_tracing_with_options(
        &config.paths.logs_dir,
        &config.diagnostics.trace_file_prefix,
        &config.diagnostics.rust_log_filter,
    )
    .context("tracing init failed")?;
    info!(
        session_id = %telemetry.session_id,
        log_file = %telemetry.log_file.display(),
        "pianolane starting"
    );

    let mut session = Session::new(&config)?;
    if let Some(path) = config.paths.initial_midi_file.clone() {
        if let Err(err) = session.execute(Command::Load(path)) {
            warn!(error = %format!("{err:#}"), "initial midi file not loaded");
        }
    }

    let stdin = io::stdin();
    run(&mut session, stdin.lock(), io::stdout().lock())?;
    info!("pianolane stopped");
    Ok(())
}

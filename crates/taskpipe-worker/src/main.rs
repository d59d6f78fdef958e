//! The bundled worker binary.
//!
//! Speaks the taskpipe protocol over stdin/stdout and interprets payloads
//! with the directive dialect. Diagnostics go to stderr so they never mix
//! with the response stream.

use std::io;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use taskpipe_worker::{DirectiveRunner, Worker};

fn main() -> ExitCode {
    init_telemetry();
    let worker = Worker::new(DirectiveRunner::new(), Box::new(io::stdout()));
    match worker.run(io::stdin().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "dispatch engine failed");
            ExitCode::FAILURE
        }
    }
}

fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

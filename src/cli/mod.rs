// CLI module - User-facing command-line interface

pub mod output;

use crate::config::SessionConfig;
use crate::error::{DocklogError, Result};
use crate::logs::DockerCliSource;
use crate::mux::{Multiplexer, Phase, Session, SessionEvent, SessionSummary};
use clap::Parser;
use indicatif::ProgressBar;
use output::OutputSink;
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Simultaneously stream the logs of up to eight Docker containers
#[derive(Parser, Debug)]
#[command(name = "docklog")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Container names or IDs
    #[arg(value_name = "CONTAINER", required = true)]
    containers: Vec<String>,

    /// Prepend timestamps to log lines
    #[arg(short, long, visible_alias = "time")]
    timestamps: bool,

    /// Number of lines to show from end of the logs (default 10)
    #[arg(short = 'n', long)]
    tail: Option<usize>,

    /// Print the current logs and exit instead of following
    #[arg(short = 's', long = "static")]
    static_mode: bool,

    /// Daemon address (defaults to DOCKER_HOST, then the local socket)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Read defaults from a TOML or JSON file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable colored labels
    #[arg(long)]
    no_color: bool,
}

impl Cli {
    /// Run the CLI application
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute().await
    }

    /// Execute the parsed command
    async fn execute(&self) -> Result<()> {
        if self.no_color {
            colored::control::set_override(false);
        }

        let config = self.session_config()?;
        SessionConfig::validate_sources(&self.containers)?;

        let cancel = CancellationToken::new();
        install_interrupt_handler(cancel.clone())?;

        let source = DockerCliSource::new(&config);
        debug!(host = source.host(), "Using docker daemon");

        let session = Multiplexer::new(source, config.clone())
            .with_cancel_token(cancel)
            .start(self.containers.clone())?;

        let spinner = std::io::stderr().is_terminal().then(|| {
            output::create_progress_bar(&format!(
                "Fetching logs from {} container(s)...",
                self.containers.len()
            ))
        });

        let mut sink = output::TerminalSink::new(std::io::stdout(), config.timestamps);
        let summary = pump(session, &mut sink, spinner).await?;
        debug!("{}", output::format_summary(&summary));

        Ok(())
    }

    /// Merge CLI flags over the config file (or defaults)
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)?,
            None => SessionConfig::default(),
        };

        if let Some(tail) = self.tail {
            config.tail = tail;
        }
        if self.timestamps {
            config.timestamps = true;
        }
        if self.static_mode {
            config.follow = false;
        }
        if let Some(ref host) = self.host {
            config.host = Some(host.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Drive a session into a sink until it stops
///
/// Source failures are reported on stderr as they happen. A closed stdout
/// (for example `docklog web | head`) cancels the session and counts as a
/// clean exit.
pub async fn pump<O: OutputSink>(
    mut session: Session,
    sink: &mut O,
    mut spinner: Option<ProgressBar>,
) -> Result<SessionSummary> {
    while let Some(event) = session.next_event().await {
        if !matches!(event, SessionEvent::PhaseChanged(Phase::Bootstrap)) {
            if let Some(pb) = spinner.take() {
                pb.finish_and_clear();
            }
        }

        match event {
            SessionEvent::Line(line) => {
                let written = sink.write_line(&line).and_then(|_| sink.flush());
                match written {
                    Ok(()) => {}
                    Err(DocklogError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("Output closed, canceling session");
                        session.cancel();
                        break;
                    }
                    Err(e) => {
                        session.cancel();
                        return Err(e);
                    }
                }
            }
            SessionEvent::SourceFailed { identity, error } => {
                output::print_source_failure(&identity, &error.to_string());
            }
            SessionEvent::SourceEnded { identity } => {
                debug!(identity = %identity, "Container stopped");
            }
            SessionEvent::PhaseChanged(phase) => {
                debug!(phase = %phase, "Session phase changed");
            }
        }
    }

    if let Some(pb) = spinner.take() {
        pb.finish_and_clear();
    }

    session.wait().await
}

/// Cancel the session on Ctrl-C
fn install_interrupt_handler(cancel: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .map_err(|e| DocklogError::Other(format!("Failed to install interrupt handler: {}", e)))
}

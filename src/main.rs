use docklog::cli::{output, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr so they never mix with container output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    if let Err(e) = Cli::run().await {
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
}

use detect_stream::Config;
use ffmpeg_next::{self as ffmpeg};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = start().await {
        error!(?err, "detect-stream stopped");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn start() -> anyhow::Result<()> {
    ffmpeg::init()?;

    // Load configuration from CLI and/or config file
    let config = Config::load()?;
    detect_stream::run(config).await
}

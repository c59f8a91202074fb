mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use opsrelay::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    opsrelay::logging::init_tracing(cli.log.as_deref());

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => opsrelay::config::get_config_dir()?,
    };
    let engine = Engine::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    let result = cli::run(cli.command, &engine, &config_dir).await;
    engine.shutdown().await;
    result
}

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "runlink-server", version, about = "Run client-submitted programs and stream their I/O")]
struct Cli {
    /// Address to listen on, overriding the config file and RUNLINK_PORT.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Config file (TOML). Defaults to ~/.config/runlink/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = config::ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.debug |= cli.debug;

    let level = if config.debug { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in ["runlink_server", "librunlink"] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    server::run(config).await
}

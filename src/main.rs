mod meshport;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "meshport",
    version,
    about = "meshport - reverse proxy for overlay-network services"
)]
struct Cli {
    /// Path to the meshport config file (.yaml). If omitted, uses CONFIG_PATH;
    /// then falls back to ./config.yaml.
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    meshport::run(cli.config).await
}

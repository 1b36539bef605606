pub mod api;
pub mod app;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod net;
pub mod overlay;
pub mod registry;
pub mod route;
pub mod timeseries;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}

//! HTTP server command, `provisiond serve`.

use anyhow::Result;
use std::path::Path;

use provisiond::config::ProvisionConfig;
use provisiond::http::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let provision = ProvisionConfig::with_cli_args(config_path, port, host)?;

    for warning in provision.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(ServerConfig {
        provision,
        dev_mode: dev,
    })
    .await
}

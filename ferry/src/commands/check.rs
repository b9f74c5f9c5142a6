use anyhow::Result;
use tracing::*;

use crate::config::{build_options, load_config};

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    build_options(&config)?;
    info!("No problems found");
    Ok(())
}

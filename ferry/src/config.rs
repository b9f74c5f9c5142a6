use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use ferry_common::{FerryConfig, Options};
use tracing::*;

/// Reads the YAML file, if any, with `FERRY_<SECTION>__<KEY>` variables
/// on top.
pub fn load_config(path: Option<&Path>) -> Result<FerryConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }
    let config: FerryConfig = builder
        .add_source(
            Environment::with_prefix("FERRY")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Could not load config")?
        .try_deserialize()
        .context("Could not parse config")?;

    config
        .validate()
        .map_err(|error| anyhow::anyhow!("Invalid config: {error}"))?;

    match path {
        Some(path) => info!(?path, "Using config"),
        None => debug!("No config file given, using defaults"),
    }
    Ok(config)
}

pub fn build_options(config: &FerryConfig) -> Result<Options> {
    let options = Options::new();
    config
        .apply(&options)
        .context("Could not apply config")?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ferry_common::OptionId;

    use super::*;

    #[test]
    fn yaml_file_is_applied() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "connection:\n  timeout: 1m\n  passive: false\nhelpers:\n  sftp: /opt/ferry/sftp\n"
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        let options = build_options(&config).unwrap();
        assert_eq!(options.get_int(OptionId::Timeout), 60);
        assert!(!options.get_bool(OptionId::UsePassive));
        assert_eq!(options.get_string(OptionId::SftpHelper), "/opt/ferry/sftp");
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "buffers:\n  count: 0\n").unwrap();
        let error = load_config(Some(file.path())).unwrap_err();
        assert!(error.to_string().contains("buffer count"));
    }
}

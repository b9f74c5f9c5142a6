use anyhow::{Context, Result};
use ferry_common::{FerryConfig, FileExistsAction, ServerPath, Site};
use url::Url;

use crate::client::Client;
use crate::config::{build_options, load_config};
use crate::prompt::{Batch, Interactive, Prompter};

/// Loads settings, logs in, and hands back the ready client.
pub(crate) async fn connect(
    cli: &crate::Cli,
    url: &Url,
    on_exists: Option<FileExistsAction>,
) -> Result<(Client, FerryConfig)> {
    let config = load_config(cli.config.as_deref())?;
    let options = build_options(&config)?;
    let site = Site::from_url(url).with_context(|| format!("Invalid URL {url}"))?;

    let prompter: Box<dyn Prompter> = if console::user_attended_stderr() {
        Box::new(Interactive::default())
    } else {
        Box::new(Batch {
            trust_unknown: cli.trust,
            allow_insecure: cli.allow_insecure,
            on_exists: on_exists.unwrap_or(FileExistsAction::Skip),
        })
    };

    let mut client = Client::new(options, site, prompter)?;
    client.connect().await?;
    Ok((client, config))
}

/// Directory and name of the file a URL points at.
pub(crate) fn split_file(site: &Site) -> Result<(ServerPath, String)> {
    let path = site
        .remote_path
        .as_ref()
        .context("The URL does not name a file")?;
    let name = path
        .last_segment()
        .context("The URL does not name a file")?
        .to_owned();
    let dir = path.parent().context("The URL does not name a file")?;
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(url: &str) -> Site {
        Site::from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn file_urls_split_into_directory_and_name() {
        let (dir, name) = split_file(&site("ftp://example.com/pub/docs/readme.txt")).unwrap();
        assert_eq!(dir.to_string(), "/pub/docs");
        assert_eq!(name, "readme.txt");

        let (dir, name) = split_file(&site("sftp://alice@example.com/top.txt")).unwrap();
        assert!(dir.is_root());
        assert_eq!(name, "top.txt");
    }

    #[test]
    fn server_root_is_not_a_file() {
        assert!(split_file(&site("ftp://example.com/")).is_err());
        assert!(split_file(&site("ftp://example.com")).is_err());
    }
}

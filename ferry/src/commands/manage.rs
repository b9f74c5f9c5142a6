use anyhow::{Context, Result};
use ferry_common::{Command, ServerPath};
use tracing::*;
use url::Url;

use super::common::{connect, split_file};

pub(crate) async fn mkdir(cli: &crate::Cli, url: &Url) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let path = client
        .site()
        .remote_path
        .clone()
        .context("The URL does not name a directory")?;
    client
        .run(Command::Mkdir { path: path.clone() })
        .await?
        .check("Creating the directory")?;
    info!(%path, "Created");
    client.disconnect().await
}

pub(crate) async fn rmdir(cli: &crate::Cli, url: &Url) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let (path, subdir) = split_file(client.site())?;
    client
        .run(Command::RemoveDir { path, subdir })
        .await?
        .check("Removing the directory")?;
    client.disconnect().await
}

pub(crate) async fn rm(cli: &crate::Cli, url: &Url) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let (path, file) = split_file(client.site())?;
    client
        .run(Command::Delete {
            path,
            files: vec![file],
        })
        .await?
        .check("Deleting")?;
    client.disconnect().await
}

pub(crate) async fn mv(cli: &crate::Cli, url: &Url, to: &str) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let (from_path, from_file) = split_file(client.site())?;
    let (to_path, to_file) = rename_target(&from_path, to)?;
    client
        .run(Command::Rename {
            from_path,
            from_file,
            to_path,
            to_file,
        })
        .await?
        .check("Renaming")?;
    client.disconnect().await
}

pub(crate) async fn chmod(cli: &crate::Cli, url: &Url, mode: &str) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let (path, file) = split_file(client.site())?;
    client
        .run(Command::Chmod {
            path,
            file,
            permission: mode.to_owned(),
        })
        .await?
        .check("Changing permissions")?;
    client.disconnect().await
}

pub(crate) async fn quote(cli: &crate::Cli, url: &Url, command: &str) -> Result<()> {
    let (mut client, _) = connect(cli, url, None).await?;
    let outcome = client.run(Command::RawCommand(command.to_owned())).await?;
    for line in &outcome.responses {
        println!("{line}");
    }
    outcome.check("The command")?;
    client.disconnect().await
}

/// A bare name stays in the source directory; a path is resolved
/// against it.
fn rename_target(from_dir: &ServerPath, to: &str) -> Result<(ServerPath, String)> {
    if !to.contains('/') {
        return Ok((from_dir.clone(), to.to_owned()));
    }
    let target = from_dir
        .change_path(to)
        .with_context(|| format!("Invalid target path {to}"))?;
    let name = target
        .last_segment()
        .with_context(|| format!("{to} does not name a file"))?
        .to_owned();
    let dir = target
        .parent()
        .with_context(|| format!("{to} does not name a file"))?;
    Ok((dir, name))
}

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use ferry_common::{
    Command, FerryConfig, FileTransferCommand, LocalEndpoint, ServerPath, Site, TransferMode,
};
use tracing::*;
use url::Url;

use super::common::{connect, split_file};
use crate::TransferArgs;

pub(crate) async fn get(
    cli: &crate::Cli,
    url: &Url,
    local: Option<&Path>,
    args: &TransferArgs,
) -> Result<()> {
    let (mut client, config) = connect(cli, url, args.on_exists.map(Into::into)).await?;
    let (dir, name) = split_file(client.site())?;
    let target = local_target(local, &name);

    let mut transfer =
        FileTransferCommand::download(dir, &name, LocalEndpoint::File(target.clone()));
    apply_settings(&mut transfer, args, &config);
    client
        .run(Command::FileTransfer(transfer))
        .await?
        .check("Download")?;
    info!(file = %name, target = %target.display(), "Downloaded");
    client.disconnect().await
}

pub(crate) async fn put(
    cli: &crate::Cli,
    local: &Path,
    url: &Url,
    args: &TransferArgs,
) -> Result<()> {
    ensure!(local.is_file(), "{} is not a file", local.display());
    let (mut client, config) = connect(cli, url, args.on_exists.map(Into::into)).await?;
    let (dir, name) = remote_target(client.site(), url, local)?;

    let mut transfer =
        FileTransferCommand::upload(LocalEndpoint::File(local.to_owned()), dir.clone(), &name);
    apply_settings(&mut transfer, args, &config);
    client
        .run(Command::FileTransfer(transfer))
        .await?
        .check("Upload")?;
    info!(target = %dir.format_filename(&name), "Uploaded");
    client.disconnect().await
}

fn apply_settings(transfer: &mut FileTransferCommand, args: &TransferArgs, config: &FerryConfig) {
    transfer.settings.mode = if args.ascii {
        TransferMode::Ascii
    } else {
        TransferMode::Binary
    };
    transfer.settings.on_exists = args.on_exists.map(Into::into);
    transfer.settings.preserve_timestamp =
        args.preserve_timestamp || config.transfers.preserve_timestamps;
}

/// An existing directory receives the file under its remote name.
fn local_target(local: Option<&Path>, name: &str) -> PathBuf {
    match local {
        None => PathBuf::from(name),
        Some(path) if path.is_dir() => path.join(name),
        Some(path) => path.to_owned(),
    }
}

fn remote_target(site: &Site, url: &Url, local: &Path) -> Result<(ServerPath, String)> {
    if !url.path().ends_with('/') {
        return split_file(site);
    }
    let name = local
        .file_name()
        .context("The local path has no file name")?
        .to_string_lossy()
        .into_owned();
    let dir = site.remote_path.clone().unwrap_or_else(ServerPath::root);
    Ok((dir, name))
}

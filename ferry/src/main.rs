mod client;
mod commands;
mod config;
mod logging;
mod prompt;
mod protocols;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ferry_common::FileExistsAction;
use url::Url;

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML settings file
    #[arg(long, short, env = "FERRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    debug: bool,

    /// Trust unknown host keys and certificates when running unattended
    #[arg(long, global = true)]
    trust: bool,

    /// Accept plain FTP and unprotected data connections when running
    /// unattended
    #[arg(long, global = true)]
    allow_insecure: bool,
}

#[derive(clap::Args, Clone, Default)]
struct TransferArgs {
    /// What to do when the target exists
    #[arg(long, value_enum)]
    on_exists: Option<OnExists>,

    /// Copy the modification time to the target
    #[arg(long)]
    preserve_timestamp: bool,

    /// Transfer in ASCII mode
    #[arg(long)]
    ascii: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OnExists {
    Overwrite,
    Newer,
    SizeDiffers,
    Resume,
    Skip,
}

impl From<OnExists> for FileExistsAction {
    fn from(value: OnExists) -> Self {
        match value {
            OnExists::Overwrite => FileExistsAction::Overwrite,
            OnExists::Newer => FileExistsAction::OverwriteNewer,
            OnExists::SizeDiffers => FileExistsAction::OverwriteSizeDiffers,
            OnExists::Resume => FileExistsAction::Resume,
            OnExists::Skip => FileExistsAction::Skip,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List a remote directory
    Ls { url: Url },
    /// Download a file
    Get {
        url: Url,
        /// Local file or directory, defaults to the remote name
        local: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Upload a file; a URL ending in `/` keeps the local name
    Put {
        local: PathBuf,
        url: Url,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Create a remote directory and any missing parents
    Mkdir { url: Url },
    /// Remove an empty remote directory
    Rmdir { url: Url },
    /// Delete a remote file
    Rm { url: Url },
    /// Rename or move a remote file
    Mv {
        url: Url,
        /// New name, or an absolute path on the same server
        to: String,
    },
    /// Change permissions of a remote file
    Chmod { url: Url, mode: String },
    /// Send a raw command and print the server's response
    Quote {
        url: Url,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate config file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug)?;

    match &cli.command {
        Commands::Ls { url } => commands::ls::command(&cli, url).await,
        Commands::Get {
            url,
            local,
            transfer,
        } => commands::transfer::get(&cli, url, local.as_deref(), transfer).await,
        Commands::Put {
            local,
            url,
            transfer,
        } => commands::transfer::put(&cli, local, url, transfer).await,
        Commands::Mkdir { url } => commands::manage::mkdir(&cli, url).await,
        Commands::Rmdir { url } => commands::manage::rmdir(&cli, url).await,
        Commands::Rm { url } => commands::manage::rm(&cli, url).await,
        Commands::Mv { url, to } => commands::manage::mv(&cli, url, to).await,
        Commands::Chmod { url, mode } => commands::manage::chmod(&cli, url, mode).await,
        Commands::Quote { url, command } => {
            commands::manage::quote(&cli, url, &command.join(" ")).await
        }
        Commands::Check => commands::check::command(&cli).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn transfer_flags_parse() {
        let cli = Cli::try_parse_from([
            "ferry",
            "get",
            "sftp://alice@files.example.com/pub/a.txt",
            "/tmp",
            "--on-exists",
            "size-differs",
            "--trust",
        ])
        .unwrap();
        assert!(cli.trust);
        let Commands::Get {
            url,
            local,
            transfer,
        } = cli.command
        else {
            panic!("not a download");
        };
        assert_eq!(url.path(), "/pub/a.txt");
        assert_eq!(local, Some(PathBuf::from("/tmp")));
        assert_eq!(transfer.on_exists, Some(OnExists::SizeDiffers));
    }

    #[test]
    fn quote_keeps_the_whole_command() {
        let cli =
            Cli::try_parse_from(["ferry", "quote", "ftp://example.com", "SITE", "CHMOD", "-x"])
                .unwrap();
        let Commands::Quote { command, .. } = cli.command else {
            panic!("not a quote");
        };
        assert_eq!(command.join(" "), "SITE CHMOD -x");
    }
}

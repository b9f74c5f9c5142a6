mod command;
mod config;
mod directory;
mod error;
mod logging;
mod notification;
mod options;
mod reply;
mod server;
mod server_path;
mod transfer_status;
mod types;

pub use command::*;
pub use config::*;
pub use directory::*;
pub use error::FerryError;
pub use logging::{LogMessage, MessageType};
pub use notification::*;
pub use options::{OptionId, OptionValue, Options, OptionsGeneration};
pub use reply::{Reply, ReplyFlags, ReplyKind};
pub use server::*;
pub use server_path::ServerPath;
pub use transfer_status::{TransferStatus, TransferStatusManager};
pub use types::*;

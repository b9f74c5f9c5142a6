pub mod activity;
pub mod aio;
pub mod ascii;
pub mod buffer_pool;
pub mod capabilities;
pub mod connection;
mod context;
pub use context::*;
pub mod control_socket;
mod engine;
pub use engine::*;
pub mod helper_process;
pub mod lock_manager;
pub mod logging;
pub mod operation;
pub mod proxy;
pub mod rate_limiting;
pub mod throttler;
pub mod transfer;

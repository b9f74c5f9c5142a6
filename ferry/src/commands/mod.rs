pub mod check;
mod common;
pub mod ls;
pub mod manage;
pub mod transfer;

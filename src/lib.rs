//! Backup, verification, retention and restore for MySQL/MariaDB databases

pub mod cli;
pub mod core;
pub mod prompt;
pub mod utils;

//! Data models

pub mod deployment;
pub mod filter;
pub mod health;
pub mod monitoring;
pub mod rollback;
pub mod target;

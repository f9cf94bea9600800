//! Policy deployer library
//!
//! Rolls security-policy payloads out to a fleet of targets with staged
//! rollout algorithms, health verification, snapshots for rollback and
//! rule-based monitoring.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod models;
pub mod monitoring;
pub mod notify;
pub mod progress;
pub mod rollback;
pub mod server;
pub mod storage;
pub mod strategy;
pub mod targets;
pub mod utils;
pub mod workers;

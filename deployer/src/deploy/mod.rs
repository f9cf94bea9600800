//! Deployment module

pub mod cancel;
pub mod executor;
pub mod fsm;
pub mod rollout;

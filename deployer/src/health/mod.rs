pub mod backoff;
pub mod checker;
pub mod probes;

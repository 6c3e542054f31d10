//! Stepping configuration and the per-thread stepping state machine.

mod config;
pub(crate) mod strategy;

pub use config::{StepConfig, StepConfigBuilder};
pub(crate) use strategy::SteppingStrategy;

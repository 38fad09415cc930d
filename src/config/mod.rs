// src/config/mod.rs
//! Configuration: pipeline policy + sources (TOML) and the inference client (JSON).

pub mod ai;
pub mod pipeline;

pub use ai::AiConfig;
pub use pipeline::PipelineConfig;

//! Orchestration of an external ComfyUI host for audio-driven talking-head
//! video generation: weight provisioning, workflow patching, execution and
//! output collection.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod output;
pub mod predictor;
pub mod request;
pub mod server;
pub mod staging;
pub mod weights;
pub mod workflow;

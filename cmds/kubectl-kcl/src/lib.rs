pub mod commands;
pub mod k8s;
pub mod orchestrate;
pub mod pipeline;
pub mod telemetry;
pub mod yaml;

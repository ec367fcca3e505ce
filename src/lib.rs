pub mod adapters;
pub mod configuration;
pub mod database;
pub mod domain;
pub mod error;
pub mod events;
pub mod http;
pub mod queue;
pub mod services;
pub mod telemetry;
pub mod workers;

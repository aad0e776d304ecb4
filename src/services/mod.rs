// src/services/mod.rs

//! Business logic: upstream fetch, outbound delivery, message assembly,
//! health evaluation.

pub mod health_monitor;
pub mod messages;
pub mod notifier;
pub mod weather;

pub use health_monitor::HealthMonitor;
pub use notifier::Notifier;
pub use weather::{AlertSource, WeatherApi};

//! HTTP handlers

pub mod anomalies;
pub mod flags;
pub mod health;
pub mod metrics;
pub mod predictions;
pub mod ws;

//! Metering Service - monthly usage billing with failure reconciliation.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;

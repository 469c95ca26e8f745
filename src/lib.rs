//! Substrate: event routing and background worker core.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod integrations;
pub mod notes;
pub mod store;
pub mod worker;

pub mod app;
pub mod auth;
pub mod availability;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod overdue;
pub mod payments;
pub mod pricing;
pub mod relay;
pub mod reservations;
pub mod store;
pub mod substitution;
pub mod transitions;

pub use app::AppState;

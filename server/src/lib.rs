//! TabPulse Server - ingest backend for the TabPulse agent.
//!
//! The server authenticates agents with email/password logins that yield
//! short-lived bearer tokens, accepts batches of tab activity events, and
//! aggregates them per user and domain for the dashboard.
//!
//! Everything is held in memory; restarting the server forgets sessions and
//! activity.

pub mod activity;
pub mod auth;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod types;

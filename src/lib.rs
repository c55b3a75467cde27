//! Matchmaker - pool-based matchmaking pipeline
//!
//! Tickets and backfills live in a state store. Each cycle queries the pools
//! of every match profile, runs a pluggable match function over them, lets an
//! evaluator pick a conflict-free subset of the proposals and applies it under
//! per-backfill leased locks.

pub mod config;
pub mod core;
pub mod models;
pub mod routes;
pub mod statestore;

// Re-export commonly used types
pub use core::{Backend, BackendOptions, CycleReport, Evaluator, GreedyEvaluator, MatchFunction};
pub use models::{Backfill, Match, MatchProfile, Pool, Ticket};
pub use statestore::{InMemoryStateStore, StateStore, StoreError};

//! Desired-state synchronization and reconciliation engine.
//!
//! A leader publishes the cluster's container table through a replicated
//! store, followers mirror it, and the leader drives the orchestration
//! substrate toward it.

pub mod affinity;
pub mod config;
pub mod controller;
pub mod db;
pub mod deployment;
pub mod hash;
pub mod join;
pub mod reconcile;
pub mod secret;
pub mod status;
pub mod store;
pub mod substrate;
pub mod sync;
pub mod types;

//! EdgeSync Control Plane Library
//!
//! Watches Ingress and Service resources, derives the edge load balancer's
//! routing table and keeps it committed to a git repository.

pub mod apis;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod retry;
pub mod routes;
pub mod store;
pub mod supervisor;

pub use error::{Result, SyncError};

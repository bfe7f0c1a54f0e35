//! vitrine control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! library surface to enable integration testing and reuse.

pub mod admin;
pub mod config;
pub mod db;
pub mod gc;
pub mod instance;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod provision;
pub mod reconciler;
pub mod registry;
pub mod routing;
pub mod tenant;
pub mod worker;

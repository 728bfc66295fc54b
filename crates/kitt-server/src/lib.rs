//! kitt-server library target.
//!
//! Exposes the router, state, and control-plane modules for integration
//! tests. The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod auth;
pub mod dispatch;
pub mod executor;
pub mod recovery;
pub mod registry;
pub mod routes;
pub mod state;

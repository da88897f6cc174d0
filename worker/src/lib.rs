//! Library surface for `strixun-identity-worker`, split out from
//! `main.rs` so the integration test suite can build the same router
//! `tower::ServiceExt::oneshot` drives instead of a second copy of it.

pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

//! Palisade Coordinator
//!
//! The control plane of a confidential-computing service mesh. The
//! Coordinator bootstraps mutual trust between enclaved workloads
//! ("marbles") and the operator:
//!
//! - An operator publishes a signed manifest describing which enclave
//!   measurements may join the mesh, under which identity, and with which
//!   secrets.
//! - Each marble proves its enclave identity with a hardware quote; an
//!   accepted quote yields a short-lived X.509 certificate, templated
//!   secrets, and a recorded activation.
//! - All state lives in a sealed store; if the sealing key is lost, the
//!   designated recovery parties can bring the Coordinator back.
//!
//! ## Surfaces
//!
//! - Client REST: `GET /status`, `GET|POST /manifest`, `POST /update`,
//!   `POST /recover`, `GET|POST /secrets/{name}`
//! - Marble: `POST /activate`, `GET /quote` on the mesh listener
//!
//! The security-critical leaves (quote abstraction, sealer, PKI, manifest
//! model, secret engine) live in the `palisade-core` crate.

pub mod api;
pub mod config;
pub mod core;
pub mod store;

pub use api::{create_client_router, create_marble_router, AppState};
pub use config::Config;
pub use core::{ActivationRequest, ActivationResponse, Core, CoordinatorState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

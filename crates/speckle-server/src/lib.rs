//! Reference object server for the Speckle object store.
//!
//! Serves the object API described in [`speckle_remote::api`] from memory,
//! one store per stream. It backs end-to-end tests and the `speckle serve`
//! command; nothing is persisted.

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;

pub use auth::Credentials;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::SpeckleServer;
pub use state::{ServerState, StreamData};

//! HTTPS transport for LanVault.
//!
//! The receiver serves three endpoints over TLS with a self-signed
//! certificate:
//!
//! - `POST /api/v1/register` pairs a sender after the operator confirms
//! - `POST /api/v1/prepare-upload` proposes a batch of files
//! - `PUT /api/v1/upload` delivers one accepted file
//!
//! Error responses carry a JSON body `{"error": ..., "code": ...}` which
//! [`SenderClient`] turns back into [`lanvault_common::Error`].

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod trust;

pub use client::{describe_file, SenderClient};
pub use config::{ReceiverConfig, DEFAULT_PORT};
pub use error::{ApiError, ErrorBody};
pub use handlers::AppState;
pub use server::{create_router, ReceiverServer, ServerHandle};
pub use trust::{display_string, fingerprint, CapturedCertificate, Identity, TofuVerifier, TrustStore};

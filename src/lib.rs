//! Confidential Enclave - attestation-gated payload processing for AWS Nitro Enclaves
//!
//! The enclave accepts one JSON request per connection from its parent
//! instance:
//! - `ping` for liveness
//! - `configure` to release a traffic session key from KMS against a fresh
//!   NSM attestation document
//! - `process` to decrypt an AES-256-GCM envelope, transform it and return a
//!   new envelope under the same key

pub mod attestation;
pub mod aws;
mod ber;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod kms;
pub mod protocol;
pub mod provisioner;
pub mod recipient;
pub mod server;
pub mod state;
pub mod vsock_transport;

#[cfg(test)]
mod test_helpers;

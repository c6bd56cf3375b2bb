//! Core library for talking to Mitsubishi Kumo indoor units.
//!
//! Kumo adapters are controlled two ways: through the Kumo cloud, which issues
//! short-lived JWT access tokens, and directly over the local network, where every
//! request is encrypted and signed with keys derived from per-device parameters the
//! cloud hands out. This crate implements both and keeps them consistent.
//!
//! # Overview
//!
//! - [`CloudTokenStore`] holds the current credential. Access tokens live 20 minutes,
//!   refresh tokens 30 days, and every refresh rotates both.
//! - [`CloudAuthenticator`] logs in and refreshes, with at most one refresh in flight
//!   per account since a refresh token can be used only once.
//! - [`crypto`] derives per-device key material and implements the payload cipher
//!   and request token.
//! - [`HttpTransport`] performs one encrypted HTTP exchange with an adapter.
//! - [`DeviceSession`] wraps one adapter, detects firmware fault markers in its
//!   responses and reboots the adapter at most once per 30 minutes.
//! - [`SessionOrchestrator`] ties it together.
//!
//! # Example
//!
//! ```no_run
//! use kumo_core::{ClientConfig, Credentials, SessionOrchestrator, commands};
//! use kumo_core::response::IndoorUnitStatus;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kumo_core::Error> {
//!     let client = SessionOrchestrator::new(
//!         Credentials::new("user@example.com", "password"),
//!         ClientConfig::default(),
//!     )?;
//!     client.bootstrap_device("2234P008M100013F", "192.168.1.20").await?;
//!
//!     let reply = client
//!         .query("2234P008M100013F", &commands::indoor_unit_status())
//!         .await?;
//!     let status = IndoorUnitStatus::from_response(&reply.response)?;
//!     println!("room temperature: {:?}", status.room_temp);
//!
//!     client
//!         .command("2234P008M100013F", &commands::set_heat_setpoint(21.0))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! A local request works as follows:
//!
//! 1. The command is JSON wrapped under `"c"` (e.g. `{"c":{"indoorUnit":{"status":{}}}}`)
//! 2. The JSON is encrypted with AES-128-CBC under the device's derived key and IV
//! 3. A token is computed over the ciphertext and the device's crypto serial
//! 4. The ciphertext is POSTed to `http://<adapter>/api?m=<token>`
//! 5. The response body is decrypted with the same key; its payload sits under `"r"`

pub mod auth;
pub mod clock;
pub mod cloud;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod response;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::CloudAuthenticator;
pub use clock::{Clock, SystemClock};
pub use cloud::{CloudApi, DeviceStatus, KumoCloudClient, TokenPair};
pub use config::ClientConfig;
pub use credentials::Credentials;
pub use crypto::{DeviceIdentity, DeviceKeyMaterial, KeySetVersion};
pub use device::{
    DeviceFault, DeviceResponse, DeviceSession, DeviceSessionState, FaultReport, RebootAction,
    RecoveryPolicy,
};
pub use error::{BackoffScope, Error, ErrorClass};
pub use orchestrator::SessionOrchestrator;
pub use token::{AccessToken, CloudCredential, CloudTokenStore, TokenPolicy};
pub use transport::{HttpTransport, LocalTransport, TransportConfig};

/// The version of the kumo-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

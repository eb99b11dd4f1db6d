//! OPNsense REST API Client
//!
//! A Rust client library for the parts of the OPNsense REST API that the
//! controller manages: HAProxy frontends/backends/ACLs/actions, dnsmasq and
//! Unbound host overrides, and OpenBGPD/FRR neighbors.
//!
//! Every managed collection follows the same URL pattern, described by an
//! [`Endpoint`]:
//!
//! - `POST /api/<module>/<controller>/search_<items>` returns `{"rows": [...]}`
//! - `GET  /api/<module>/<controller>/get_<item>/<uuid>` returns `{"<wrapper>": {...}}`
//! - `POST /api/<module>/<controller>/add_<item>` with `{"<wrapper>": {...}}`
//! - `POST /api/<module>/<controller>/set_<item>/<uuid>` with `{"<wrapper>": {...}}`
//! - `POST /api/<module>/<controller>/del_<item>/<uuid>`
//! - `POST /api/<module>/service/reload`
//!
//! # Example
//!
//! ```no_run
//! use opnsense_client::{Endpoint, OpnSenseClient, OpnSenseClientTrait, Subsystem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OpnSenseClient::builder("https://opnsense.local", "key", "secret")
//!     .danger_accept_invalid_certs(true)
//!     .build()?;
//!
//! let frontends = client.search(&Endpoint::HAPROXY_FRONTEND).await?;
//! println!("{} frontends", frontends.len());
//!
//! client.reload(Subsystem::Haproxy).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod opnsense_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{OpnSenseClient, OpnSenseClientBuilder};
pub use endpoint::{Endpoint, KeyField, Subsystem};
pub use error::OpnSenseError;
pub use models::*;
pub use opnsense_trait::OpnSenseClientTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockCall, MockOpnSenseClient};

//! A client for the Web Risk URL threat lookup service – library crate.
//!
//! The client answers "is this URL classified as a threat, and if so, what
//! kind?" for large query volumes while keeping remote traffic low and
//! queries private: full URLs never leave the host, only prefixes of their
//! SHA-256 hashes do.
//!
//! Three tiers settle each query:
//!
//! 1. a local database of hash prefixes, synchronized from the service in
//!    the background through an incremental diff protocol;
//! 2. a cache of the service's per-hash verdicts, positive and negative,
//!    bounded by server-supplied expirations;
//! 3. a privacy-preserving prefix query against the service for whatever
//!    the first two tiers cannot settle.
//!
//! ```no_run
//! # async fn example() -> Result<(), webrisk::Error> {
//! let client = webrisk::Client::new(webrisk::Config {
//!     api_key: "your-api-key".to_string(),
//!     ..webrisk::Config::default()
//! })?;
//! client.wait_until_ready().await?;
//!
//! let (threats, err) = client.lookup_urls(&["http://testsafebrowsing.appspot.com/s/malware.html"]).await;
//! assert!(err.is_none());
//! for threat in &threats[0] {
//!     println!("{} is flagged {}", threat.pattern, threat.threat_type);
//! }
//! # Ok(())
//! # }
//! ```

pub use crate::client::{Client, Stats};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::lookup::UrlThreat;
pub use crate::threat::ThreatType;

mod api;
mod cache;
mod client;
mod config;
mod database;
mod error;
pub mod hash;
mod lookup;
mod rice;
mod threat;
mod update;
pub mod urls;
mod util;

//! The remote Web Risk service.
//!
//! [`Api`] is the stateless RPC surface the rest of the client is written
//! against: the updater drives [`Api::list_update`] and the lookup pipeline
//! drives [`Api::search_hashes`]. The production implementation is
//! [`HttpApi`]; tests substitute an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use jiff::Timestamp;

use crate::error::Error;
use crate::hash::{FullHash, HashPrefix};
use crate::threat::ThreatType;

mod http;

pub use self::http::HttpApi;

//----------- Api --------------------------------------------------------------

/// A client for the remote Web Risk service.
#[async_trait]
pub trait Api: Send + Sync {
    /// Fetch the diff bringing one threat list up to date.
    async fn list_update(&self, request: ListUpdateRequest) -> Result<ListUpdateResponse, Error>;

    /// Look up the full hashes matching a hash prefix.
    async fn search_hashes(&self, request: &HashSearchRequest) -> Result<HashSearchResponse, Error>;
}

//----------- List updates -----------------------------------------------------

/// A request for one threat list's diff.
#[derive(Clone, Debug)]
pub struct ListUpdateRequest {
    /// The threat list to update.
    pub threat_type: ThreatType,

    /// The opaque state token from the previous update.
    ///
    /// Empty on the first update, which asks the server for a full reset.
    pub version_token: Bytes,

    /// Size constraints on the response.
    pub constraints: Constraints,
}

/// Client-imposed size constraints on a diff.
#[derive(Clone, Debug, Default)]
pub struct Constraints {
    /// The most diff entries the client is willing to apply at once.
    pub max_diff_entries: Option<u32>,

    /// The most database entries the client is willing to hold.
    pub max_database_entries: Option<u32>,
}

/// How a diff response relates to the client's current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    /// A partial update onto the existing prefix array.
    Diff,

    /// A complete replacement; prior state must be discarded.
    Reset,
}

/// The server's diff for one threat list.
#[derive(Clone, Debug)]
pub struct ListUpdateResponse {
    /// How to apply this response.
    pub response_type: ResponseType,

    /// Prefixes to merge in, in one or more encodings.
    pub additions: Vec<Additions>,

    /// Indices into the old sorted array to delete, in one or more
    /// encodings.
    pub removals: Vec<Removals>,

    /// The state token to echo on the next request.
    pub version_token: Bytes,

    /// SHA-256 over the concatenation of the updated sorted prefix array.
    pub checksum: Bytes,

    /// When the server recommends asking for the next diff.
    pub recommended_next_diff: Option<Timestamp>,
}

/// One encoded group of prefix additions.
#[derive(Clone, Debug)]
pub enum Additions {
    /// Concatenated prefixes of a fixed size.
    Raw {
        /// The byte length of each prefix in `data`.
        prefix_size: usize,
        /// The concatenated prefixes.
        data: Bytes,
    },

    /// Rice-compressed 4-byte prefixes.
    Rice(RiceDeltas),
}

/// One encoded group of removal indices.
#[derive(Clone, Debug)]
pub enum Removals {
    /// Plain indices into the old sorted array.
    Raw(Vec<u32>),

    /// Rice-compressed indices.
    Rice(RiceDeltas),
}

/// A Rice-compressed set of 32-bit values.
#[derive(Clone, Debug)]
pub struct RiceDeltas {
    /// The first value of the set.
    pub first_value: u32,

    /// The Rice parameter used for the deltas.
    pub rice_parameter: u32,

    /// How many deltas follow the first value.
    pub entry_count: u32,

    /// The bit-packed deltas.
    pub encoded_data: Bytes,
}

//----------- Hash searches ----------------------------------------------------

/// A privacy-preserving query for the threats matching a hash prefix.
#[derive(Clone, Debug)]
pub struct HashSearchRequest {
    /// The prefix to search. Only this leaves the host.
    pub prefix: HashPrefix,

    /// The threat lists the caller is interested in.
    pub threat_types: Vec<ThreatType>,
}

/// The server's verdicts for a hash prefix.
#[derive(Clone, Debug, Default)]
pub struct HashSearchResponse {
    /// Every full hash under the queried prefix that is on a list.
    pub threats: Vec<ThreatMatch>,

    /// Until when hashes under the prefix that are absent from `threats`
    /// may be treated as safe.
    pub negative_expire_time: Option<Timestamp>,
}

/// One full hash's positive verdict.
#[derive(Clone, Debug)]
pub struct ThreatMatch {
    /// The matched full hash.
    pub hash: FullHash,

    /// The lists the hash is on.
    pub threat_types: Vec<ThreatType>,

    /// Until when this verdict is authoritative.
    pub expire_time: Timestamp,
}

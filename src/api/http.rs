//! The JSON-over-HTTPS transport.
//!
//! Requests follow the v1 REST surface: `threatLists:computeDiff` for list
//! updates and `hashes:search` for prefix lookups, authenticated by an API
//! key in the query string. Byte fields travel base64-encoded and 64-bit
//! integers travel as decimal strings, per the service's JSON mapping.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::hash::{FullHash, FULL_HASH_LEN};
use crate::threat::ThreatType;

use super::{
    Additions, Api, HashSearchRequest, HashSearchResponse, ListUpdateRequest, ListUpdateResponse,
    Removals, ResponseType, RiceDeltas, ThreatMatch,
};

//----------- HttpApi ----------------------------------------------------------

/// The production [`Api`] implementation.
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    api_key: String,
}

impl HttpApi {
    /// Build the transport from the client configuration.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let base = if config.server_url.contains("://") {
            config.server_url.clone()
        } else {
            format!("https://{}/", config.server_url)
        };
        let base = Url::parse(&base)
            .map_err(|err| Error::InvalidConfig(format!("server URL: {err}")))?;

        let mut builder = reqwest::Client::builder()
            .user_agent(format!("{} {}", config.id, config.version))
            .timeout(config.request_timeout);
        if let Some(proxy) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|err| Error::InvalidConfig(format!("proxy URL: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| Error::InvalidConfig(err.to_string()))?;

        Ok(Self {
            client,
            base,
            api_key: config.api_key.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ApiTransport(format!(
                "HTTP {status}: {}",
                body.trim(),
            )));
        }
        response.json().await.map_err(transport)
    }

    fn endpoint(&self, method: &str) -> Result<Url, Error> {
        self.base
            .join(method)
            .map_err(|err| Error::ApiTransport(format!("building request URL: {err}")))
    }
}

/// Map a transport error, shorn of its URL so the API key never reaches a
/// log line.
fn transport(err: reqwest::Error) -> Error {
    Error::ApiTransport(err.without_url().to_string())
}

#[async_trait]
impl Api for HttpApi {
    async fn list_update(&self, request: ListUpdateRequest) -> Result<ListUpdateResponse, Error> {
        let mut url = self.endpoint("v1/threatLists:computeDiff")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("threatType", request.threat_type.name());
            if !request.version_token.is_empty() {
                query.append_pair("versionToken", &BASE64.encode(&request.version_token));
            }
            query.append_pair("constraints.supportedCompressions", "RAW");
            query.append_pair("constraints.supportedCompressions", "RICE");
            if let Some(n) = request.constraints.max_diff_entries {
                query.append_pair("constraints.maxDiffEntries", &n.to_string());
            }
            if let Some(n) = request.constraints.max_database_entries {
                query.append_pair("constraints.maxDatabaseEntries", &n.to_string());
            }
            query.append_pair("key", &self.api_key);
        }

        let wire: wire::ComputeDiffResponse = self.get_json(url).await?;
        wire.parse()
    }

    async fn search_hashes(&self, request: &HashSearchRequest) -> Result<HashSearchResponse, Error> {
        let mut url = self.endpoint("v1/hashes:search")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("hashPrefix", &BASE64.encode(request.prefix.as_bytes()));
            for threat_type in &request.threat_types {
                query.append_pair("threatTypes", threat_type.name());
            }
            query.append_pair("key", &self.api_key);
        }

        let wire: wire::SearchHashesResponse = self.get_json(url).await?;
        wire.parse()
    }
}

//----------- Wire format ------------------------------------------------------

mod wire {
    use jiff::Timestamp;
    use serde::Deserialize;
    use serde_with::base64::Base64;
    use serde_with::{serde_as, DisplayFromStr};

    use super::*;

    fn malformed(what: &str) -> Error {
        Error::ApiTransport(format!("malformed response: {what}"))
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub(super) struct ComputeDiffResponse {
        response_type: String,
        additions: Option<ThreatEntryAdditions>,
        removals: Option<ThreatEntryRemovals>,
        #[serde_as(as = "Option<Base64>")]
        new_version_token: Option<Vec<u8>>,
        checksum: Option<WireChecksum>,
        recommended_next_diff: Option<Timestamp>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct ThreatEntryAdditions {
        raw_hashes: Vec<RawHashes>,
        rice_hashes: Option<WireRiceDeltas>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct RawHashes {
        prefix_size: u32,
        #[serde_as(as = "Base64")]
        raw_hashes: Vec<u8>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct ThreatEntryRemovals {
        raw_indices: Option<RawIndices>,
        rice_indices: Option<WireRiceDeltas>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct RawIndices {
        indices: Vec<u32>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct WireRiceDeltas {
        #[serde_as(as = "Option<DisplayFromStr>")]
        first_value: Option<u32>,
        rice_parameter: u32,
        entry_count: u32,
        #[serde_as(as = "Base64")]
        encoded_data: Vec<u8>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct WireChecksum {
        #[serde_as(as = "Base64")]
        sha256: Vec<u8>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub(super) struct SearchHashesResponse {
        threats: Vec<WireThreat>,
        negative_expire_time: Option<Timestamp>,
    }

    #[serde_as]
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct WireThreat {
        #[serde_as(as = "Base64")]
        hash: Vec<u8>,
        threat_types: Vec<ThreatType>,
        expire_time: Option<Timestamp>,
    }

    impl From<WireRiceDeltas> for RiceDeltas {
        fn from(wire: WireRiceDeltas) -> Self {
            Self {
                first_value: wire.first_value.unwrap_or(0),
                rice_parameter: wire.rice_parameter,
                entry_count: wire.entry_count,
                encoded_data: Bytes::from(wire.encoded_data),
            }
        }
    }

    impl ComputeDiffResponse {
        pub(super) fn parse(self) -> Result<ListUpdateResponse, Error> {
            let response_type = match self.response_type.as_str() {
                "DIFF" => ResponseType::Diff,
                "RESET" => ResponseType::Reset,
                other => return Err(malformed(&format!("response type {other:?}"))),
            };

            let mut additions = Vec::new();
            let mut removals = Vec::new();
            if let Some(wire) = self.additions {
                for raw in wire.raw_hashes {
                    additions.push(Additions::Raw {
                        prefix_size: raw.prefix_size as usize,
                        data: Bytes::from(raw.raw_hashes),
                    });
                }
                if let Some(rice) = wire.rice_hashes {
                    additions.push(Additions::Rice(rice.into()));
                }
            }
            if let Some(wire) = self.removals {
                if let Some(raw) = wire.raw_indices {
                    removals.push(Removals::Raw(raw.indices));
                }
                if let Some(rice) = wire.rice_indices {
                    removals.push(Removals::Rice(rice.into()));
                }
            }

            let checksum = self.checksum.ok_or_else(|| malformed("missing checksum"))?;
            if checksum.sha256.len() != FULL_HASH_LEN {
                return Err(malformed("checksum is not a SHA-256 digest"));
            }

            Ok(ListUpdateResponse {
                response_type,
                additions,
                removals,
                version_token: Bytes::from(self.new_version_token.unwrap_or_default()),
                checksum: Bytes::from(checksum.sha256),
                recommended_next_diff: self.recommended_next_diff,
            })
        }
    }

    impl SearchHashesResponse {
        pub(super) fn parse(self) -> Result<HashSearchResponse, Error> {
            let mut threats = Vec::with_capacity(self.threats.len());
            for threat in self.threats {
                let hash = FullHash::from_bytes(Bytes::from(threat.hash))
                    .ok_or_else(|| malformed("threat hash is not a full SHA-256"))?;
                let expire_time = threat
                    .expire_time
                    .ok_or_else(|| malformed("threat without expiry"))?;
                threats.push(ThreatMatch {
                    hash,
                    threat_types: threat.threat_types,
                    expire_time,
                });
            }
            Ok(HashSearchResponse {
                threats,
                negative_expire_time: self.negative_expire_time,
            })
        }
    }
}

//============ Tests ===========================================================

//! Client configuration.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::error::Error;
use crate::threat::ThreatType;

/// The default service endpoint.
const DEFAULT_SERVER_URL: &str = "webrisk.googleapis.com";

/// The default client identity sent in the `User-Agent`.
const DEFAULT_ID: &str = "WebRiskContainer";
const DEFAULT_VERSION: &str = "1.0.0";

//----------- Config -----------------------------------------------------------

/// Configuration for a [`Client`](crate::Client).
///
/// Start from [`Config::default`] and set at least [`api_key`]; everything
/// else has a sensible default. Validation happens at client construction
/// and rejects a bad configuration with [`Error::InvalidConfig`].
///
/// [`api_key`]: Config::api_key
#[derive(Clone, Debug)]
pub struct Config {
    /// The service endpoint.
    ///
    /// A bare host gets `https://` prepended; a full URL is used as-is.
    pub server_url: String,

    /// An HTTP proxy overriding the environment's defaults.
    pub proxy_url: Option<String>,

    /// The API key authenticating every request. Required.
    pub api_key: String,

    /// The client name sent in the `User-Agent`.
    pub id: String,

    /// The client version sent in the `User-Agent`.
    pub version: String,

    /// Where to persist the threat database.
    ///
    /// Without a path the database lives in memory only and every start
    /// begins with a full fetch.
    pub db_path: Option<Utf8PathBuf>,

    /// The nominal interval between database syncs.
    pub update_period: Duration,

    /// The deadline applied to every request to the service.
    pub request_timeout: Duration,

    /// The threat lists to subscribe to.
    pub threat_lists: Vec<ThreatType>,

    /// A comma-separated list of threat type names overriding
    /// [`threat_lists`] when non-empty; `ALL` selects every list.
    ///
    /// [`threat_lists`]: Config::threat_lists
    pub threat_list_arg: String,

    /// Overrides every server-supplied cache expiry. Intended for tests.
    pub fixed_cache_ttl: Option<Duration>,

    /// The most diff entries the client is willing to apply at once.
    pub max_diff_entries: Option<u32>,

    /// The most database entries the client is willing to hold.
    pub max_database_entries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            proxy_url: None,
            api_key: String::new(),
            id: DEFAULT_ID.to_string(),
            version: DEFAULT_VERSION.to_string(),
            db_path: None,
            update_period: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(60),
            threat_lists: ThreatType::ALL.to_vec(),
            threat_list_arg: String::new(),
            fixed_cache_ttl: None,
            max_diff_entries: None,
            max_database_entries: None,
        }
    }
}

impl Config {
    /// Validate the configuration, resolving the threat list argument.
    pub(crate) fn validate(&mut self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::InvalidConfig("an API key is required".to_string()));
        }
        if self.update_period.is_zero() {
            return Err(Error::InvalidConfig(
                "the update period must be positive".to_string(),
            ));
        }

        if !self.threat_list_arg.is_empty() {
            self.threat_lists = parse_threat_lists(&self.threat_list_arg)?;
        }
        if self.threat_lists.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one threat list is required".to_string(),
            ));
        }
        if self.threat_lists.contains(&ThreatType::Unspecified) {
            return Err(Error::InvalidConfig(
                "cannot subscribe to the unspecified threat type".to_string(),
            ));
        }
        self.threat_lists.sort();
        self.threat_lists.dedup();

        Ok(())
    }
}

/// Parse a comma-separated list of threat type names.
pub(crate) fn parse_threat_lists(arg: &str) -> Result<Vec<ThreatType>, Error> {
    if arg == "ALL" {
        return Ok(ThreatType::ALL.to_vec());
    }
    arg.split(',')
        .map(|name| {
            let name = name.trim();
            ThreatType::from_name(name)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown threat list {name:?}")))
        })
        .collect()
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::threat::ThreatType;

    use super::{parse_threat_lists, Config};

    #[test]
    fn requires_an_api_key() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.api_key = "key".to_string();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.threat_lists, ThreatType::ALL.to_vec());
    }

    #[test]
    fn threat_list_argument() {
        assert_eq!(parse_threat_lists("ALL"), Ok(ThreatType::ALL.to_vec()));
        assert_eq!(
            parse_threat_lists("MALWARE, SOCIAL_ENGINEERING"),
            Ok(vec![ThreatType::Malware, ThreatType::SocialEngineering]),
        );
        assert!(parse_threat_lists("MALWARE,NONSENSE").is_err());
        assert!(parse_threat_lists("").is_err());
    }

    #[test]
    fn argument_overrides_threat_lists() {
        let mut config = Config {
            api_key: "key".to_string(),
            threat_lists: vec![ThreatType::Malware],
            threat_list_arg: "UNWANTED_SOFTWARE".to_string(),
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.threat_lists, vec![ThreatType::UnwantedSoftware]);
    }

    #[test]
    fn duplicate_lists_collapse() {
        let mut config = Config {
            api_key: "key".to_string(),
            threat_lists: vec![ThreatType::Malware, ThreatType::Malware],
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.threat_lists, vec![ThreatType::Malware]);
    }
}

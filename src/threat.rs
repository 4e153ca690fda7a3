//! Threat list identification.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

//----------- ThreatType -------------------------------------------------------

/// The kind of threat a list describes.
///
/// Each threat list the client subscribes to is identified by one of these
/// types. The set is closed; names on the wire that are not recognized parse
/// to [`ThreatType::Unspecified`] and never match a subscribed list.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatType {
    /// The sentinel for unrecognized wire names.
    Unspecified,

    /// Malware distribution pages.
    Malware,

    /// Social engineering (phishing and deceptive) pages.
    SocialEngineering,

    /// Unwanted software distribution pages.
    UnwantedSoftware,

    /// The extended coverage social engineering list.
    SocialEngineeringExtendedCoverage,
}

impl ThreatType {
    /// All threat types a client can subscribe to.
    pub const ALL: [Self; 4] = [
        Self::Malware,
        Self::SocialEngineering,
        Self::UnwantedSoftware,
        Self::SocialEngineeringExtendedCoverage,
    ];

    /// The name of this threat type on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unspecified => "THREAT_TYPE_UNSPECIFIED",
            Self::Malware => "MALWARE",
            Self::SocialEngineering => "SOCIAL_ENGINEERING",
            Self::UnwantedSoftware => "UNWANTED_SOFTWARE",
            Self::SocialEngineeringExtendedCoverage => {
                "SOCIAL_ENGINEERING_EXTENDED_COVERAGE"
            }
        }
    }

    /// Parse a wire or command-line name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "MALWARE" => Self::Malware,
            "SOCIAL_ENGINEERING" => Self::SocialEngineering,
            "UNWANTED_SOFTWARE" => Self::UnwantedSoftware,
            "SOCIAL_ENGINEERING_EXTENDED_COVERAGE" => {
                Self::SocialEngineeringExtendedCoverage
            }
            _ => return None,
        })
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//--- Serialization

impl Serialize for ThreatType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ThreatType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = std::borrow::Cow::<str>::deserialize(deserializer)?;
        Ok(Self::from_name(&name).unwrap_or(Self::Unspecified))
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::ThreatType;

    #[test]
    fn names_round_trip() {
        for tt in ThreatType::ALL {
            assert_eq!(ThreatType::from_name(tt.name()), Some(tt));
        }
        assert_eq!(ThreatType::from_name("MALWARE_2"), None);
        assert_eq!(ThreatType::from_name(""), None);
    }
}

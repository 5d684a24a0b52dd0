//! Exit region codes
//!
//! An instance either pins its circuits to one ISO-3166 alpha-2 country
//! (`ExitNodes {cc}` in the rendered torrc) or accepts any exit at all.
//! Unlike a VPN provider's fixed server list, Tor exits exist in almost
//! every country, so the code is validated by shape rather than drawn
//! from a closed enum.

use serde::{Deserialize, Serialize};

/// Requested or observed exit region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RegionCode {
    /// Any exit region is acceptable (no ExitNodes restriction).
    Any,
    /// A specific country, stored as an upper-case alpha-2 code.
    Country(String),
}

impl RegionCode {
    /// Parse a region code: two ASCII letters, or `any`/`*` for the wildcard.
    pub fn parse(s: &str) -> Result<Self, RegionParseError> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("any") || trimmed == "*" {
            return Ok(RegionCode::Any);
        }
        if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(RegionCode::Country(trimmed.to_ascii_uppercase()));
        }
        Err(RegionParseError::Invalid(s.to_string()))
    }

    /// Is this the wildcard?
    pub fn is_any(&self) -> bool {
        matches!(self, RegionCode::Any)
    }

    /// Code as written to config files and listings.
    pub fn as_str(&self) -> &str {
        match self {
            RegionCode::Any => "ANY",
            RegionCode::Country(cc) => cc,
        }
    }

    /// Lower-case form for torrc `ExitNodes {cc}` rendering.
    pub fn torrc_code(&self) -> Option<String> {
        match self {
            RegionCode::Any => None,
            RegionCode::Country(cc) => Some(cc.to_ascii_lowercase()),
        }
    }

    /// Does an observed exit region satisfy this requested region?
    ///
    /// The wildcard accepts anything, including an unknown region. A
    /// specific country only accepts an exact match; unknown never
    /// matches.
    pub fn accepts(&self, observed: Option<&RegionCode>) -> bool {
        match self {
            RegionCode::Any => true,
            RegionCode::Country(want) => {
                matches!(observed, Some(RegionCode::Country(got)) if got == want)
            }
        }
    }

    /// Human-readable country name for the common cases, for listings.
    pub fn display_name(&self) -> Option<&'static str> {
        let cc = match self {
            RegionCode::Any => return Some("Any country"),
            RegionCode::Country(cc) => cc.as_str(),
        };
        let name = match cc {
            "US" => "United States",
            "GB" => "United Kingdom",
            "DE" => "Germany",
            "NL" => "Netherlands",
            "FR" => "France",
            "SE" => "Sweden",
            "CH" => "Switzerland",
            "CA" => "Canada",
            "AU" => "Australia",
            "JP" => "Japan",
            "RO" => "Romania",
            "AT" => "Austria",
            "NO" => "Norway",
            "FI" => "Finland",
            "CZ" => "Czechia",
            "ES" => "Spain",
            "IT" => "Italy",
            "PL" => "Poland",
            _ => return None,
        };
        Some(name)
    }
}

impl std::fmt::Display for RegionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RegionCode {
    type Err = RegionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RegionCode {
    type Error = RegionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RegionCode> for String {
    fn from(code: RegionCode) -> String {
        code.as_str().to_string()
    }
}

/// Region parse errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegionParseError {
    #[error("invalid region code {0:?}: expected a 2-letter country code or ANY")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_country() {
        let us: RegionCode = "us".parse().unwrap();
        assert_eq!(us, RegionCode::Country("US".to_string()));
        assert_eq!(us.as_str(), "US");

        let de: RegionCode = " DE ".parse().unwrap();
        assert_eq!(de.as_str(), "DE");
    }

    #[test]
    fn test_parse_wildcard() {
        assert!(RegionCode::parse("any").unwrap().is_any());
        assert!(RegionCode::parse("ANY").unwrap().is_any());
        assert!(RegionCode::parse("*").unwrap().is_any());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(RegionCode::parse("USA").is_err());
        assert!(RegionCode::parse("U1").is_err());
        assert!(RegionCode::parse("").is_err());
        assert!(RegionCode::parse("ü2").is_err());
    }

    #[test]
    fn test_accepts() {
        let us = RegionCode::parse("US").unwrap();
        let de = RegionCode::parse("DE").unwrap();

        assert!(us.accepts(Some(&us)));
        assert!(!us.accepts(Some(&de)));
        assert!(!us.accepts(None));

        assert!(RegionCode::Any.accepts(Some(&de)));
        assert!(RegionCode::Any.accepts(None));
    }

    #[test]
    fn test_torrc_code() {
        assert_eq!(
            RegionCode::parse("US").unwrap().torrc_code().as_deref(),
            Some("us")
        );
        assert_eq!(RegionCode::Any.torrc_code(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let us = RegionCode::parse("US").unwrap();
        let json = serde_json::to_string(&us).unwrap();
        assert_eq!(json, "\"US\"");

        let back: RegionCode = serde_json::from_str("\"us\"").unwrap();
        assert_eq!(back, us);

        let any: RegionCode = serde_json::from_str("\"ANY\"").unwrap();
        assert!(any.is_any());

        assert!(serde_json::from_str::<RegionCode>("\"nope\"").is_err());
    }
}

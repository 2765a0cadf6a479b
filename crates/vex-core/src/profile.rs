//! Traffic-shaping profiles.
//!
//! A profile names a shaping discipline applied to the egress interface.
//! Rates are in bytes per second; `Standard` clears the root qdisc entirely.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a user-supplied profile name matches nothing.
#[derive(Debug, Error)]
#[error(
    "unknown profile {0:?}. Valid profiles: standard, choke, dial-up, black-hole \
     (aliases: blackout, dialup, 56k, uncapped)"
)]
pub struct UnknownProfile(pub String);

/// A named shaping discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    /// Unshaped; clears the root qdisc.
    #[serde(rename = "standard")]
    Standard,
    /// 1 Mbit/s with generous burst tolerance.
    #[serde(rename = "choke")]
    Choke,
    /// 56 kbit/s with a small buffer.
    #[serde(rename = "dial-up")]
    DialUp,
    /// 1 kbit/s; still permits heartbeat-sized traffic.
    #[serde(rename = "black-hole")]
    BlackHole,
}

/// Token-bucket parameters for a rate-limited profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbfParams {
    /// Sustained rate in bytes per second.
    pub rate_bytes: u64,
    /// Burst buffer in bytes.
    pub burst: u64,
    /// Queue limit in bytes.
    pub limit: u64,
}

impl Profile {
    /// Token-bucket parameters, or `None` for the unshaped profile.
    #[must_use]
    pub const fn tbf_params(self) -> Option<TbfParams> {
        match self {
            Self::Standard => None,
            Self::Choke => Some(TbfParams {
                rate_bytes: 125_000,
                burst: 100_000,
                limit: 1_000_000,
            }),
            Self::DialUp => Some(TbfParams {
                rate_bytes: 7_000,
                burst: 5_000,
                limit: 10_000,
            }),
            Self::BlackHole => Some(TbfParams {
                rate_bytes: 125,
                burst: 1_250,
                limit: 1_250,
            }),
        }
    }

    /// Sustained rate in bytes per second (0 for unshaped).
    #[must_use]
    pub const fn rate_bytes(self) -> u64 {
        match self.tbf_params() {
            Some(p) => p.rate_bytes,
            None => 0,
        }
    }

    /// Canonical name as persisted and displayed.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Choke => "choke",
            Self::DialUp => "dial-up",
            Self::BlackHole => "black-hole",
        }
    }

    /// Normalizes a user-supplied profile string to a canonical profile.
    ///
    /// Accepts case-insensitive input and common punctuation variants.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownProfile`] if the input matches no profile or alias.
    pub fn resolve(input: &str) -> Result<Self, UnknownProfile> {
        match input.trim().to_lowercase().as_str() {
            "standard" | "uncapped" => Ok(Self::Standard),
            "choke" | "throttle" => Ok(Self::Choke),
            "dial-up" | "dialup" | "56k" => Ok(Self::DialUp),
            "black-hole" | "blackhole" | "blackout" | "drop" => Ok(Self::BlackHole),
            _ => Err(UnknownProfile(input.to_string())),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_canonical_names() {
        assert_eq!(Profile::resolve("standard").unwrap(), Profile::Standard);
        assert_eq!(Profile::resolve("choke").unwrap(), Profile::Choke);
        assert_eq!(Profile::resolve("dial-up").unwrap(), Profile::DialUp);
        assert_eq!(Profile::resolve("black-hole").unwrap(), Profile::BlackHole);
    }

    #[test]
    fn resolves_aliases_case_insensitively() {
        assert_eq!(Profile::resolve("BLACKOUT").unwrap(), Profile::BlackHole);
        assert_eq!(Profile::resolve(" blackhole ").unwrap(), Profile::BlackHole);
        assert_eq!(Profile::resolve("drop").unwrap(), Profile::BlackHole);
        assert_eq!(Profile::resolve("56K").unwrap(), Profile::DialUp);
        assert_eq!(Profile::resolve("dialup").unwrap(), Profile::DialUp);
        assert_eq!(Profile::resolve("uncapped").unwrap(), Profile::Standard);
        assert_eq!(Profile::resolve("throttle").unwrap(), Profile::Choke);
    }

    #[test]
    fn rejects_unknown_profile() {
        let err = Profile::resolve("warp-speed").unwrap_err();
        assert!(err.to_string().contains("warp-speed"));
    }

    #[test]
    fn rates_match_profile_table() {
        assert_eq!(Profile::Standard.rate_bytes(), 0);
        assert_eq!(Profile::Choke.rate_bytes(), 125_000);
        assert_eq!(Profile::DialUp.rate_bytes(), 7_000);
        assert_eq!(Profile::BlackHole.rate_bytes(), 125);
    }

    #[test]
    fn serde_uses_canonical_names() {
        let json = serde_json::to_string(&Profile::BlackHole).unwrap();
        assert_eq!(json, "\"black-hole\"");
        let back: Profile = serde_json::from_str("\"dial-up\"").unwrap();
        assert_eq!(back, Profile::DialUp);
    }
}

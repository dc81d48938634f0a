//! Validated identifier newtypes.
//!
//! Every id type validates its shape on construction and round-trips through
//! serde as a plain string, via `TryFrom<String>` + `Display` + `FromStr`.

use std::fmt;
use std::str::FromStr;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// A validation failure for one of the id newtypes in this module.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} `{value}`: {reason}")]
pub struct IdError {
    /// Which id type failed validation.
    pub kind: &'static str,
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

fn validate_slug(kind: &'static str, s: &str, max_len: usize) -> Result<(), IdError> {
    if s.is_empty() || s.len() > max_len {
        return Err(IdError {
            kind,
            value: s.to_owned(),
            reason: format!("must be 1-{max_len} characters"),
        });
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(IdError {
            kind,
            value: s.to_owned(),
            reason: "must match [a-z0-9-]+".to_owned(),
        });
    }
    if s.starts_with('-') || s.ends_with('-') || s.contains("--") {
        return Err(IdError {
            kind,
            value: s.to_owned(),
            reason: "must not start/end with '-' or contain '--'".to_owned(),
        });
    }
    Ok(())
}

macro_rules! slug_id {
    ($name:ident, $kind:literal, $max_len:expr) => {
        #[doc = concat!("A validated `", $kind, "` identifier.")]
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Validate and construct a new `", stringify!($name), "`.")]
            ///
            /// # Errors
            /// Returns [`IdError`] if `s` does not match the expected shape.
            pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
                let s = s.into();
                validate_slug($kind, &s, $max_len)?;
                Ok(Self(s))
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

slug_id!(AgentId, "agent id", 64);
slug_id!(EvalSlug, "eval slug", 64);
slug_id!(SpecId, "spec id", 128);

/// A session identifier shared by all three session domains (run, spec,
/// review). Domain-specific generators ([`RunId::generate`],
/// [`ReviewId::generate`]) produce ids of the documented shape; validation
/// here only enforces the generic path-safety constraint (§8 property 2).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and construct a new [`SessionId`].
    ///
    /// # Errors
    /// Returns [`IdError`] if `s` is empty, contains a path separator, or a
    /// `..` traversal segment.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        if s.is_empty() || s.len() > 128 {
            return Err(IdError {
                kind: "session id",
                value: s,
                reason: "must be 1-128 characters".to_owned(),
            });
        }
        if s.contains('/') || s.contains('\\') || s.contains("..") {
            return Err(IdError {
                kind: "session id",
                value: s,
                reason: "must not contain '/', '\\', or '..'".to_owned(),
            });
        }
        Ok(Self(s))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

fn random_lowercase_alphanumeric(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// A run session id: `YYYYMMDD-HHMMSS-<5 lowercase alphanumerics>` (§4.7).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(SessionId);

impl RunId {
    /// Generate a new run id from a UTC timestamp already formatted as
    /// `YYYYMMDD-HHMMSS` by the caller (kept timestamp-source-agnostic so
    /// tests can supply deterministic values).
    #[must_use]
    pub fn generate(timestamp: &str) -> Self {
        let raw = format!("{timestamp}-{}", random_lowercase_alphanumeric(5));
        #[allow(clippy::unwrap_used)]
        Self(SessionId::new(raw).unwrap())
    }

    /// Parse an existing run id, validating its shape.
    ///
    /// # Errors
    /// Returns [`IdError`] if `s` does not match `YYYYMMDD-HHMMSS-xxxxx`.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        let parts: Vec<&str> = s.split('-').collect();
        let valid_shape = parts.len() == 3
            && parts[0].len() == 8
            && parts[0].bytes().all(|b| b.is_ascii_digit())
            && parts[1].len() == 6
            && parts[1].bytes().all(|b| b.is_ascii_digit())
            && parts[2].len() == 5
            && parts[2]
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !valid_shape {
            return Err(IdError {
                kind: "run id",
                value: s,
                reason: "must match YYYYMMDD-HHMMSS-xxxxx".to_owned(),
            });
        }
        Ok(Self(SessionId::new(s)?))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// View as a generic [`SessionId`].
    #[must_use]
    pub fn as_session_id(&self) -> &SessionId {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<String> for RunId {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0.into()
    }
}

/// A review session id, same generated shape as [`RunId`] but a distinct
/// type so review and run ids cannot be confused at compile time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReviewId(SessionId);

impl ReviewId {
    /// Generate a new review id from a UTC timestamp already formatted as
    /// `YYYYMMDD-HHMMSS`.
    #[must_use]
    pub fn generate(timestamp: &str) -> Self {
        let raw = format!("{timestamp}-{}", random_lowercase_alphanumeric(5));
        #[allow(clippy::unwrap_used)]
        Self(SessionId::new(raw).unwrap())
    }

    /// Parse an existing review id.
    ///
    /// # Errors
    /// Returns [`IdError`] on an invalid shape.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        Ok(Self(SessionId::new(s)?))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// View as a generic [`SessionId`].
    #[must_use]
    pub fn as_session_id(&self) -> &SessionId {
        &self.0
    }
}

impl fmt::Display for ReviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<String> for ReviewId {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ReviewId> for String {
    fn from(id: ReviewId) -> Self {
        id.0.into()
    }
}

/// A blinded review candidate alias: `r_` followed by ten lowercase
/// alphanumerics (§3).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateAlias(String);

impl CandidateAlias {
    /// Generate a fresh random alias.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("r_{}", random_lowercase_alphanumeric(10)))
    }

    /// Parse and validate an existing alias.
    ///
    /// # Errors
    /// Returns [`IdError`] if `s` is not `r_` followed by exactly ten
    /// lowercase alphanumerics.
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        let Some(rest) = s.strip_prefix("r_") else {
            return Err(IdError {
                kind: "candidate alias",
                value: s,
                reason: "must start with 'r_'".to_owned(),
            });
        };
        if rest.len() != 10 || !rest.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(IdError {
                kind: "candidate alias",
                value: s,
                reason: "must be 'r_' followed by exactly ten lowercase alphanumerics".to_owned(),
            });
        }
        Ok(Self(s))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CandidateAlias {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<CandidateAlias> for String {
    fn from(id: CandidateAlias) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_accepts_valid_slug() {
        assert!(AgentId::new("claude-fast").is_ok());
    }

    #[test]
    fn agent_id_rejects_uppercase() {
        assert!(AgentId::new("Claude-Fast").is_err());
    }

    #[test]
    fn agent_id_rejects_double_hyphen() {
        assert!(AgentId::new("claude--fast").is_err());
    }

    #[test]
    fn session_id_rejects_traversal() {
        assert!(SessionId::new("../escape").is_err());
        assert!(SessionId::new("a/b").is_err());
    }

    #[test]
    fn run_id_generate_has_expected_shape() {
        let id = RunId::generate("20260730-221500");
        let s = id.as_str();
        let parts: Vec<&str> = s.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "20260730");
        assert_eq!(parts[1], "221500");
        assert_eq!(parts[2].len(), 5);
    }

    #[test]
    fn run_id_rejects_bad_shape() {
        assert!(RunId::new("not-a-run-id").is_err());
        assert!(RunId::new("20260730-221500-toolong5").is_err());
    }

    #[test]
    fn candidate_alias_generate_roundtrips() {
        let alias = CandidateAlias::generate();
        assert!(alias.as_str().starts_with("r_"));
        assert_eq!(alias.as_str().len(), 12);
        assert!(CandidateAlias::new(alias.as_str().to_owned()).is_ok());
    }

    #[test]
    fn candidate_alias_rejects_wrong_length() {
        assert!(CandidateAlias::new("r_short").is_err());
    }

    #[test]
    fn ids_serde_roundtrip() {
        let id = AgentId::new("gpt-5-codex").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"gpt-5-codex\"");
        let decoded: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, id);
    }
}

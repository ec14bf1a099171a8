//! Connection definitions: the propagation policy and connection attributes
//! requested by one unit of work.
//!
//! Definitions are plain values. They are built per call site, either from
//! the predefined constants or from configuration via `serde`.
//!
//! # Configuration format
//!
//! ```json
//! { "name": "reports", "propagation": "REQUIRES_NEW", "isolation": "SERIALIZABLE",
//!   "read_only": true, "timeout_ms": 5000 }
//! ```
//!
//! Every field is optional. Enum values are case-insensitive and accept `-`
//! in place of `_`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// How a unit of work relates to a connection already in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Propagation {
    /// Reuse the connection in scope, or open one if there is none.
    #[default]
    Required,
    /// Reuse the connection in scope; fail if there is none.
    Mandatory,
    /// Suspend the connection in scope (if any) and open a new one.
    RequiresNew,
}

impl Propagation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::Mandatory => "MANDATORY",
            Self::RequiresNew => "REQUIRES_NEW",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "REQUIRED" => Ok(Self::Required),
            "MANDATORY" => Ok(Self::Mandatory),
            "REQUIRES_NEW" => Ok(Self::RequiresNew),
            _ => Err(ConnectionError::UnknownPropagation {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Propagation {
    type Error = ConnectionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Propagation> for String {
    fn from(value: Propagation) -> Self {
        value.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

/// Isolation level requested for the connection. Applied by the backend in
/// `setup_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Isolation {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::RepeatableRead => "REPEATABLE_READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Isolation {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "DEFAULT" => Ok(Self::Default),
            "READ_UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ_COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE_READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(ConnectionError::UnknownIsolation {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Isolation {
    type Error = ConnectionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Isolation> for String {
    fn from(value: Isolation) -> Self {
        value.as_str().to_string()
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_uppercase().replace('-', "_")
}

// ---------------------------------------------------------------------------
// ConnectionDefinition
// ---------------------------------------------------------------------------

/// Immutable description of the connection a unit of work needs.
///
/// `None` attributes mean "use the backend default".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDefinition {
    name: Option<String>,
    propagation: Propagation,
    isolation: Option<Isolation>,
    read_only: Option<bool>,
    #[serde(rename = "timeout_ms", with = "timeout_millis")]
    timeout: Option<Duration>,
}

impl ConnectionDefinition {
    /// `REQUIRED` with backend defaults for everything else.
    pub const DEFAULT: Self = Self::of(Propagation::Required);

    /// `REQUIRED`, read-only.
    pub const READ_ONLY: Self = Self {
        name: None,
        propagation: Propagation::Required,
        isolation: None,
        read_only: Some(true),
        timeout: None,
    };

    /// Definition with the given propagation and backend defaults.
    #[must_use]
    pub const fn of(propagation: Propagation) -> Self {
        Self {
            name: None,
            propagation,
            isolation: None,
            read_only: None,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn required() -> Self {
        Self::of(Propagation::Required)
    }

    #[must_use]
    pub const fn mandatory() -> Self {
        Self::of(Propagation::Mandatory)
    }

    #[must_use]
    pub const fn requires_new() -> Self {
        Self::of(Propagation::RequiresNew)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    #[must_use]
    pub fn isolation(&self) -> Option<Isolation> {
        self.isolation
    }

    #[must_use]
    pub fn is_read_only(&self) -> Option<bool> {
        self.read_only
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Copy with a different name.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self.clone()
        }
    }

    /// Copy with a different propagation.
    #[must_use]
    pub fn with_propagation(&self, propagation: Propagation) -> Self {
        Self {
            propagation,
            ..self.clone()
        }
    }

    /// Copy with a different isolation level.
    #[must_use]
    pub fn with_isolation(&self, isolation: Isolation) -> Self {
        Self {
            isolation: Some(isolation),
            ..self.clone()
        }
    }

    /// Copy with a different timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// Read-only copy.
    #[must_use]
    pub fn read_only(&self) -> Self {
        Self {
            read_only: Some(true),
            ..self.clone()
        }
    }
}

mod timeout_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::ref_option, clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_definitions() {
        assert_eq!(ConnectionDefinition::DEFAULT.propagation(), Propagation::Required);
        assert_eq!(ConnectionDefinition::DEFAULT.is_read_only(), None);
        assert_eq!(ConnectionDefinition::READ_ONLY.is_read_only(), Some(true));
        assert_eq!(ConnectionDefinition::mandatory().propagation(), Propagation::Mandatory);
        assert_eq!(
            ConnectionDefinition::requires_new().propagation(),
            Propagation::RequiresNew
        );
        assert_eq!(ConnectionDefinition::default(), ConnectionDefinition::DEFAULT);
    }

    #[test]
    fn builders_return_copies() {
        let base = ConnectionDefinition::required();
        let named = base
            .with_name("reports")
            .with_isolation(Isolation::Serializable)
            .with_timeout(Duration::from_secs(2))
            .read_only();

        assert_eq!(base, ConnectionDefinition::DEFAULT);
        assert_eq!(named.name(), Some("reports"));
        assert_eq!(named.isolation(), Some(Isolation::Serializable));
        assert_eq!(named.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(named.is_read_only(), Some(true));
        assert_eq!(named.propagation(), Propagation::Required);

        let nested = named.with_propagation(Propagation::RequiresNew);
        assert_eq!(nested.propagation(), Propagation::RequiresNew);
        assert_eq!(nested.name(), Some("reports"));
    }

    #[test]
    fn propagation_parses_loosely() {
        assert_eq!("REQUIRED".parse::<Propagation>().unwrap(), Propagation::Required);
        assert_eq!("mandatory".parse::<Propagation>().unwrap(), Propagation::Mandatory);
        assert_eq!(
            " requires-new ".parse::<Propagation>().unwrap(),
            Propagation::RequiresNew
        );
    }

    #[test]
    fn unknown_propagation_is_a_configuration_error() {
        let err = "NESTED".parse::<Propagation>().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::UnknownPropagation { ref value } if value == "NESTED"
        ));
        assert_eq!(err.to_string(), "unknown propagation: NESTED");
    }

    #[test]
    fn unknown_isolation_is_a_configuration_error() {
        let err = "SNAPSHOT".parse::<Isolation>().unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownIsolation { .. }));
    }

    #[test]
    fn display_matches_configuration_names() {
        assert_eq!(Propagation::RequiresNew.to_string(), "REQUIRES_NEW");
        assert_eq!(Isolation::RepeatableRead.to_string(), "REPEATABLE_READ");
    }

    #[test]
    fn deserializes_from_configuration() {
        let json = r#"{
            "name": "reports",
            "propagation": "requires_new",
            "isolation": "READ_COMMITTED",
            "read_only": true,
            "timeout_ms": 1500
        }"#;
        let def: ConnectionDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.name(), Some("reports"));
        assert_eq!(def.propagation(), Propagation::RequiresNew);
        assert_eq!(def.isolation(), Some(Isolation::ReadCommitted));
        assert_eq!(def.is_read_only(), Some(true));
        assert_eq!(def.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let def: ConnectionDefinition = serde_json::from_str("{}").unwrap();
        assert_eq!(def, ConnectionDefinition::DEFAULT);
    }

    #[test]
    fn unknown_propagation_fails_deserialization() {
        let err = serde_json::from_str::<ConnectionDefinition>(r#"{"propagation":"NEVER"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown propagation: NEVER"));
    }

    #[test]
    fn serializes_timeout_as_millis() {
        let def = ConnectionDefinition::mandatory().with_timeout(Duration::from_millis(250));
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["propagation"], "MANDATORY");
        assert_eq!(value["timeout_ms"], 250);
        assert!(value["isolation"].is_null());
    }
}

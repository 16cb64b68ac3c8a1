//! Identifier types.
//!
//! Session instances get random UUID ids. Content and quality identifiers
//! arrive from URLs and end up in directory names, so they are restricted to
//! a conservative character set at parse time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Generate a newtype ID wrapper over `Uuid`.
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Create a new random ID.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                /// First eight hex digits, for directory names and log lines.
                #[must_use]
                pub fn short(&self) -> String {
                    self.0.simple().to_string()[..8].to_string()
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

typed_id! {
    /// Identifier for one transcode session instance.
    SessionId,
}

/// Generate a validated string identifier.
macro_rules! name_id {
    ($($(#[doc = $doc:expr])* $name:ident => $label:literal),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(try_from = "String", into = "String")]
            pub struct $name(String);

            impl $name {
                /// Parse and validate an identifier.
                pub fn parse(raw: &str) -> Result<Self, Error> {
                    validate_name(raw, $label)?;
                    Ok(Self(raw.to_string()))
                }

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
                type Err = Error;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Self::parse(s)
                }
            }

            impl TryFrom<String> for $name {
                type Error = Error;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    validate_name(&value, $label)?;
                    Ok(Self(value))
                }
            }

            impl From<$name> for String {
                fn from(id: $name) -> Self {
                    id.0
                }
            }
        )+
    };
}

name_id! {
    /// Catalog identifier of a piece of content.
    ContentId => "content id",
    /// Identifier of a quality profile (e.g. "720p").
    QualityId => "quality id",
}

const MAX_NAME_LEN: usize = 128;

fn validate_name(raw: &str, label: &str) -> Result<(), Error> {
    if raw.is_empty() || raw.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "{label} must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    if raw.starts_with('.') {
        return Err(Error::Validation(format!("{label} must not start with '.'")));
    }
    let ok = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(Error::Validation(format!(
            "{label} '{raw}' contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SessionKey
// ---------------------------------------------------------------------------

/// Registry key: at most one live session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub content: ContentId,
    pub quality: QualityId,
}

impl SessionKey {
    pub fn new(content: ContentId, quality: QualityId) -> Self {
        Self { content, quality }
    }

    /// Parse both halves of a key from raw path segments.
    pub fn parse(content: &str, quality: &str) -> Result<Self, Error> {
        Ok(Self {
            content: ContentId::parse(content)?,
            quality: QualityId::parse(quality)?,
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.content, self.quality)
    }
}

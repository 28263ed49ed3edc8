//! Typed identifiers.
//!
//! Instance paths and channel names are structured strings; message IDs are
//! ULID-based for sortability and uniqueness.

use crate::{define_id, IdError};

// =============================================================================
// Messages
// =============================================================================

define_id!(MessageId, "msg");

// =============================================================================
// Instance Paths
// =============================================================================

/// Absolute path of an instance inside its application tree.
///
/// The first segment names the root ancestor, i.e. the scoped instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstancePath(String);

impl InstancePath {
    pub const SEPARATOR: char = '/';

    /// Builds the path of a root instance.
    pub fn root(name: &str) -> Result<Self, IdError> {
        validate_segment(name, name)?;
        Ok(Self(format!("/{name}")))
    }

    /// Parses an absolute path such as `/vm1/tomcat`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some(rest) = s.strip_prefix(Self::SEPARATOR) else {
            return Err(IdError::NotAbsolute(s.to_owned()));
        };

        for segment in rest.split(Self::SEPARATOR) {
            validate_segment(s, segment)?;
        }

        Ok(Self(s.to_owned()))
    }

    /// Path of a direct child of this instance.
    pub fn child(&self, name: &str) -> Result<Self, IdError> {
        validate_segment(&self.0, name)?;
        Ok(Self(format!("{}/{}", self.0, name)))
    }

    /// Path segments, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split(Self::SEPARATOR)
    }

    /// Name of the instance (last segment).
    pub fn name(&self) -> &str {
        self.0
            .rsplit(Self::SEPARATOR)
            .next()
            .unwrap_or_default()
    }

    /// Number of segments; roots have depth 1.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 1
    }

    /// Path of the parent instance, `None` for roots.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        self.0
            .rfind(Self::SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_owned()))
    }

    /// Path of the root ancestor (the scoped instance).
    pub fn scope(&self) -> Self {
        match self.segments().next() {
            Some(root) => Self(format!("/{root}")),
            None => self.clone(),
        }
    }

    /// True if `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &InstancePath) -> bool {
        self.0 == other.0
            || (self.0.starts_with(&other.0)
                && self.0[other.0.len()..].starts_with(Self::SEPARATOR))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_segment(path: &str, segment: &str) -> Result<(), IdError> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));

    if valid {
        Ok(())
    } else {
        Err(IdError::InvalidSegment {
            path: path.to_owned(),
            segment: segment.to_owned(),
        })
    }
}

impl std::fmt::Display for InstancePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for InstancePath {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstancePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstancePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Logical channel on the message bus.
///
/// Each scoped instance of an application has its own agent channel; agents
/// report back on their application's DM channel. The debug channel carries
/// echo messages addressed to the DM itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelId {
    Agent {
        application: String,
        scope: InstancePath,
    },
    Dm {
        application: String,
    },
    Debug,
}

impl ChannelId {
    /// Channel of the agent managing the scoped instance of `path`.
    pub fn agent(application: &str, path: &InstancePath) -> Self {
        Self::Agent {
            application: application.to_owned(),
            scope: path.scope(),
        }
    }

    /// Channel on which the DM listens for an application's notifications.
    pub fn dm(application: &str) -> Self {
        Self::Dm {
            application: application.to_owned(),
        }
    }

    pub fn application(&self) -> Option<&str> {
        match self {
            Self::Agent { application, .. } | Self::Dm { application } => Some(application),
            Self::Debug => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s == "dm" {
            return Ok(Self::Debug);
        }
        if let Some(application) = s.strip_prefix("dm:") {
            if application.is_empty() {
                return Err(IdError::InvalidChannel(s.to_owned()));
            }
            return Ok(Self::dm(application));
        }
        if let Some(rest) = s.strip_prefix("agent:") {
            let Some((application, scope)) = rest.split_once(':') else {
                return Err(IdError::InvalidChannel(s.to_owned()));
            };
            if application.is_empty() {
                return Err(IdError::InvalidChannel(s.to_owned()));
            }
            let scope = InstancePath::parse(scope)?;
            if !scope.is_root() {
                return Err(IdError::InvalidChannel(s.to_owned()));
            }
            return Ok(Self::Agent {
                application: application.to_owned(),
                scope,
            });
        }
        Err(IdError::InvalidChannel(s.to_owned()))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent { application, scope } => write!(f, "agent:{application}:{scope}"),
            Self::Dm { application } => write!(f, "dm:{application}"),
            Self::Debug => f.write_str("dm"),
        }
    }
}

impl std::str::FromStr for ChannelId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ChannelId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ChannelId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

//! Space identity
//!
//! A space is addressed by the triple `(peer, space type, space id)`. The
//! [`UniversalId`] is its string form and the only key used for lookups
//! across process boundaries:
//!
//! ```text
//! @peer(local);@type(workspace);@id(ws-1);
//! ```
//!
//! Inside a value `\` is written `\\` and `)` is written `\)`, so any triple
//! survives an encode/decode round trip.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage::error::{StoreError, StoreResult};

/// Database file name inside each space directory
pub const STORAGE_FILE_NAME: &str = "storage.db";

/// Kind of space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    /// A shared workspace
    Workspace,
    /// A per-user container holding a single document set
    Userspace,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Workspace => "workspace",
            SpaceType::Userspace => "userspace",
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(SpaceType::Workspace),
            "userspace" => Ok(SpaceType::Userspace),
            other => Err(format!("unknown space type '{}'", other)),
        }
    }
}

/// Decoded form of a [`UniversalId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceIdentity {
    /// Sync participant this store belongs to
    pub peer: String,
    pub space_type: SpaceType,
    pub space_id: String,
}

impl SpaceIdentity {
    pub fn new(peer: impl Into<String>, space_type: SpaceType, space_id: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            space_type,
            space_id: space_id.into(),
        }
    }

    /// Key under which storages of this space share one connection
    ///
    /// Built from the escaped universal id, so distinct triples never share.
    pub fn share_id(&self) -> String {
        format!("sqlite:{}", self.universal_id())
    }

    /// Location of this space's database under `base_dir`
    ///
    /// `<base>/<type>/<escaped id>__<escaped peer>/storage.db`. The id and
    /// peer are folded into a single directory name so spaces never nest.
    /// The escaped peer carries no `_`, so the last `__` always separates
    /// the two and distinct spaces get distinct directories.
    pub fn db_path(&self, base_dir: &Path) -> PathBuf {
        let dir_name = format!(
            "{}__{}",
            escape_filename(&self.space_id),
            escape_filename(&self.peer).replace('_', "=5F")
        );
        base_dir
            .join(self.space_type.as_str())
            .join(dir_name)
            .join(STORAGE_FILE_NAME)
    }

    pub fn universal_id(&self) -> UniversalId {
        UniversalId::from_identity(self.clone())
    }
}

/// Characters that are unsafe in a path component on some platform
const UNSAFE_FILENAME_CHARS: &str = "\\/!@#$%^&*()+~`\"':;,?<>|=";

/// Make `name` usable as a single path component
///
/// Unsafe characters and control characters become `=XX`, one per UTF-8
/// byte. Letters of any script, digits, `.`, `-` and `_` are kept. Since `=`
/// is escaped as well, different names never escape to the same string.
pub fn escape_filename(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_control() || UNSAFE_FILENAME_CHARS.contains(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                escaped.push_str(&format!("={:02X}", byte));
            }
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Canonical, serializable encoding of a [`SpaceIdentity`]
///
/// Parsing normalizes field order and escaping, so equality of two ids is
/// equality of the triples they decode to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniversalId {
    encoded: String,
    identity: SpaceIdentity,
}

impl UniversalId {
    pub fn from_identity(identity: SpaceIdentity) -> Self {
        let encoded = format!(
            "@peer({});@type({});@id({});",
            escape_value(&identity.peer),
            identity.space_type,
            escape_value(&identity.space_id)
        );
        Self { encoded, identity }
    }

    /// Decode a universal id string
    pub fn parse(input: &str) -> StoreResult<Self> {
        let invalid = |reason: String| StoreError::InvalidUniversalId {
            id: input.to_string(),
            reason,
        };

        let mut peer = None;
        let mut space_type = None;
        let mut space_id = None;

        let mut chars = input.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '@' {
                return Err(invalid(format!("expected '@', found '{}'", c)));
            }

            let mut key = String::new();
            loop {
                match chars.next() {
                    Some('(') => break,
                    Some(c) if c.is_ascii_alphanumeric() => key.push(c),
                    Some(c) => return Err(invalid(format!("invalid character '{}' in key", c))),
                    None => return Err(invalid("unterminated key".to_string())),
                }
            }

            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped @ ('\\' | ')')) => value.push(escaped),
                        _ => return Err(invalid("invalid escape sequence".to_string())),
                    },
                    Some(')') => break,
                    Some(c) => value.push(c),
                    None => return Err(invalid(format!("unterminated value for '{}'", key))),
                }
            }
            // Trailing ';' after each part is optional
            if chars.peek() == Some(&';') {
                chars.next();
            }

            if value.is_empty() {
                return Err(invalid(format!("empty value for '{}'", key)));
            }

            let slot = match key.as_str() {
                "peer" => &mut peer,
                "type" => &mut space_type,
                "id" => &mut space_id,
                other => return Err(invalid(format!("unknown key '{}'", other))),
            };
            if slot.replace(value).is_some() {
                return Err(invalid(format!("duplicate key '{}'", key)));
            }
        }

        let peer = peer.ok_or_else(|| invalid("missing peer".to_string()))?;
        let space_type = space_type
            .ok_or_else(|| invalid("missing type".to_string()))?
            .parse::<SpaceType>()
            .map_err(invalid)?;
        let space_id = space_id.ok_or_else(|| invalid("missing id".to_string()))?;

        Ok(Self::from_identity(SpaceIdentity {
            peer,
            space_type,
            space_id,
        }))
    }

    pub fn identity(&self) -> &SpaceIdentity {
        &self.identity
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace(')', "\\)")
}

impl fmt::Display for UniversalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for UniversalId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SpaceIdentity> for UniversalId {
    fn from(identity: SpaceIdentity) -> Self {
        Self::from_identity(identity)
    }
}

impl Serialize for UniversalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for UniversalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

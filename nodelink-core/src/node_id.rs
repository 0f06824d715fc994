//! Node identity.
//!
//! A [`NodeId`] has two parts: a persistent *instance id* naming the
//! installation, and a *session part* generated on every start. Together they
//! form the instance session id, which is what equality is based on, so a
//! restarted node is a different node for every purpose except
//! [`NodeId::is_same_instance_as`].

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of hex characters in the instance id part.
pub const INSTANCE_ID_LENGTH: usize = 32;

/// Number of hex characters in the session part.
pub const SESSION_PART_LENGTH: usize = 10;

const SEPARATOR: &str = "::";

/// Error parsing a node id from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeIdParseError {
    /// The `instance::session` separator is missing.
    #[error("missing '::' separator in node id '{input}'")]
    MissingSeparator {
        /// The rejected input.
        input: String,
    },

    /// One of the parts has the wrong length or non-hex characters.
    #[error("invalid {part} part '{value}' (expected {expected_len} lowercase hex characters)")]
    InvalidPart {
        /// Which part was rejected.
        part: &'static str,
        /// The rejected text.
        value: String,
        /// Required length of the part.
        expected_len: usize,
    },
}

/// Identity of one running node instance.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    instance_id: String,
    session_part: String,
}

impl NodeId {
    /// Generate a fresh random node id.
    pub fn generate() -> Self {
        Self {
            instance_id: random_hex(INSTANCE_ID_LENGTH),
            session_part: random_hex(SESSION_PART_LENGTH),
        }
    }

    /// Create the id of a new session (restart) of the same instance.
    pub fn new_session(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            session_part: random_hex(SESSION_PART_LENGTH),
        }
    }

    /// The persistent instance part.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The full instance session id, i.e. the string form.
    pub fn session_id_string(&self) -> String {
        self.to_string()
    }

    /// Whether both ids belong to the same installation, regardless of session.
    pub fn is_same_instance_as(&self, other: &NodeId) -> bool {
        self.instance_id == other.instance_id
    }
}

fn random_hex(len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| HEX[rng.random_range(0..16)] as char)
        .collect()
}

fn check_part(
    part: &'static str,
    value: &str,
    expected_len: usize,
) -> Result<(), NodeIdParseError> {
    let valid = value.len() == expected_len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return Err(NodeIdParseError::InvalidPart {
            part,
            value: value.to_string(),
            expected_len,
        });
    }
    Ok(())
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (instance_id, session_part) =
            s.split_once(SEPARATOR)
                .ok_or_else(|| NodeIdParseError::MissingSeparator {
                    input: s.to_string(),
                })?;
        check_part("instance", instance_id, INSTANCE_ID_LENGTH)?;
        check_part("session", session_part, SESSION_PART_LENGTH)?;
        Ok(Self {
            instance_id: instance_id.to_string(),
            session_part: session_part.to_string(),
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.instance_id, SEPARATOR, self.session_part)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique_and_parseable() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);

        let parsed: NodeId = a.to_string().parse().expect("parse generated id");
        assert_eq!(parsed, a);
        assert_eq!(a.instance_id().len(), INSTANCE_ID_LENGTH);
    }

    #[test]
    fn test_restart_creates_distinct_session_of_same_instance() {
        let first = NodeId::generate();
        let restarted = first.new_session();

        assert_ne!(first, restarted);
        assert!(first.is_same_instance_as(&restarted));
        assert!(!first.is_same_instance_as(&NodeId::generate()));
    }

    #[test]
    fn test_equality_follows_session_id() {
        let id = NodeId::generate();
        let copy: NodeId = id.session_id_string().parse().expect("parse");

        let mut set = HashSet::new();
        set.insert(id.clone());
        assert!(set.contains(&copy));
    }

    #[test]
    fn test_parse_rejects_invalid_forms() {
        assert!(matches!(
            "abc".parse::<NodeId>(),
            Err(NodeIdParseError::MissingSeparator { .. })
        ));
        let bad_instance = format!("{}::{}", "x".repeat(32), "0".repeat(10));
        assert!(matches!(
            bad_instance.parse::<NodeId>(),
            Err(NodeIdParseError::InvalidPart { part: "instance", .. })
        ));
        let bad_session = format!("{}::{}", "0".repeat(32), "0".repeat(9));
        assert!(matches!(
            bad_session.parse::<NodeId>(),
            Err(NodeIdParseError::InvalidPart { part: "session", .. })
        ));
    }

    #[test]
    fn test_serde_string_form() {
        let id = NodeId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id));
        let back: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}

//! Transport-agnostic node addresses.
//!
//! A [`ContactPoint`] names the transport to use and where to reach a node:
//!
//! ```text
//! virtual:node-a:1(role=relay,region=eu)
//! ^^^^^^^ ^^^^^^ ^ ^^^^^^^^^^^^^^^^^^^^^
//! id      host   port  optional attributes
//! ```
//!
//! Whitespace around every token is ignored, and an attribute written without
//! `=value` gets the empty string as its value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error parsing a contact point from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContactPointParseError {
    /// The input was empty or whitespace only.
    #[error("empty contact point")]
    Empty,

    /// The transport id is missing or contains invalid characters.
    #[error("invalid transport id: '{value}'")]
    InvalidTransportId {
        /// The rejected transport id.
        value: String,
    },

    /// The host is missing or contains invalid characters.
    #[error("invalid host: '{value}'")]
    InvalidHost {
        /// The rejected host.
        value: String,
    },

    /// The port is missing, non-numeric or out of range.
    #[error("invalid port: '{value}'")]
    InvalidPort {
        /// The rejected port text.
        value: String,
    },

    /// The attribute list is not enclosed in a single pair of parentheses.
    #[error("malformed attribute list in '{input}'")]
    MalformedAttributes {
        /// The full input that was rejected.
        input: String,
    },

    /// One attribute entry has an empty key.
    #[error("invalid attribute entry: '{entry}'")]
    InvalidAttribute {
        /// The rejected entry.
        entry: String,
    },
}

/// Transport-qualified network address of a node.
///
/// # Examples
///
/// ```
/// use nodelink_core::ContactPoint;
///
/// let cp: ContactPoint = " tcp : 127.0.0.1 : 21000 ( tls , name = main ) "
///     .parse()
///     .expect("parse");
/// assert_eq!(cp.transport_id(), "tcp");
/// assert_eq!(cp.port(), 21000);
/// assert_eq!(cp.attribute("tls"), Some(""));
/// assert_eq!(cp.attribute("name"), Some("main"));
///
/// let again: ContactPoint = cp.to_string().parse().expect("reparse");
/// assert_eq!(again, cp);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContactPoint {
    transport_id: String,
    host: String,
    port: u16,
    attributes: BTreeMap<String, String>,
}

impl ContactPoint {
    /// Create a contact point without attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport id or host is empty or contains
    /// characters that cannot appear in the string form.
    pub fn new(
        transport_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, ContactPointParseError> {
        let transport_id = transport_id.into();
        let host = host.into();
        validate_transport_id(&transport_id)?;
        validate_host(&host)?;
        Ok(Self {
            transport_id,
            host,
            port,
            attributes: BTreeMap::new(),
        })
    }

    /// Return a copy with the given attribute set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAttribute` if the key is empty, or if key or value
    /// contain `,`, `=`, `(` or `)` or start or end with whitespace. Such
    /// attributes would not survive a format and parse round trip.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ContactPointParseError> {
        let (key, value) = (key.into(), value.into());
        validate_attribute(&key, &value)?;
        self.attributes.insert(key, value);
        Ok(self)
    }

    /// Return a copy with a different port, keeping all attributes.
    ///
    /// Used when a server binds to port 0 and reports the port it got.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The transport id selecting the transport provider.
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Look up one attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// All attributes, sorted by key.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// `host:port`, the part a socket-based transport connects to.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn validate_transport_id(value: &str) -> Result<(), ContactPointParseError> {
    if value.is_empty() || !value.chars().all(is_token_char) {
        return Err(ContactPointParseError::InvalidTransportId {
            value: value.to_string(),
        });
    }
    Ok(())
}

fn validate_host(value: &str) -> Result<(), ContactPointParseError> {
    let forbidden = |c: char| c.is_whitespace() || matches!(c, ':' | '(' | ')' | ',' | '=');
    if value.is_empty() || value.chars().any(forbidden) {
        return Err(ContactPointParseError::InvalidHost {
            value: value.to_string(),
        });
    }
    Ok(())
}

fn validate_attribute(key: &str, value: &str) -> Result<(), ContactPointParseError> {
    let reserved = |c: char| matches!(c, ',' | '=' | '(' | ')');
    let clean = |text: &str| !text.chars().any(reserved) && text.trim() == text;
    if key.is_empty() || !clean(key) || !clean(value) {
        return Err(ContactPointParseError::InvalidAttribute {
            entry: format!("{key}={value}"),
        });
    }
    Ok(())
}

fn parse_attributes(list: &str) -> Result<BTreeMap<String, String>, ContactPointParseError> {
    let mut attributes = BTreeMap::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry, ""),
        };
        if key.is_empty() || value.contains('=') {
            return Err(ContactPointParseError::InvalidAttribute {
                entry: entry.to_string(),
            });
        }
        attributes.insert(key.to_string(), value.to_string());
    }
    Ok(attributes)
}

impl FromStr for ContactPoint {
    type Err = ContactPointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ContactPointParseError::Empty);
        }

        let malformed = || ContactPointParseError::MalformedAttributes {
            input: trimmed.to_string(),
        };
        let (address, attribute_list) = match trimmed.find('(') {
            Some(open) => {
                let inner = trimmed[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
                if inner.contains('(') || inner.contains(')') {
                    return Err(malformed());
                }
                (&trimmed[..open], Some(inner))
            }
            None if trimmed.contains(')') => return Err(malformed()),
            None => (trimmed, None),
        };

        let mut parts = address.splitn(3, ':');
        let transport_id = parts.next().unwrap_or_default().trim();
        validate_transport_id(transport_id)?;
        let host = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| ContactPointParseError::InvalidHost {
                value: String::new(),
            })?;
        validate_host(host)?;
        let port_text = parts.next().map(str::trim).unwrap_or_default();
        let port = port_text
            .parse::<u16>()
            .map_err(|_| ContactPointParseError::InvalidPort {
                value: port_text.to_string(),
            })?;

        let attributes = match attribute_list {
            Some(list) => parse_attributes(list)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            transport_id: transport_id.to_string(),
            host: host.to_string(),
            port,
            attributes,
        })
    }
}

impl fmt::Display for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport_id, self.host, self.port)?;
        if !self.attributes.is_empty() {
            f.write_str("(")?;
            for (i, (key, value)) in self.attributes.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}={}", key, value)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ContactPoint {
    type Error = ContactPointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContactPoint> for String {
    fn from(value: ContactPoint) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ContactPoint {
        s.parse().expect("valid contact point")
    }

    #[test]
    fn test_parse_minimal() {
        let cp = parse("virtual:node-a:1");
        assert_eq!(cp.transport_id(), "virtual");
        assert_eq!(cp.host(), "node-a");
        assert_eq!(cp.port(), 1);
        assert!(cp.attributes().is_empty());
        assert_eq!(cp.to_string(), "virtual:node-a:1");
    }

    #[test]
    fn test_parse_trims_whitespace_everywhere() {
        let cp = parse("  tcp :  10.0.0.1 :21000  (  a = 1 ,b=  two words  )  ");
        assert_eq!(cp.transport_id(), "tcp");
        assert_eq!(cp.host(), "10.0.0.1");
        assert_eq!(cp.port(), 21000);
        assert_eq!(cp.attribute("a"), Some("1"));
        assert_eq!(cp.attribute("b"), Some("two words"));
    }

    #[test]
    fn test_key_without_value_gets_empty_string() {
        let cp = parse("activemq-tcp:host:61616(relay,name=x)");
        assert_eq!(cp.attribute("relay"), Some(""));
        assert_eq!(cp.attribute("name"), Some("x"));
    }

    #[test]
    fn test_empty_attribute_list_and_trailing_comma() {
        assert!(parse("tcp:h:1()").attributes().is_empty());
        assert_eq!(parse("tcp:h:1(a=1,)").attributes().len(), 1);
    }

    #[test]
    fn test_format_round_trip_preserves_attributes() {
        let inputs = [
            "tcp:localhost:0",
            "virtual:n1:65535(x=1)",
            " virtual : n1 : 7 ( b = 2 , a , c= ) ",
            "ssh-uplink:remote.example.org:31005(user=alice,keyfile=/home/alice/.ssh/id)",
        ];
        for input in inputs {
            let cp = parse(input);
            let reparsed = parse(&cp.to_string());
            assert_eq!(reparsed, cp, "round trip failed for {}", input);
        }
    }

    #[test]
    fn test_rejects_malformed_input() {
        let cases: [(&str, fn(&ContactPointParseError) -> bool); 8] = [
            ("", |e| matches!(e, ContactPointParseError::Empty)),
            (":host:1", |e| {
                matches!(e, ContactPointParseError::InvalidTransportId { .. })
            }),
            ("tcp", |e| matches!(e, ContactPointParseError::InvalidHost { .. })),
            ("tcp::1", |e| matches!(e, ContactPointParseError::InvalidHost { .. })),
            ("tcp:host", |e| matches!(e, ContactPointParseError::InvalidPort { .. })),
            ("tcp:host:70000", |e| {
                matches!(e, ContactPointParseError::InvalidPort { .. })
            }),
            ("tcp:host:1(a=1", |e| {
                matches!(e, ContactPointParseError::MalformedAttributes { .. })
            }),
            ("tcp:host:1(=v)", |e| {
                matches!(e, ContactPointParseError::InvalidAttribute { .. })
            }),
        ];
        for (input, check) in cases {
            let err = input
                .parse::<ContactPoint>()
                .expect_err(&format!("'{}' must be rejected", input));
            assert!(check(&err), "unexpected error for '{}': {:?}", input, err);
        }
    }

    #[test]
    fn test_new_validates_fields() {
        assert!(ContactPoint::new("", "h", 1).is_err());
        assert!(ContactPoint::new("tcp", "bad host", 1).is_err());
        let cp = ContactPoint::new("tcp", "h", 1)
            .expect("valid")
            .with_attribute("k", "v")
            .expect("valid attribute");
        assert_eq!(cp.to_string(), "tcp:h:1(k=v)");
        assert_eq!(cp.socket_address(), "h:1");
    }

    #[test]
    fn test_with_attribute_rejects_what_would_not_reparse() {
        let base = ContactPoint::new("tcp", "h", 1).expect("valid");
        let rejected = [
            ("servers", "a,b"),
            ("k", "x=y"),
            ("k", "(x)"),
            ("k", " padded"),
            ("k", "padded "),
            ("a,b", "v"),
            ("", "v"),
            (" k", "v"),
        ];
        for (key, value) in rejected {
            let err = base
                .clone()
                .with_attribute(key, value)
                .expect_err(&format!("'{}={}' must be rejected", key, value));
            assert!(matches!(err, ContactPointParseError::InvalidAttribute { .. }));
        }

        let cp = base
            .with_attribute("servers", "a;b")
            .and_then(|cp| cp.with_attribute("path", "/var/lib/node data"))
            .and_then(|cp| cp.with_attribute("flag", ""))
            .expect("valid attributes");
        assert_eq!(parse(&cp.to_string()), cp);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let cp = parse("virtual:n:3(k=v)");
        let json = serde_json::to_string(&cp).expect("serialize");
        assert_eq!(json, r#""virtual:n:3(k=v)""#);
        let back: ContactPoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cp);
    }
}

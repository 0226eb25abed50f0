//! Secret handling for instance credentials.
//!
//! Instance parameters carry API keys, passwords and client secrets. They are
//! held in a [`SecureString`] whose buffer is zeroized on drop and which never
//! prints its contents through `Debug`, `Display` or `Serialize`.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

const REDACTED: &str = "[REDACTED]";

/// A string secret that is cleared from memory when dropped.
///
/// Deserializes from either a plain string or a host credentials object
/// (`{"identifier": "...", "password": "..."}`), in which case the password
/// is kept.
///
/// ```
/// use sp_connectors::SecureString;
///
/// let secret: SecureString = serde_json::from_str(r#"{"identifier": "svc", "password": "pw"}"#).unwrap();
/// assert_eq!(secret.expose_secret(), "pw");
/// assert_eq!(format!("{:?}", secret), "SecureString([REDACTED])");
/// ```
#[derive(Clone, Default)]
pub struct SecureString(Zeroizing<String>);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(Zeroizing::new(s))
    }

    /// Exposes the secret for building a request.
    ///
    /// Copies made from the returned slice are not zeroized.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString({})", REDACTED)
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl PartialEq for SecureString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SecureString {}

impl Serialize for SecureString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SecretVisitor;

        impl<'de> Visitor<'de> for SecretVisitor {
            type Value = SecureString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a secret string or a credentials object with a password")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(SecureString::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(SecureString::new(v))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut password = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "password" {
                        password = Some(map.next_value::<String>()?);
                    } else {
                        map.next_value::<de::IgnoredAny>()?;
                    }
                }
                password
                    .map(SecureString::new)
                    .ok_or_else(|| de::Error::missing_field("password"))
            }
        }

        deserializer.deserialize_any(SecretVisitor)
    }
}

/// A username/password pair as configured on an instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub password: SecureString,
}

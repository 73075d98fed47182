//! Scheme-prefixed contact identities.
//!
//! A URN is `scheme:path` with an optional `#display` suffix, e.g.
//! `tel:+250788383383`, `telegram:12345#nick`. Construction canonicalizes:
//! the scheme is lowercased, telephone paths are normalized toward E.164
//! using the owning channel's country, and unknown schemes are rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schemes the gateway routes.
pub const SCHEMES: &[&str] = &[
    "tel",
    "telegram",
    "whatsapp",
    "viber",
    "facebook",
    "instagram",
    "line",
    "vk",
    "discord",
    "slack",
    "email",
    "webchat",
    "ext",
];

/// Calling codes for countries the gateway's channels declare.
///
/// Local numbers are only rewritten when the channel country appears here;
/// anything else passes through with formatting stripped.
const DIAL_CODES: &[(&str, &str)] = &[
    ("US", "1"),
    ("CA", "1"),
    ("GB", "44"),
    ("FR", "33"),
    ("DE", "49"),
    ("ES", "34"),
    ("IT", "39"),
    ("BR", "55"),
    ("MX", "52"),
    ("IN", "91"),
    ("ID", "62"),
    ("NG", "234"),
    ("KE", "254"),
    ("TZ", "255"),
    ("UG", "256"),
    ("RW", "250"),
    ("ZA", "27"),
    ("EC", "593"),
    ("PH", "63"),
    ("AU", "61"),
];

/// URN construction failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrnError {
    /// The scheme is not one the gateway routes.
    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    /// The path portion is empty.
    #[error("empty path")]
    EmptyPath,

    /// The string has no `scheme:path` shape.
    #[error("invalid URN '{0}'")]
    Malformed(String),
}

/// A canonicalized contact identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Build a URN from scheme and path, canonicalizing both.
    pub fn new(scheme: &str, path: &str) -> Result<Self, UrnError> {
        Self::with_display(scheme, path, None)
    }

    /// Build a URN with an optional display portion.
    pub fn with_display(scheme: &str, path: &str, display: Option<&str>) -> Result<Self, UrnError> {
        let scheme = scheme.to_ascii_lowercase();
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(UrnError::InvalidScheme(scheme));
        }
        if path.is_empty() {
            return Err(UrnError::EmptyPath);
        }
        let urn = match display {
            Some(d) if !d.is_empty() => format!("{scheme}:{path}#{d}"),
            _ => format!("{scheme}:{path}"),
        };
        Ok(Urn(urn))
    }

    /// Parse a serialized URN, revalidating the scheme.
    pub fn parse(value: &str) -> Result<Self, UrnError> {
        let (scheme, rest) = value
            .split_once(':')
            .ok_or_else(|| UrnError::Malformed(value.to_string()))?;
        let (path, display) = match rest.split_once('#') {
            Some((p, d)) => (p, Some(d)),
            None => (rest, None),
        };
        Self::with_display(scheme, path, display)
    }

    /// Build a telephone URN, normalizing toward E.164.
    ///
    /// `country` is the ISO-2 country of the channel the number was seen on.
    pub fn from_tel(number: &str, country: &str) -> Result<Self, UrnError> {
        let normalized = normalize_tel(number, country);
        if normalized.is_empty() {
            return Err(UrnError::EmptyPath);
        }
        Self::new("tel", &normalized)
    }

    /// The URN scheme.
    pub fn scheme(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// The path portion, without scheme or display.
    pub fn path(&self) -> &str {
        let rest = self.0.split_once(':').map(|(_, r)| r).unwrap_or_default();
        rest.split('#').next().unwrap_or_default()
    }

    /// The display portion, if any.
    pub fn display(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, d)| d)
    }

    /// The full serialized form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip formatting and attach the country calling code where we can.
///
/// Numbers already carrying `+` (or `00`) keep their prefix untouched.
fn normalize_tel(number: &str, country: &str) -> String {
    let has_plus = number.trim_start().starts_with('+');
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();

    if has_plus {
        return format!("+{digits}");
    }
    if let Some(rest) = digits.strip_prefix("00") {
        return format!("+{rest}");
    }

    let Some(dial) = DIAL_CODES
        .iter()
        .find(|(c, _)| *c == country.to_ascii_uppercase())
        .map(|(_, d)| *d)
    else {
        return digits;
    };

    // A number already carrying its country code just needs the plus.
    if digits.starts_with(dial) && digits.len() >= dial.len() + 9 {
        return format!("+{digits}");
    }
    if (7..=12).contains(&digits.len()) {
        return format!("+{dial}{digits}");
    }
    digits
}

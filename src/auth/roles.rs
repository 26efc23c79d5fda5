use std::fmt;
use std::str::FromStr;

use x509_parser::der_parser::asn1_rs::{Any, FromDer, Tag};

/// Certificate extension carrying the caller's comma-separated role list.
pub const ROLE_EXTENSION_OID: &str = "1.2.840.10070.8.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Exempt from per-job ownership checks.
    Admin,
    User,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

/// Splits a raw role extension value into role names.
///
/// The value is normally a DER string (UTF8String, PrintableString or
/// IA5String) whose content is the list. Anything else is read as text with
/// non-printable bytes stripped from both ends. Empty entries are dropped.
pub fn parse_roles(raw: &[u8]) -> Vec<String> {
    let content = der_string_content(raw).unwrap_or(raw);
    String::from_utf8_lossy(content)
        .trim_matches(|c: char| {
            c.is_control() || c.is_whitespace() || c == char::REPLACEMENT_CHARACTER
        })
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

/// Content octets of a DER string, if `raw` is exactly one such value.
fn der_string_content(raw: &[u8]) -> Option<&[u8]> {
    let (rest, any) = Any::from_der(raw).ok()?;
    let is_string = matches!(
        any.tag(),
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String
    );
    (is_string && rest.is_empty()).then_some(any.data)
}

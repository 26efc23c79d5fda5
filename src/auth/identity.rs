use x509_parser::prelude::*;

use crate::auth::roles::{parse_roles, Role, ROLE_EXTENSION_OID};
use crate::auth::AuthError;

/// Caller identity taken from a verified client certificate: the subject
/// common name and the roles listed in the role extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub roles: Vec<Role>,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            name: name.into(),
            roles: roles.into_iter().collect(),
        }
    }

    /// Reads the identity from a DER encoded end-entity certificate.
    ///
    /// Chain verification is the TLS layer's job; this only extracts fields.
    /// Unknown role names are ignored.
    pub fn from_der(der: &[u8]) -> Result<Self, AuthError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| AuthError::InvalidCertificate(e.to_string()))?;

        let name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .ok_or(AuthError::MissingCommonName)?
            .to_string();

        let roles = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == ROLE_EXTENSION_OID)
            .map(|ext| parse_roles(ext.value))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|role| match role.parse::<Role>() {
                Ok(role) => Some(role),
                Err(e) => {
                    tracing::debug!(caller = %name, error = %e, "Ignoring role");
                    None
                }
            })
            .collect();

        Ok(Self { name, roles })
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    pub fn has_any_role(&self, allowed: &[Role]) -> bool {
        self.roles.iter().any(|role| allowed.contains(role))
    }
}

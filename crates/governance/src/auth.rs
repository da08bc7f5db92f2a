//! API key authentication.
//!
//! Credentials are compared in constant time so response latency does not
//! reveal how many leading bytes of a guess were right.

use secrecy::{ExposeSecret, Secret};
use subtle::ConstantTimeEq;

use knowledge_hub_core::config::AuthConfig;
use knowledge_hub_core::{AuthContext, Error, Result, Role};

/// Subject recorded for the regular service key.
pub const SERVICE_SUBJECT: &str = "api-key";
/// Subject recorded for the admin key.
pub const ADMIN_SUBJECT: &str = "admin-api-key";

/// Checks the `X-API-Key` credential against the configured secrets.
pub struct ApiKeyAuthenticator {
    api_key: Option<Secret<String>>,
    admin_api_key: Option<Secret<String>>,
}

impl ApiKeyAuthenticator {
    /// Create an authenticator for a single service key.
    pub fn new(api_key: Option<Secret<String>>) -> Self {
        Self {
            api_key,
            admin_api_key: None,
        }
    }

    /// Also accept an admin key granting [`Role::Admin`].
    pub fn with_admin_key(mut self, key: Secret<String>) -> Self {
        self.admin_api_key = Some(key);
        self
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        if config.api_key.is_none() {
            tracing::warn!("auth.api_key is not configured; every request will be rejected");
        }
        Self {
            api_key: config.api_key.clone(),
            admin_api_key: config.admin_api_key.clone(),
        }
    }

    /// Whether a service key has been configured at all.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Resolve a presented credential to an [`AuthContext`].
    ///
    /// Missing and mismatched credentials are both `Unauthorized`. An
    /// unconfigured service key rejects everything.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<AuthContext> {
        let Some(expected) = self.api_key.as_ref() else {
            tracing::error!("API key authentication is not configured on the server");
            return Err(Error::unauthorized("authentication is not configured"));
        };

        let Some(presented) = credential.filter(|c| !c.is_empty()) else {
            tracing::warn!("Request rejected: missing API key");
            return Err(Error::unauthorized("missing API key"));
        };

        // Evaluate both keys unconditionally.
        let is_service = constant_time_eq(presented, expected);
        let is_admin = self
            .admin_api_key
            .as_ref()
            .map(|admin| constant_time_eq(presented, admin))
            .unwrap_or(false);

        if is_admin {
            Ok(AuthContext {
                subject: ADMIN_SUBJECT.to_string(),
                role: Role::Admin,
            })
        } else if is_service {
            Ok(AuthContext {
                subject: SERVICE_SUBJECT.to_string(),
                role: Role::User,
            })
        } else {
            tracing::warn!("Request rejected: invalid API key");
            Err(Error::unauthorized("invalid API key"))
        }
    }
}

fn constant_time_eq(presented: &str, expected: &Secret<String>) -> bool {
    presented
        .as_bytes()
        .ct_eq(expected.expose_secret().as_bytes())
        .into()
}

/// Require that an authenticated caller holds `required`. Admin satisfies any role.
pub fn require_role(ctx: &AuthContext, required: Role) -> Result<()> {
    if ctx.role.satisfies(required) {
        Ok(())
    } else {
        tracing::warn!(
            subject = %ctx.subject,
            role = %ctx.role,
            required = %required,
            "Permission denied"
        );
        Err(Error::forbidden(format!("requires role '{}'", required)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> ApiKeyAuthenticator {
        ApiKeyAuthenticator::new(Some(Secret::new("s3cret-key".to_string())))
            .with_admin_key(Secret::new("admin-key".to_string()))
    }

    #[test]
    fn test_valid_key() {
        let ctx = authenticator().authenticate(Some("s3cret-key")).unwrap();
        assert_eq!(ctx.role, Role::User);
        assert_eq!(ctx.subject, SERVICE_SUBJECT);
    }

    #[test]
    fn test_admin_key() {
        let ctx = authenticator().authenticate(Some("admin-key")).unwrap();
        assert_eq!(ctx.role, Role::Admin);
    }

    #[test]
    fn test_missing_and_wrong_keys() {
        let auth = authenticator();
        assert!(matches!(auth.authenticate(None), Err(Error::Unauthorized(_))));
        assert!(matches!(auth.authenticate(Some("")), Err(Error::Unauthorized(_))));
        assert!(matches!(auth.authenticate(Some("s3cret-kez")), Err(Error::Unauthorized(_))));
        assert!(matches!(
            auth.authenticate(Some("s3cret-key-longer")),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_unconfigured_rejects_everything() {
        let auth = ApiKeyAuthenticator::new(None);
        assert!(!auth.is_configured());
        assert!(matches!(auth.authenticate(Some("anything")), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_require_role() {
        let admin = AuthContext {
            subject: ADMIN_SUBJECT.into(),
            role: Role::Admin,
        };
        let user = AuthContext {
            subject: SERVICE_SUBJECT.into(),
            role: Role::User,
        };
        assert!(require_role(&admin, Role::Analyst).is_ok());
        assert!(require_role(&user, Role::User).is_ok());
        assert!(matches!(require_role(&user, Role::Admin), Err(Error::Forbidden(_))));
    }
}

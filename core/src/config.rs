//! Environment-driven configuration, in the same shape the teacher
//! crate uses: one env var per field, `.context(...)` on anything that
//! must parse, and a default wherever the spec allows one. `JWT_SECRET`
//! and `NETWORK_INTEGRITY_KEYPHRASE` have *no* default — startup must
//! fail without them.

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    /// "Local-dev precedence": these environments force localhost
    /// service URLs regardless of env-var overrides.
    pub fn is_local_dev(&self) -> bool {
        matches!(self, Environment::Development | Environment::Test)
    }

    fn parse(raw: &str) -> Environment {
        match raw {
            "production" => Environment::Production,
            "test" => Environment::Test,
            // "development", "dev", unset, or anything unrecognised
            // defaults to development rather than silently running
            // with production posture.
            _ => Environment::Development,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub network_integrity_keyphrase: Option<String>,
    pub allowed_origins: Vec<String>,
    pub service_api_key: Option<String>,
    pub super_admin_emails: Vec<String>,
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub environment: Environment,
    pub apex_domain: String,
}

const MIN_JWT_SECRET_LEN: usize = 32;

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::parse(
            &std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),
        );

        let jwt_secret =
            std::env::var("JWT_SECRET").context("JWT_SECRET is required and must be set")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes");
        }

        let network_integrity_keyphrase = std::env::var("NETWORK_INTEGRITY_KEYPHRASE").ok();

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let super_admin_emails = std::env::var("SUPER_ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            jwt_secret,
            network_integrity_keyphrase,
            allowed_origins,
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            super_admin_emails,
            email_api_key: std::env::var("EMAIL_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").unwrap_or_else(|_| "no-reply@idling.app".into()),
            environment,
            apex_domain: std::env::var("APEX_DOMAIN").unwrap_or_else(|_| "idling.app".into()),
        })
    }

    /// Test mode may echo the OTP value only when both conditions hold.
    pub fn may_echo_otp_in_response(&self) -> bool {
        self.environment.is_local_dev()
            && self
                .email_api_key
                .as_deref()
                .map(|k| k.starts_with("test_"))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_dev_precedence() {
        assert!(Environment::Development.is_local_dev());
        assert!(Environment::Test.is_local_dev());
        assert!(!Environment::Production.is_local_dev());
    }
}

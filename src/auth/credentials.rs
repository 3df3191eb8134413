//! Credential types and format validation
//!
//! Credentials are rejected at client build time when they cannot possibly
//! authenticate, so misconfiguration never surfaces as a failed first
//! request.

use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{ClientError, Result};

/// Username/password pair exchanged for a bearer token.
#[derive(Debug, Clone, Validate)]
pub struct BasicCredentials {
    #[validate(length(min = 1, message = "username must not be empty"))]
    pub username: String,
    #[validate(length(min = 8, message = "password must be at least 8 characters"))]
    pub password: String,
}

/// OAuth2 client-credentials grant material.
#[derive(Debug, Clone, Validate)]
pub struct OAuthCredentials {
    #[validate(custom(function = validate_client_id))]
    pub client_id: String,
    #[validate(custom(function = validate_client_secret))]
    pub client_secret: String,
    pub scope: Option<String>,
}

fn validate_client_id(client_id: &str) -> std::result::Result<(), ValidationError> {
    Uuid::parse_str(client_id)
        .map(|_| ())
        .map_err(|_| ValidationError::new("client_id must be a UUID"))
}

fn validate_client_secret(secret: &str) -> std::result::Result<(), ValidationError> {
    if secret.len() < 16 {
        return Err(ValidationError::new(
            "client_secret must be at least 16 characters",
        ));
    }
    let has_lower = secret.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = secret.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = secret.chars().any(|c| c.is_ascii_digit());
    if has_lower && has_upper && has_digit {
        Ok(())
    } else {
        Err(ValidationError::new(
            "client_secret needs mixed case and a digit",
        ))
    }
}

/// Authentication material for one of the supported strategies.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic(BasicCredentials),
    OAuthClientCredentials(OAuthCredentials),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic(BasicCredentials {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn oauth(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Credentials::OAuthClientCredentials(OAuthCredentials {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope,
        })
    }

    /// Applies the per-strategy format rules.
    pub fn validate(&self) -> Result<()> {
        let outcome = match self {
            Credentials::Basic(creds) => creds.validate(),
            Credentials::OAuthClientCredentials(creds) => creds.validate(),
        };
        outcome.map_err(|errors| ClientError::InvalidCredentials(errors.to_string()))
    }
}

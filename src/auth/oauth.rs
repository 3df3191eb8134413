//! OAuth2 client-credentials token exchange
//!
//! Form-encoded POST to the vendor's OAuth endpoint; the response either
//! carries `access_token`/`expires_in` or an `error` string explaining the
//! rejection.

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{TokenKind, TokenState};
use crate::error::{ClientError, Result};
use crate::integration::Integration;

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub(super) async fn request_token(
    http: &reqwest::Client,
    integration: &dyn Integration,
    client_id: &str,
    client_secret: &str,
    scope: Option<&str>,
) -> Result<TokenState> {
    let endpoint = integration.oauth_token_endpoint();
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("grant_type", "client_credentials"),
    ];
    if let Some(scope) = scope {
        form.push(("scope", scope));
    }

    let response = http.post(&endpoint).form(&form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::TokenAcquisition(format!(
            "oauth token endpoint returned {status}: {body}"
        )));
    }

    let parsed: OAuthTokenResponse = response.json().await.map_err(|err| {
        ClientError::TokenAcquisition(format!("malformed oauth token response: {err}"))
    })?;

    if let Some(error) = parsed.error.filter(|e| !e.is_empty()) {
        return Err(ClientError::TokenAcquisition(format!(
            "oauth token endpoint rejected the request: {error}"
        )));
    }
    if parsed.access_token.is_empty() {
        return Err(ClientError::TokenAcquisition(
            "oauth token response contained an empty access_token".to_string(),
        ));
    }

    debug!(
        token_type = parsed.token_type.as_deref().unwrap_or("Bearer"),
        has_refresh_token = parsed.refresh_token.is_some(),
        expires_in = parsed.expires_in,
        "oauth token granted"
    );

    Ok(TokenState {
        value: parsed.access_token,
        expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        kind: TokenKind::OAuth2,
    })
}

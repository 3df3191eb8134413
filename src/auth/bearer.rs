//! Basic-to-bearer token exchange
//!
//! POSTs to the vendor's bearer endpoint with HTTP basic authentication and
//! expects `{"token": "...", "expires": "<RFC3339>"}` back.

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde::Deserialize;

use super::{TokenKind, TokenState};
use crate::error::{ClientError, Result};
use crate::integration::Integration;

#[derive(Debug, Deserialize)]
struct BearerTokenResponse {
    token: String,
    expires: DateTime<Utc>,
}

pub(super) async fn request_token(
    http: &reqwest::Client,
    integration: &dyn Integration,
    username: &str,
    password: &str,
) -> Result<TokenState> {
    let endpoint = integration.bearer_token_endpoint();
    let response = http
        .post(&endpoint)
        .basic_auth(username, Some(password))
        .header(ACCEPT, "application/json")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::TokenAcquisition(format!(
            "bearer token endpoint returned {status}: {body}"
        )));
    }

    let parsed: BearerTokenResponse = response.json().await.map_err(|err| {
        ClientError::TokenAcquisition(format!("malformed bearer token response: {err}"))
    })?;
    if parsed.token.is_empty() {
        return Err(ClientError::TokenAcquisition(
            "bearer token response contained an empty token".to_string(),
        ));
    }

    Ok(TokenState {
        value: parsed.token,
        expires_at: parsed.expires,
        kind: TokenKind::Bearer,
    })
}

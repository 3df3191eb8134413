//! Vendor integration seam
//!
//! Each backend API implements the `Integration` trait for unified request
//! shaping: URL construction, payload marshaling, vendor headers and
//! response handling. The core never interprets response bodies itself; it
//! hands them to the integration and passes raw HTTP responses through.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use url::Url;

use crate::error::{ClientError, Result};
use crate::multipart::encode_inline_multipart;

/// Trait for all vendor adapters.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Fully-qualified base URL used for endpoint construction.
    fn domain(&self) -> String;

    /// Per-vendor URL shaping. The default appends the endpoint to the
    /// domain and validates the result parses as a URL.
    fn construct_resource_url(&self, endpoint: &str) -> Result<String> {
        let joined = format!("{}{}", self.domain().trim_end_matches('/'), endpoint);
        Url::parse(&joined)?;
        Ok(joined)
    }

    /// Encodes the payload per vendor rules. The default is plain JSON;
    /// XML vendors override.
    fn marshal_request(
        &self,
        body: Option<&Value>,
        _method: &Method,
        _endpoint: &str,
    ) -> Result<Vec<u8>> {
        match body {
            Some(value) => {
                serde_json::to_vec(value).map_err(|err| ClientError::Serialization(err.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Alternate path for small multipart messages that fit in memory.
    /// Returns the encoded body and its `Content-Type`.
    fn marshal_multipart(
        &self,
        fields: &[(String, String)],
        files: &[(String, Vec<u8>)],
    ) -> Result<(Vec<u8>, String)> {
        Ok(encode_inline_multipart(fields, files))
    }

    /// Installs vendor-required headers (Accept, content type, API
    /// identifiers). The default sets the accept header only.
    fn set_request_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(ACCEPT, self.accept_header())
    }

    /// Weighted Accept header offered on every request.
    fn accept_header(&self) -> String {
        "application/json;q=1.0".to_string()
    }

    /// Deserializes a 2xx payload into a JSON value the caller can map
    /// onto its own types.
    async fn handle_success_response(&self, response: Response) -> Result<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|err| ClientError::ResponseHandling(err.to_string()))
    }

    /// Produces a structured error from a non-2xx response. The default
    /// folds the status and body into [`ClientError::Api`].
    async fn handle_error_response(&self, response: Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        ClientError::Api { status, message }
    }

    /// Endpoint for the OAuth2 client-credentials grant.
    fn oauth_token_endpoint(&self) -> String;

    /// Endpoint for the basic-to-bearer token exchange.
    fn bearer_token_endpoint(&self) -> String;

    /// Endpoint used to renew an existing token; vendors without a
    /// dedicated one reuse the bearer endpoint.
    fn token_refresh_endpoint(&self) -> String {
        self.bearer_token_endpoint()
    }

    /// Endpoint used to invalidate a token on logout/teardown.
    fn token_invalidate_endpoint(&self) -> String {
        self.token_refresh_endpoint()
    }

    /// Human-readable authentication method identifier for logs.
    fn auth_method_descriptor(&self) -> String;
}

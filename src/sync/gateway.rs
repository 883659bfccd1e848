use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{AdminError, Result};
use super::auth::{CredentialStore, TokenKind};

const RENEW_PATH: &str = "/auth/renew-access-token";

/// A request that can be sent more than once
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Serialize)]
struct RenewRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RenewResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Error body shape used by the backend
#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// HTTP client that attaches the bearer token and renews it once on 401
pub struct AuthGateway {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl AuthGateway {
    pub fn new(
        base_url: String,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AdminError::Network)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Send `request`, returning the successful response.
    ///
    /// A first 401 triggers one renewal round-trip and one resend with the new
    /// token. Anything that prevents that retry from succeeding with
    /// authentication (missing refresh token, failed renewal, second 401)
    /// clears both tokens and yields `AuthExpired`.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response> {
        let access_token = self.credentials.get(TokenKind::Access)?;
        let response = self.dispatch(request, access_token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check(response).await;
        }

        debug!("{} {} returned 401, renewing access token", request.method, request.path);

        let Some(refresh_token) = self.credentials.get(TokenKind::Refresh)? else {
            warn!("No refresh token available");
            return self.expire_session();
        };

        let access_token = match self.renew(&refresh_token).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return self.expire_session();
            }
        };
        self.credentials.set(TokenKind::Access, &access_token)?;
        info!("Access token renewed");

        let retried = self.dispatch(request, Some(&access_token)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!("{} {} still unauthorized after renewal", request.method, request.path);
            return self.expire_session();
        }

        Self::check(retried).await
    }

    /// Send and decode the JSON body
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AdminError::Decode(format!("{} {}: {}", request.method, request.path, e)))
    }

    async fn dispatch(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<Response> {
        let mut builder = self.client
            .request(request.method.clone(), format!("{}{}", self.base_url, request.path));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }

    async fn renew(&self, refresh_token: &str) -> Result<String> {
        let response = self.client
            .post(format!("{}{}", self.base_url, RENEW_PATH))
            .json(&RenewRequest { refresh_token })
            .send()
            .await?;

        let response = Self::check(response).await?;
        let renewed: RenewResponse = response.json().await?;
        Ok(renewed.access_token)
    }

    fn expire_session<T>(&self) -> Result<T> {
        if let Err(e) = self.credentials.clear_all() {
            error!("Failed to clear expired session: {}", e);
        }
        Err(AdminError::AuthExpired)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or(text);

        Err(AdminError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

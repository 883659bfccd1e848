use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AdminError, Result};
use super::auth::{CredentialStore, TokenKind};
use super::gateway::{ApiRequest, AuthGateway};
use super::websocket::{Record, UserPage, VehiclePage};

/// Standard wrapper around admin endpoint payloads
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: Option<u16>,
    pub message: Option<String>,
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Outcome of a review
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

impl Decision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject { reason: reason.into() }
    }

    /// Status flag and rejection reason as sent to the server
    fn validate(&self) -> Result<(bool, Option<String>)> {
        match self {
            Self::Approve => Ok((true, None)),
            Self::Reject { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(AdminError::Validation("Rejection reason is required.".to_string()));
                }
                Ok((false, Some(reason.to_string())))
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserDecisionBody {
    user_id: i64,
    status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected_reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VehicleDecisionBody {
    vehicle_id: i64,
    status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected_reason: Option<String>,
}

/// Filters for the management listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
    pub status_filter: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 10,
            search: None,
            status_filter: None,
        }
    }
}

impl ListQuery {
    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        request = request
            .query("page", self.page.max(1))
            .query("limit", self.limit.max(1));
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            request = request.query("search", search);
        }
        if let Some(status) = self.status_filter.as_deref().filter(|s| !s.is_empty()) {
            request = request.query("statusFilter", status);
        }
        request
    }
}

/// Admin REST endpoints
pub struct AdminApi {
    gateway: Arc<AuthGateway>,
}

impl AdminApi {
    pub fn new(gateway: Arc<AuthGateway>) -> Self {
        Self { gateway }
    }

    fn credentials(&self) -> &Arc<dyn CredentialStore> {
        self.gateway.credentials()
    }

    /// Sign in and persist both tokens
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let request = ApiRequest::post("/auth/login")
            .json(&LoginRequest { email, password })?;
        let tokens: LoginResponse = self.gateway.send_json(&request).await?;

        self.credentials().set(TokenKind::Access, &tokens.access_token)?;
        self.credentials().set(TokenKind::Refresh, &tokens.refresh_token)?;

        info!("Successfully logged in as {}", email);
        Ok(())
    }

    /// Forget both tokens
    pub fn logout(&self) -> Result<()> {
        self.credentials().clear_all()?;
        info!("Logged out");
        Ok(())
    }

    /// A stored refresh token counts as a session
    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.credentials().get(TokenKind::Refresh)?.is_some())
    }

    pub async fn users_statistics(&self) -> Result<serde_json::Value> {
        self.fetch_data(ApiRequest::get("/admin/users-statistics")).await
    }

    pub async fn vehicles_statistics(&self) -> Result<serde_json::Value> {
        self.fetch_data(ApiRequest::get("/admin/vehicles-statistics")).await
    }

    /// HTTP variant of the pending user request page fetch
    pub async fn requested_user_level2(&self, page: u32, limit: u32) -> Result<UserPage> {
        let request = ApiRequest::get("/admin/get-requested-user-level2")
            .query("page", page.max(1))
            .query("limit", limit.max(1));
        self.fetch_data(request).await
    }

    /// HTTP variant of the pending vehicle request page fetch
    pub async fn requested_vehicles(&self, page: u32, limit: u32) -> Result<VehiclePage> {
        let request = ApiRequest::get("/admin/get-requested-vehicles")
            .query("page", page.max(1))
            .query("limit", limit.max(1));
        self.fetch_data(request).await
    }

    pub async fn level2_user_details(&self, user_id: i64) -> Result<Record> {
        let request = ApiRequest::get("/admin/get-details-level2-user")
            .query("userId", user_id);
        self.fetch_data(request).await
    }

    pub async fn vehicle_details(&self, vehicle_id: i64) -> Result<Record> {
        let request = ApiRequest::get("/admin/get-details-vehicle")
            .query("vehicleId", vehicle_id);
        self.fetch_data(request).await
    }

    /// Approve or reject a level 2 verification
    pub async fn decide_user_level2(&self, user_id: i64, decision: &Decision) -> Result<()> {
        let (status, rejected_reason) = decision.validate()?;
        let request = ApiRequest::post("/admin/decision-requested-user-level2")
            .json(&UserDecisionBody { user_id, status, rejected_reason })?;

        self.gateway.send(&request).await?;
        info!("User {} {}", user_id, if status { "approved" } else { "rejected" });
        Ok(())
    }

    /// Approve or reject a vehicle listing
    pub async fn decide_vehicle(&self, vehicle_id: i64, decision: &Decision) -> Result<()> {
        let (status, rejected_reason) = decision.validate()?;
        let request = ApiRequest::post("/admin/decision-requested-vehicle")
            .json(&VehicleDecisionBody { vehicle_id, status, rejected_reason })?;

        self.gateway.send(&request).await?;
        info!("Vehicle {} {}", vehicle_id, if status { "approved" } else { "rejected" });
        Ok(())
    }

    pub async fn list_users(&self, query: &ListQuery) -> Result<UserPage> {
        self.fetch_data(query.apply(ApiRequest::get("/admin/get-users"))).await
    }

    pub async fn list_vehicles(&self, query: &ListQuery) -> Result<VehiclePage> {
        self.fetch_data(query.apply(ApiRequest::get("/admin/get-vehicles"))).await
    }

    pub async fn suspend_user(&self, user_id: i64) -> Result<()> {
        let request = ApiRequest::post("/admin/suspend-user")
            .json(&serde_json::json!({ "userId": user_id }))?;
        self.expect_ok(request).await
    }

    /// Lift a suspension, restoring the account to `status` (the console uses `APPROVED`)
    pub async fn unsuspend_user(&self, user_id: i64, status: &str) -> Result<()> {
        let request = ApiRequest::post("/admin/unsuspend-user")
            .json(&serde_json::json!({ "userId": user_id, "status": status }))?;
        self.expect_ok(request).await
    }

    pub async fn suspend_vehicle(&self, vehicle_id: i64) -> Result<()> {
        let request = ApiRequest::post("/admin/suspend-vehicle")
            .json(&serde_json::json!({ "vehicleId": vehicle_id }))?;
        self.expect_ok(request).await
    }

    pub async fn unsuspend_vehicle(&self, vehicle_id: i64) -> Result<()> {
        let request = ApiRequest::post("/admin/unsuspend-vehicle")
            .json(&serde_json::json!({ "vehicleId": vehicle_id }))?;
        self.expect_ok(request).await
    }

    async fn fetch_data<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let envelope: ApiEnvelope<T> = self.gateway.send_json(&request).await?;
        Self::unwrap_envelope(request.path(), envelope)
    }

    async fn expect_ok(&self, request: ApiRequest) -> Result<()> {
        let envelope: ApiEnvelope<Option<serde_json::Value>> = self.gateway.send_json(&request).await?;
        Self::unwrap_envelope(request.path(), envelope).map(|_| ())
    }

    fn unwrap_envelope<T>(path: &str, envelope: ApiEnvelope<T>) -> Result<T> {
        match envelope.status {
            Some(status) if status != 200 => {
                debug!("{} reported status {}", path, status);
                Err(AdminError::Http {
                    status,
                    message: envelope.message.unwrap_or_else(|| format!("{} failed", path)),
                })
            }
            _ => Ok(envelope.data),
        }
    }
}

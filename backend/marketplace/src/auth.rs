//! Per-request identity.
//!
//! Every handler resolves an [`AuthContext`] exactly once and passes it down
//! explicitly. Agent credentials go through the quota gate as part of that
//! resolution, so the returned context already carries the quota snapshot
//! used for the `X-AI-RateLimit-*` response headers.

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use crate::api::ApiState;
use crate::errors::{AppError, Result};
use crate::quota::{self, QuotaSnapshot};
use crate::signing::constant_time_eq;

pub const HUMAN_HEADER: &str = "x-human-id";
pub const ADMIN_HEADER: &str = "x-admin-token";

#[derive(Debug, Clone, PartialEq)]
pub enum AuthContext {
    Anonymous,
    /// A worker or human requester, identified by the upstream session layer.
    Human { human_id: String },
    /// An API tenant. `quota` is `None` for bypass-listed tenants.
    Agent {
        account_id: String,
        quota: Option<QuotaSnapshot>,
    },
    Admin,
}

/// `ai_account_id` + `ai_api_key`, accepted from the body or the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentCredentials {
    pub ai_account_id: Option<String>,
    pub ai_api_key: Option<String>,
}

impl AgentCredentials {
    fn is_present(&self) -> bool {
        self.ai_account_id.is_some() || self.ai_api_key.is_some()
    }

    /// Body credentials win over query credentials.
    pub fn or(self, fallback: AgentCredentials) -> AgentCredentials {
        if self.is_present() {
            self
        } else {
            fallback
        }
    }
}

impl AuthContext {
    pub fn human_id(&self) -> Result<&str> {
        match self {
            Self::Human { human_id } => Ok(human_id),
            _ => Err(AppError::Unauthorized("human_session_required")),
        }
    }

    pub fn account_id(&self) -> Result<&str> {
        match self {
            Self::Agent { account_id, .. } => Ok(account_id),
            _ => Err(AppError::Unauthorized("agent_credentials_required")),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin_required"))
        }
    }

    /// Requesters are either humans or agent tenants.
    pub fn require_requester(&self) -> Result<()> {
        match self {
            Self::Human { .. } | Self::Agent { .. } => Ok(()),
            _ => Err(AppError::Unauthorized("authentication_required")),
        }
    }

    /// Tenant scope for the idempotency ledger.
    pub fn tenant_scope(&self) -> String {
        match self {
            Self::Agent { account_id, .. } => format!("agent:{account_id}"),
            Self::Human { human_id } => format!("human:{human_id}"),
            Self::Admin => "admin".to_string(),
            Self::Anonymous => "anonymous".to_string(),
        }
    }

    pub fn quota(&self) -> Option<&QuotaSnapshot> {
        match self {
            Self::Agent { quota, .. } => quota.as_ref(),
            _ => None,
        }
    }

    pub fn apply_quota_headers(&self, headers: &mut HeaderMap) {
        if let Some(snapshot) = self.quota() {
            snapshot.apply_headers(headers);
        }
    }
}

/// Resolve the caller. Agent credentials take precedence, then the admin
/// token, then the human session header.
pub async fn resolve(
    state: &ApiState,
    headers: &HeaderMap,
    credentials: AgentCredentials,
) -> Result<AuthContext> {
    if credentials.is_present() {
        let (Some(account_id), Some(api_key)) = (credentials.ai_account_id, credentials.ai_api_key)
        else {
            return Err(AppError::Validation("missing_agent_credentials"));
        };
        let admitted = quota::admit(
            &state.pool,
            &state.config.quota,
            account_id.trim(),
            &api_key,
            Utc::now(),
        )
        .await?;
        return Ok(AuthContext::Agent {
            account_id: admitted.account_id,
            quota: admitted.snapshot,
        });
    }

    if let Some(token) = header_str(headers, ADMIN_HEADER) {
        return match state.config.admin_token.as_deref() {
            Some(expected) if constant_time_eq(token, expected) => Ok(AuthContext::Admin),
            _ => Err(AppError::Unauthorized("invalid_admin_token")),
        };
    }

    if let Some(human_id) = header_str(headers, HUMAN_HEADER) {
        return Ok(AuthContext::Human {
            human_id: human_id.to_string(),
        });
    }

    Ok(AuthContext::Anonymous)
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_state;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn human_header_resolves_human() {
        let state = test_state().await;
        let mut headers = HeaderMap::new();
        headers.insert(HUMAN_HEADER, HeaderValue::from_static("human_1"));
        let auth = resolve(&state, &headers, AgentCredentials::default())
            .await
            .unwrap();
        assert_eq!(
            auth,
            AuthContext::Human {
                human_id: "human_1".into()
            }
        );
        assert_eq!(auth.tenant_scope(), "human:human_1");
    }

    #[tokio::test]
    async fn wrong_admin_token_is_rejected() {
        let state = test_state().await;
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_HEADER, HeaderValue::from_static("nope"));
        let err = resolve(&state, &headers, AgentCredentials::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_admin_token");

        headers.insert(ADMIN_HEADER, HeaderValue::from_static("admin-secret"));
        let auth = resolve(&state, &headers, AgentCredentials::default())
            .await
            .unwrap();
        assert!(auth.is_admin());
    }

    #[tokio::test]
    async fn partial_agent_credentials_are_invalid() {
        let state = test_state().await;
        let creds = AgentCredentials {
            ai_account_id: Some("acct_1".into()),
            ai_api_key: None,
        };
        let err = resolve(&state, &HeaderMap::new(), creds).await.unwrap_err();
        assert_eq!(err.reason(), "missing_agent_credentials");
    }

    #[test]
    fn body_credentials_take_precedence() {
        let body = AgentCredentials {
            ai_account_id: Some("acct_body".into()),
            ai_api_key: Some("k".into()),
        };
        let query = AgentCredentials {
            ai_account_id: Some("acct_query".into()),
            ai_api_key: Some("k".into()),
        };
        assert_eq!(
            body.or(query.clone()).ai_account_id.as_deref(),
            Some("acct_body")
        );
        assert_eq!(
            AgentCredentials::default().or(query).ai_account_id.as_deref(),
            Some("acct_query")
        );
    }
}

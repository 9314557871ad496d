//! REST client for the chat backend.
//!
//! SYSTEM CONTEXT
//! ==============
//! The conversation controller talks to the backend only through the
//! [`ChatApi`] trait; [`HttpApi`] is the reqwest implementation and also
//! serves as the session keeper's [`CredentialRenewer`].
//!
//! AUTH
//! ====
//! Authenticated requests read the credential from the [`SessionContext`] at
//! send time. The aggregate answer and the explanation calls are public: they
//! carry no bearer token and a 401 from them is returned as a status error
//! without touching the session. The refresh call is authenticated by the session cookie kept in the
//! client's cookie store, never by the bearer token.
//!
//! A 401 triggers one refresh and one retry. Concurrent 401s queue on
//! `refresh_gate`; whoever gets the gate second finds the token already
//! replaced and retries with it instead of refreshing again. If the refresh
//! fails the credential is cleared and the call fails with
//! [`ApiError::Unauthorized`]; waiters that queued behind that failure see the
//! cleared session and fail the same way without refreshing again.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::types::{
    AggregateAnswer, AnswerEnvelope, CatalogResponse, ChatHistoryResponse, ChatbotEntry, ClearHistoryResponse,
    ExplanationRequest, ExplanationResponse, HistoryRecord, RefreshResponse, STATUS_OK, TopicAnswer,
};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::session::credential::{Credential, SessionContext};
use crate::session::keeper::CredentialRenewer;

// =============================================================================
// REQUESTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub user: String,
    pub source: String,
    pub limit: u32,
    pub skip: u32,
}

/// Answer request, shaped by which kind of endpoint is being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerRequest {
    Aggregate { query: String },
    Topic { query: String, source: String, user: String },
}

/// Backend operations the conversation controller depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<ChatbotEntry>, ApiError>;

    /// Newest-first page of persisted exchanges.
    async fn fetch_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, ApiError>;

    /// Delete a user's history for one source; returns the deleted count.
    async fn clear_history(&self, user: &str, source: &str) -> Result<u64, ApiError>;

    async fn ask(&self, request: &AnswerRequest) -> Result<AnswerEnvelope, ApiError>;

    async fn explain(&self, request: &ExplanationRequest) -> Result<ExplanationResponse, ApiError>;
}

// =============================================================================
// URLS
// =============================================================================

/// Append `segments` to `base`'s path. An empty final segment yields a trailing slash.
fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = Url::parse(base).map_err(|e| ApiError::Request(format!("invalid base URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| ApiError::Request(format!("base URL cannot carry a path: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn refresh_endpoint(base: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["auth_mini", "refresh"])
}

fn catalog_endpoint(base: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["auth_mini", "chatbots"])
}

fn history_endpoint(base: &str, user: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["auth_mini", "mba", "chat_history", user])
}

fn topic_answer_endpoint(base: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["auth_mini", "mba", "rag", ""])
}

fn aggregate_answer_endpoint(base: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["mba_mini", "tonghop", ""])
}

fn explanation_endpoint(base: &str) -> Result<Url, ApiError> {
    endpoint_url(base, &["mba_mini", "explanation", ""])
}

/// Per-client tag the aggregate endpoint receives in its `time` parameter.
fn session_stamp(now_ms: i64) -> String {
    format!("{now_ms}-{}", uuid::Uuid::new_v4())
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    session: SessionContext,
    clock: Arc<dyn Clock>,
    renewed_lifetime: Duration,
    session_stamp: String,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl HttpApi {
    /// Build a client with a cookie store and the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::HttpClientBuild`] if reqwest cannot build the client.
    pub fn new(config: &ClientConfig, session: SessionContext, clock: Arc<dyn Clock>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        let session_stamp = session_stamp(clock.now_ms());
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            session,
            clock,
            renewed_lifetime: config.refresh.renewed_lifetime,
            session_stamp,
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Send a request built by `build`, attaching the current bearer token and
    /// recovering once from a 401.
    async fn send_authed<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.session.credential().map(|c| c.value().to_owned());
        let response = with_bearer(build(&self.http), token.as_deref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(url = %response.url(), "request unauthorized; attempting refresh");
        let fresh = self.recover_unauthorized(token.as_deref()).await?;
        let retried = with_bearer(build(&self.http), Some(&fresh)).send().await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Ok(retried)
    }

    /// Send a request that carries no bearer token and never triggers a refresh.
    async fn send_public<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: FnOnce(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        Ok(with_bearer(build(&self.http), None).send().await?)
    }

    async fn recover_unauthorized(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let _gate = self.refresh_gate.lock().await;

        match self.session.credential() {
            Some(current) if Some(current.value()) != stale => return Ok(current.value().to_owned()),
            // An earlier waiter's refresh failed and logged the session out.
            None if stale.is_some() => return Err(ApiError::Unauthorized),
            _ => {}
        }

        match self.renew().await {
            Ok(token) => {
                let expires_at_ms = self
                    .clock
                    .now_ms()
                    .saturating_add(i64::try_from(self.renewed_lifetime.as_millis()).unwrap_or(i64::MAX));
                if let Err(e) = self.session.set_credential(&Credential::new(token.as_str(), Some(expires_at_ms))) {
                    warn!(error = %e, "failed to store refreshed credential");
                }
                info!("credential refreshed after 401");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "refresh after 401 failed; clearing session");
                if let Err(e) = self.session.clear() {
                    warn!(error = %e, "failed to clear session");
                }
                Err(ApiError::Unauthorized)
            }
        }
    }
}

fn with_bearer(builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    let builder = builder.header(reqwest::header::ACCEPT, "application/json");
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Status { status: status.as_u16(), body });
    }
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl CredentialRenewer for HttpApi {
    async fn renew(&self) -> Result<String, ApiError> {
        let url = refresh_endpoint(&self.base_url)?;
        let response = self.http.post(url).json(&serde_json::json!({})).send().await?;
        let body: RefreshResponse = read_json(response).await?;
        if body.access_token.is_empty() {
            return Err(ApiError::Envelope("empty access_token".to_owned()));
        }
        Ok(body.access_token)
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_catalog(&self) -> Result<Vec<ChatbotEntry>, ApiError> {
        let url = catalog_endpoint(&self.base_url)?;
        let response = self.send_authed(|http| http.get(url.clone())).await?;
        let body: CatalogResponse = read_json(response).await?;
        Ok(body.chatbots)
    }

    async fn fetch_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, ApiError> {
        let url = history_endpoint(&self.base_url, &query.user)?;
        let params = [
            ("limit", query.limit.to_string()),
            ("skip", query.skip.to_string()),
            ("source", query.source.clone()),
        ];
        let response = self.send_authed(|http| http.get(url.clone()).query(&params)).await?;
        let body: ChatHistoryResponse = read_json(response).await?;
        if body.status != STATUS_OK {
            debug!(status = %body.status, "history listing not ok; treating as empty");
            return Ok(Vec::new());
        }
        Ok(body.chat_history)
    }

    async fn clear_history(&self, user: &str, source: &str) -> Result<u64, ApiError> {
        let url = history_endpoint(&self.base_url, user)?;
        let response = self
            .send_authed(|http| http.delete(url.clone()).query(&[("source", source)]))
            .await?;
        let body: ClearHistoryResponse = read_json(response).await?;
        if body.status != STATUS_OK {
            return Err(ApiError::Envelope(format!("clear history status '{}'", body.status)));
        }
        Ok(body.deleted_count)
    }

    async fn ask(&self, request: &AnswerRequest) -> Result<AnswerEnvelope, ApiError> {
        match request {
            AnswerRequest::Aggregate { query } => {
                let url = aggregate_answer_endpoint(&self.base_url)?;
                let params = [("time", self.session_stamp.as_str()), ("q", query.as_str())];
                let response = self.send_public(|http| http.get(url).query(&params)).await?;
                let body: AggregateAnswer = read_json(response).await?;
                Ok(AnswerEnvelope::Aggregate(body))
            }
            AnswerRequest::Topic { query, source, user } => {
                let url = topic_answer_endpoint(&self.base_url)?;
                let params = [
                    ("time", user.as_str()),
                    ("q", query.as_str()),
                    ("source", source.as_str()),
                    ("save", "true"),
                ];
                let response = self.send_authed(|http| http.get(url.clone()).query(&params)).await?;
                let body: TopicAnswer = read_json(response).await?;
                Ok(AnswerEnvelope::Topic(body))
            }
        }
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<ExplanationResponse, ApiError> {
        let url = explanation_endpoint(&self.base_url)?;
        let response = self.send_public(|http| http.post(url).json(request)).await?;
        read_json(response).await
    }
}

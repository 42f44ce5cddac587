//! Client for the authority's engine API.
//!
//! # Purpose
//! The authority owns the source of truth over policies; this crate is the
//! read-only consumer the synchroniser and the auth layer talk to. The
//! trait exists so the service and its tests can substitute fakes.
use argus_policy::{InstanceKind, Policy};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),
    #[error("authority returned status {0}")]
    Status(u16),
    #[error("authority error [code={code}, message={message}]")]
    Api { code: i64, message: String },
    #[error("authority response not decodable: {0}")]
    Decode(String),
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

#[async_trait]
pub trait AuthorityClient: Send + Sync {
    async fn ping(&self) -> AuthorityResult<()>;

    /// Largest policy id whose `updated_at` is at or before the timestamp.
    async fn max_policy_id(&self, updated_at: i64) -> AuthorityResult<i64>;

    /// Ids of policies updated inside the window. The authority bounds the
    /// window to one hour.
    async fn list_policy_ids_between(
        &self,
        begin_updated_at: i64,
        end_updated_at: i64,
    ) -> AuthorityResult<Vec<i64>>;

    /// Live policies in `[min_id, max_id]` as of `timestamp`.
    async fn list_policies_between_ids(
        &self,
        timestamp: i64,
        min_id: i64,
        max_id: i64,
    ) -> AuthorityResult<Vec<Policy>>;

    async fn list_policies_by_ids(&self, ids: &[i64]) -> AuthorityResult<Vec<Policy>>;

    /// The app codes allowed to query a system, from the system's `clients`
    /// CSV field.
    async fn system_clients(&self, system_id: &str) -> AuthorityResult<Vec<String>>;

    async fn verify_credentials(&self, app_code: &str, app_secret: &str) -> AuthorityResult<bool>;
}

/// The authority's uniform response envelope; a non-zero code is an error
/// even on HTTP 200.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct MaxIdData {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct IdsData {
    ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct PoliciesData {
    results: Vec<Policy>,
}

#[derive(Debug, Deserialize)]
struct SystemData {
    #[serde(default)]
    clients: String,
}

#[derive(Debug, Deserialize)]
struct CredentialsData {
    valid: bool,
}

#[derive(Debug, Clone)]
pub struct HttpAuthorityClient {
    client: reqwest::Client,
    base_url: String,
    app_code: String,
    app_secret: String,
    kind: InstanceKind,
}

impl HttpAuthorityClient {
    pub fn new(
        base_url: impl Into<String>,
        app_code: impl Into<String>,
        app_secret: impl Into<String>,
        kind: InstanceKind,
    ) -> AuthorityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|err| AuthorityError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_code: app_code.into(),
            app_secret: app_secret.into(),
            kind,
        })
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("X-Bk-App-Code", &self.app_code)
            .header("X-Bk-App-Secret", &self.app_secret)
            .header("X-Bk-IAM-Version", "1")
    }

    /// Sends with bounded retries: connect failures, timeouts and 5xx
    /// responses back off exponentially; anything else returns immediately.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> AuthorityResult<reqwest::Response> {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_error = AuthorityError::Unreachable("no attempt made".to_string());

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.apply_headers(build()).send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = AuthorityError::Status(response.status().as_u16());
                }
                Ok(response) if !response.status().is_success() => {
                    return Err(AuthorityError::Status(response.status().as_u16()));
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_connect() || err.is_timeout() => {
                    last_error = AuthorityError::Unreachable(err.to_string());
                }
                Err(err) => return Err(AuthorityError::Unreachable(err.to_string())),
            }

            if attempt < RETRY_ATTEMPTS {
                warn!(attempt, error = %last_error, "authority request failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(last_error)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> AuthorityResult<T> {
        let response = self.send_with_retry(build).await?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|err| AuthorityError::Decode(err.to_string()))?;
        if envelope.code != 0 {
            return Err(AuthorityError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        serde_json::from_value(envelope.data)
            .map_err(|err| AuthorityError::Decode(err.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl AuthorityClient for HttpAuthorityClient {
    async fn ping(&self) -> AuthorityResult<()> {
        let response = self
            .client
            .get(self.url("/ping"))
            .send()
            .await
            .map_err(|err| AuthorityError::Unreachable(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthorityError::Status(response.status().as_u16()))
        }
    }

    async fn max_policy_id(&self, updated_at: i64) -> AuthorityResult<i64> {
        let data: MaxIdData = self
            .call(|| {
                self.client
                    .get(self.url("/api/v1/engine/policies/ids/max"))
                    .timeout(LIST_TIMEOUT)
                    .query(&[
                        ("updated_at", updated_at.to_string()),
                        ("type", self.kind.api_type().to_string()),
                    ])
            })
            .await?;
        Ok(data.id)
    }

    async fn list_policy_ids_between(
        &self,
        begin_updated_at: i64,
        end_updated_at: i64,
    ) -> AuthorityResult<Vec<i64>> {
        let data: IdsData = self
            .call(|| {
                self.client
                    .get(self.url("/api/v1/engine/policies/ids"))
                    .timeout(LIST_TIMEOUT)
                    .query(&[
                        ("begin_updated_at", begin_updated_at.to_string()),
                        ("end_updated_at", end_updated_at.to_string()),
                        ("type", self.kind.api_type().to_string()),
                    ])
            })
            .await?;
        Ok(data.ids)
    }

    async fn list_policies_between_ids(
        &self,
        timestamp: i64,
        min_id: i64,
        max_id: i64,
    ) -> AuthorityResult<Vec<Policy>> {
        let data: PoliciesData = self
            .call(|| {
                self.client
                    .get(self.url("/api/v1/engine/policies"))
                    .timeout(LIST_TIMEOUT)
                    .query(&[
                        ("timestamp", timestamp.to_string()),
                        ("min_id", min_id.to_string()),
                        ("max_id", max_id.to_string()),
                        ("type", self.kind.api_type().to_string()),
                    ])
            })
            .await?;
        Ok(data.results)
    }

    async fn list_policies_by_ids(&self, ids: &[i64]) -> AuthorityResult<Vec<Policy>> {
        let csv = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let data: PoliciesData = self
            .call(|| {
                self.client
                    .get(self.url("/api/v1/engine/policies"))
                    .timeout(LIST_TIMEOUT)
                    .query(&[
                        ("ids", csv.clone()),
                        ("type", self.kind.api_type().to_string()),
                    ])
            })
            .await?;
        Ok(data.results)
    }

    async fn system_clients(&self, system_id: &str) -> AuthorityResult<Vec<String>> {
        let data: SystemData = self
            .call(|| {
                self.client
                    .get(self.url(&format!("/api/v1/engine/systems/{system_id}")))
            })
            .await?;
        Ok(data
            .clients
            .split(',')
            .map(str::trim)
            .filter(|client| !client.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn verify_credentials(&self, app_code: &str, app_secret: &str) -> AuthorityResult<bool> {
        let body = serde_json::json!({
            "type": "app",
            "data": {"app_code": app_code, "app_secret": app_secret}
        });
        let data: CredentialsData = self
            .call(|| {
                self.client
                    .post(self.url("/api/v1/engine/credentials/verify"))
                    .json(&body)
            })
            .await?;
        Ok(data.valid)
    }
}

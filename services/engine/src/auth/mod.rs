//! Client authentication and per-system access control.
//!
//! # Purpose
//! Two ways in: gateway-forwarded requests carry a JWT signed with the
//! gateway's RSA key, direct callers present an app code/secret pair that
//! is verified against the authority. Either way the request resolves to a
//! `client_id`; non-super clients may only query systems whose registered
//! client list includes them.
use crate::api::error::{api_bad_request, api_unauthorized};
use crate::app::AppState;
use argus_authority::AuthorityClient;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const HEADER_REQUEST_FROM: &str = "x-bkapi-from";
const HEADER_JWT: &str = "x-bkapi-jwt";
const HEADER_APP_CODE: &str = "x-bk-app-code";
const HEADER_APP_SECRET: &str = "x-bk-app-secret";
const GATEWAY_REQUEST: &str = "apigw";

const JWT_CACHE_TTL: Duration = Duration::from_secs(3600);
const CREDENTIALS_VALID_TTL: Duration = Duration::from_secs(12 * 3600);
const CREDENTIALS_INVALID_TTL: Duration = Duration::from_secs(60);
const SYSTEM_CLIENTS_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("client({client_id}) can not request system({system_id})")]
    SystemMismatch {
        client_id: String,
        system_id: String,
    },
    #[error("access check failed: {0}")]
    Upstream(String),
}

/// The authenticated caller, injected as a request extension.
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn fresh(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> Option<T> {
        (self.expires_at > Instant::now()).then(|| self.value.clone())
    }
}

pub struct AuthState {
    authority: Arc<dyn AuthorityClient>,
    gateway_key: Option<DecodingKey>,
    super_app_codes: HashSet<String>,
    jwt_cache: DashMap<String, CacheEntry<String>>,
    credentials_cache: DashMap<String, CacheEntry<bool>>,
    system_clients_cache: DashMap<String, CacheEntry<Vec<String>>>,
}

impl AuthState {
    pub fn new(
        authority: Arc<dyn AuthorityClient>,
        gateway_public_key_pem: Option<&str>,
        super_app_codes: impl IntoIterator<Item = String>,
    ) -> anyhow::Result<Self> {
        let gateway_key = match gateway_public_key_pem {
            Some(pem) => Some(
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|err| anyhow::anyhow!("gateway public key invalid: {err}"))?,
            ),
            None => None,
        };
        Ok(Self {
            authority,
            gateway_key,
            super_app_codes: super_app_codes.into_iter().collect(),
            jwt_cache: DashMap::new(),
            credentials_cache: DashMap::new(),
            system_clients_cache: DashMap::new(),
        })
    }

    pub fn is_super_client(&self, client_id: &str) -> bool {
        self.super_app_codes.contains(client_id)
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let from_gateway = headers
            .get(HEADER_REQUEST_FROM)
            .and_then(|value| value.to_str().ok())
            == Some(GATEWAY_REQUEST);

        if from_gateway {
            self.authenticate_gateway(headers)
        } else {
            self.authenticate_credentials(headers).await
        }
    }

    fn authenticate_gateway(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = headers
            .get(HEADER_JWT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if token.is_empty() {
            return Err(AuthError::Unauthorized(
                "request from the gateway must carry a jwt token".to_string(),
            ));
        }
        let Some(key) = &self.gateway_key else {
            return Err(AuthError::Unauthorized(
                "gateway public key is not configured, gateway requests are not supported"
                    .to_string(),
            ));
        };

        let cache_key = hex::encode(Sha256::digest(token.as_bytes()));
        if let Some(entry) = self.jwt_cache.get(&cache_key) {
            if let Some(client_id) = entry.live() {
                return Ok(client_id);
            }
        }

        let validation = Validation::new(Algorithm::RS256);
        let decoded = decode::<Value>(token, key, &validation)
            .map_err(|err| AuthError::Unauthorized(format!("gateway jwt invalid: {err}")))?;
        let client_id = decoded.claims["app"]["app_code"]
            .as_str()
            .ok_or_else(|| {
                AuthError::Unauthorized("gateway jwt carries no app code".to_string())
            })?
            .to_string();

        self.jwt_cache.insert(
            cache_key,
            CacheEntry::fresh(client_id.clone(), JWT_CACHE_TTL),
        );
        Ok(client_id)
    }

    async fn authenticate_credentials(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let app_code = headers
            .get(HEADER_APP_CODE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let app_secret = headers
            .get(HEADER_APP_SECRET)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if app_code.is_empty() || app_secret.is_empty() {
            return Err(AuthError::Unauthorized(
                "app code and app secret required".to_string(),
            ));
        }

        let cache_key = hex::encode(Sha256::digest(format!("{app_code}:{app_secret}").as_bytes()));
        let cached = self
            .credentials_cache
            .get(&cache_key)
            .and_then(|entry| entry.live());
        let valid = match cached {
            Some(valid) => valid,
            None => {
                let valid = self
                    .authority
                    .verify_credentials(app_code, app_secret)
                    .await
                    .map_err(|err| AuthError::Upstream(err.to_string()))?;
                let ttl = if valid {
                    CREDENTIALS_VALID_TTL
                } else {
                    CREDENTIALS_INVALID_TTL
                };
                self.credentials_cache
                    .insert(cache_key, CacheEntry::fresh(valid, ttl));
                valid
            }
        };

        if !valid {
            return Err(AuthError::Unauthorized(
                "app code or app secret wrong".to_string(),
            ));
        }
        Ok(app_code.to_string())
    }

    /// Ensures the client is registered for the system. Super clients are
    /// expected to be filtered out by the caller.
    pub async fn validate_system_client(
        &self,
        system_id: &str,
        client_id: &str,
    ) -> Result<(), AuthError> {
        if system_id.is_empty() || client_id.is_empty() {
            return Err(AuthError::SystemMismatch {
                client_id: client_id.to_string(),
                system_id: system_id.to_string(),
            });
        }

        let cached = self
            .system_clients_cache
            .get(system_id)
            .and_then(|entry| entry.live());
        let clients = match cached {
            Some(clients) => clients,
            None => {
                let clients = self
                    .authority
                    .system_clients(system_id)
                    .await
                    .map_err(|err| AuthError::Upstream(err.to_string()))?;
                self.system_clients_cache.insert(
                    system_id.to_string(),
                    CacheEntry::fresh(clients.clone(), SYSTEM_CLIENTS_TTL),
                );
                clients
            }
        };

        if clients.iter().any(|client| client == client_id) {
            Ok(())
        } else {
            Err(AuthError::SystemMismatch {
                client_id: client_id.to_string(),
                system_id: system_id.to_string(),
            })
        }
    }
}

impl AuthError {
    pub fn into_api_error(self) -> crate::api::error::ApiError {
        match self {
            AuthError::Unauthorized(message) => api_unauthorized(&message),
            AuthError::SystemMismatch { .. } => api_bad_request(&self.to_string()),
            AuthError::Upstream(message) => crate::api::error::api_system_error(&message),
        }
    }
}

pub async fn client_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.auth.authenticate(request.headers()).await {
        Ok(client_id) => {
            request.extensions_mut().insert(ClientId(client_id.clone()));
            let mut response = next.run(request).await;
            // surfaced for the request metrics middleware further out
            response.extensions_mut().insert(ClientId(client_id));
            response
        }
        Err(err) => err.into_api_error().into_response(),
    }
}

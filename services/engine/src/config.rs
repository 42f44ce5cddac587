use anyhow::{Context, Result};
use argus_policy::InstanceKind;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

// Engine configuration sourced from environment variables, with an optional
// YAML override file for ops-managed deployments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // HTTP bind address of the search API.
    pub bind_addr: SocketAddr,
    // Prometheus exposition bind address.
    pub metrics_bind: SocketAddr,
    // abac or rbac policy population of the authority.
    pub instance_kind: InstanceKind,

    // Authority address and the credentials this engine calls it with.
    pub authority_addr: String,
    pub app_code: String,
    pub app_secret: String,

    // App codes that bypass per-system access checks.
    pub super_app_codes: Vec<String>,
    // RSA public key (PEM) for gateway-issued JWTs; gateway auth is
    // rejected when unset.
    pub apigateway_public_key: Option<String>,

    pub document_store: DocumentStoreConfig,

    // Directory holding last-sync timestamps and the snapshot file.
    pub storage_path: PathBuf,

    // Deletion event queue; the stream consumer idles when unset.
    pub redis_url: Option<String>,
    pub delete_queue_key: String,

    // Indexer buffer flush interval, seconds.
    pub indexer_flush_interval: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    pub backend: DocumentStoreBackend,
    pub elasticsearch_addresses: Vec<String>,
    pub elasticsearch_index: String,
    pub elasticsearch_username: Option<String>,
    pub elasticsearch_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStoreBackend {
    // In-memory store for local development and tests.
    Memory,
    Elasticsearch,
}

#[derive(Debug, Deserialize)]
struct EngineConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    instance_kind: Option<String>,
    authority_addr: Option<String>,
    app_code: Option<String>,
    app_secret: Option<String>,
    super_app_codes: Option<Vec<String>>,
    apigateway_public_key: Option<String>,
    document_store_backend: Option<String>,
    elasticsearch_addresses: Option<Vec<String>>,
    elasticsearch_index: Option<String>,
    elasticsearch_username: Option<String>,
    elasticsearch_password: Option<String>,
    storage_path: Option<String>,
    redis_url: Option<String>,
    delete_queue_key: Option<String>,
    indexer_flush_interval: Option<u64>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_backend(value: &str) -> Result<DocumentStoreBackend> {
    match value {
        "memory" => Ok(DocumentStoreBackend::Memory),
        "elasticsearch" => Ok(DocumentStoreBackend::Elasticsearch),
        other => anyhow::bail!("unknown document store backend: {other}"),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or("ARGUS_BIND", "0.0.0.0:9000")
            .parse()
            .with_context(|| "parse ARGUS_BIND")?;
        let metrics_bind = env_or("ARGUS_METRICS_BIND", "0.0.0.0:9090")
            .parse()
            .with_context(|| "parse ARGUS_METRICS_BIND")?;
        let instance_kind = InstanceKind::from_env_value(&env_or("ARGUS_INSTANCE_TYPE", "abac"));

        let authority_addr = env_or("ARGUS_AUTHORITY_ADDR", "http://127.0.0.1:9080");
        let app_code = env_or("ARGUS_APP_CODE", "argus_engine");
        let app_secret = env_or("ARGUS_APP_SECRET", "");

        let super_app_codes = env_or("ARGUS_SUPER_APP_CODES", "")
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect();
        let apigateway_public_key = std::env::var("ARGUS_APIGW_PUBLIC_KEY").ok();

        let backend = parse_backend(&env_or("ARGUS_DOC_BACKEND", "elasticsearch"))?;
        let elasticsearch_addresses = env_or("ARGUS_ES_ADDRESSES", "http://127.0.0.1:9200")
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        let elasticsearch_index = env_or("ARGUS_ES_INDEX", "argus_policies");
        let elasticsearch_username = std::env::var("ARGUS_ES_USERNAME").ok();
        let elasticsearch_password = std::env::var("ARGUS_ES_PASSWORD").ok();

        let storage_path = PathBuf::from(env_or("ARGUS_STORAGE_PATH", "./data"));
        let redis_url = std::env::var("ARGUS_REDIS_URL").ok();
        let delete_queue_key = env_or("ARGUS_DELETE_QUEUE_KEY", "argus:deletion:events");
        let indexer_flush_interval = env_or("ARGUS_INDEXER_FLUSH_INTERVAL", "5")
            .parse()
            .with_context(|| "parse ARGUS_INDEXER_FLUSH_INTERVAL")?;

        Ok(Self {
            bind_addr,
            metrics_bind,
            instance_kind,
            authority_addr,
            app_code,
            app_secret,
            super_app_codes,
            apigateway_public_key,
            document_store: DocumentStoreConfig {
                backend,
                elasticsearch_addresses,
                elasticsearch_index,
                elasticsearch_username,
                elasticsearch_password,
            },
            storage_path,
            redis_url,
            delete_queue_key,
            indexer_flush_interval,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("ARGUS_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read ARGUS_CONFIG: {path}"))?;
            let overrides: EngineConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse engine config yaml")?;
            config.apply(overrides)?;
        }
        Ok(config)
    }

    fn apply(&mut self, overrides: EngineConfigOverride) -> Result<()> {
        if let Some(value) = overrides.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = overrides.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = overrides.instance_kind {
            self.instance_kind = InstanceKind::from_env_value(&value);
        }
        if let Some(value) = overrides.authority_addr {
            self.authority_addr = value;
        }
        if let Some(value) = overrides.app_code {
            self.app_code = value;
        }
        if let Some(value) = overrides.app_secret {
            self.app_secret = value;
        }
        if let Some(value) = overrides.super_app_codes {
            self.super_app_codes = value;
        }
        if let Some(value) = overrides.apigateway_public_key {
            self.apigateway_public_key = Some(value);
        }
        if let Some(value) = overrides.document_store_backend {
            self.document_store.backend = parse_backend(&value)?;
        }
        if let Some(value) = overrides.elasticsearch_addresses {
            self.document_store.elasticsearch_addresses = value;
        }
        if let Some(value) = overrides.elasticsearch_index {
            self.document_store.elasticsearch_index = value;
        }
        if let Some(value) = overrides.elasticsearch_username {
            self.document_store.elasticsearch_username = Some(value);
        }
        if let Some(value) = overrides.elasticsearch_password {
            self.document_store.elasticsearch_password = Some(value);
        }
        if let Some(value) = overrides.storage_path {
            self.storage_path = PathBuf::from(value);
        }
        if let Some(value) = overrides.redis_url {
            self.redis_url = Some(value);
        }
        if let Some(value) = overrides.delete_queue_key {
            self.delete_queue_key = value;
        }
        if let Some(value) = overrides.indexer_flush_interval {
            self.indexer_flush_interval = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_argus_env() {
        for (key, _) in env::vars() {
            if key.starts_with("ARGUS_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_argus_env();
        let config = EngineConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:9090");
        assert_eq!(config.instance_kind, InstanceKind::Abac);
        assert_eq!(
            config.document_store.backend,
            DocumentStoreBackend::Elasticsearch
        );
        assert_eq!(config.delete_queue_key, "argus:deletion:events");
        assert!(config.super_app_codes.is_empty());
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_argus_env();
        unsafe {
            env::set_var("ARGUS_BIND", "127.0.0.1:9100");
            env::set_var("ARGUS_INSTANCE_TYPE", "rbac");
            env::set_var("ARGUS_SUPER_APP_CODES", "bk_iam, bk_ops");
            env::set_var("ARGUS_DOC_BACKEND", "memory");
        }

        let config = EngineConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9100");
        assert_eq!(config.instance_kind, InstanceKind::Rbac);
        assert_eq!(config.super_app_codes, vec!["bk_iam", "bk_ops"]);
        assert_eq!(config.document_store.backend, DocumentStoreBackend::Memory);

        clear_argus_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_bind() {
        clear_argus_env();
        unsafe {
            env::set_var("ARGUS_BIND", "not-an-address");
        }
        assert!(EngineConfig::from_env().is_err());
        clear_argus_env();
    }

    #[serial]
    #[test]
    fn yaml_overrides_env() {
        clear_argus_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.yml");
        std::fs::write(
            &path,
            r#"
bind_addr: "127.0.0.1:7000"
document_store_backend: "memory"
super_app_codes: ["bk_iam"]
indexer_flush_interval: 1
"#,
        )
        .unwrap();
        unsafe {
            env::set_var("ARGUS_CONFIG", path.to_str().unwrap());
        }

        let config = EngineConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7000");
        assert_eq!(config.document_store.backend, DocumentStoreBackend::Memory);
        assert_eq!(config.super_app_codes, vec!["bk_iam"]);
        assert_eq!(config.indexer_flush_interval, 1);

        clear_argus_env();
    }

    #[serial]
    #[test]
    fn unknown_backend_fails() {
        clear_argus_env();
        unsafe {
            env::set_var("ARGUS_DOC_BACKEND", "sqlite");
        }
        assert!(EngineConfig::from_env().is_err());
        clear_argus_env();
    }
}

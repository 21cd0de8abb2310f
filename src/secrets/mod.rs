//! Secret store client.
//!
//! Loads the service config map and backs the remote key manager. The store
//! endpoint comes from `VAULT_ADDR` (TLS CA from `VAULT_CACERT`);
//! authentication is Kubernetes service-account by default, userpass when
//! `ENV=local`. A background lifetime watcher keeps the token renewed so
//! signing keeps working for the life of the process.

pub mod key_manager;

pub use key_manager::KeyManager;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_ROLE: &str = "vault-pilot";
const CONFIG_MOUNT: &str = "apps";
const SERVICE_NAME: &str = "vault-pilot";
const KUBERNETES_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Kubernetes,
    Userpass,
}

/// `ENV=local` selects userpass; everything else is in-cluster.
pub fn auth_method(env: Option<&str>) -> AuthMethod {
    match env {
        Some("local") => AuthMethod::Userpass,
        _ => AuthMethod::Kubernetes,
    }
}

#[derive(Clone)]
pub struct SecretStore {
    address: String,
    client: reqwest::Client,
    token: Arc<RwLock<String>>,
    lease: Arc<RwLock<Duration>>,
}

fn parse_login_reply(reply: &Value) -> anyhow::Result<(String, Duration)> {
    let token = reply
        .pointer("/auth/client_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("login reply without client_token"))?;
    let lease_secs = reply
        .pointer("/auth/lease_duration")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Ok((token.to_string(), Duration::from_secs(lease_secs)))
}

/// KV v2 read envelope: the payload sits at `data.data`.
fn parse_kv_data(reply: &Value) -> HashMap<String, Value> {
    reply
        .pointer("/data/data")
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

impl SecretStore {
    pub async fn connect() -> anyhow::Result<Self> {
        let address = std::env::var("VAULT_ADDR")
            .map_err(|_| anyhow::anyhow!("VAULT_ADDR is not set"))?;

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(15));
        if let Ok(ca_path) = std::env::var("VAULT_CACERT") {
            let pem = std::fs::read(&ca_path)
                .map_err(|err| anyhow::anyhow!("failed to read CA file `{ca_path}`: {err}"))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        let store = Self {
            address: address.trim_end_matches('/').to_string(),
            client: builder.build()?,
            token: Arc::new(RwLock::new(String::new())),
            lease: Arc::new(RwLock::new(Duration::ZERO)),
        };
        store.login().await?;
        Ok(store)
    }

    async fn login(&self) -> anyhow::Result<()> {
        let method = auth_method(std::env::var("ENV").ok().as_deref());
        let reply = match method {
            AuthMethod::Kubernetes => {
                let jwt = std::fs::read_to_string(KUBERNETES_JWT_PATH).map_err(|err| {
                    anyhow::anyhow!("failed to read service-account token: {err}")
                })?;
                self.post_json(
                    "auth/kubernetes/login",
                    &serde_json::json!({ "jwt": jwt.trim(), "role": DEFAULT_ROLE }),
                )
                .await?
            }
            AuthMethod::Userpass => {
                let username = std::env::var("VAULT_USERNAME")
                    .map_err(|_| anyhow::anyhow!("VAULT_USERNAME is not set"))?;
                let password = std::env::var("VAULT_PASSWORD")
                    .map_err(|_| anyhow::anyhow!("VAULT_PASSWORD is not set"))?;
                self.post_json(
                    &format!("auth/userpass/login/{username}"),
                    &serde_json::json!({ "password": password }),
                )
                .await?
            }
        };

        let (token, lease) = parse_login_reply(&reply)?;
        *self.token.write().await = token;
        *self.lease.write().await = lease;
        tracing::info!(lease_secs = lease.as_secs(), "secret store login ok");
        Ok(())
    }

    /// Background token renewal. Runs until the process exits; a failed
    /// renewal falls back to a fresh login.
    pub fn run_lifetime_watcher(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                let lease = *store.lease.read().await;
                let wait = if lease.is_zero() {
                    MIN_RENEW_INTERVAL
                } else {
                    (lease * 2 / 3).max(MIN_RENEW_INTERVAL)
                };
                tokio::time::sleep(wait).await;

                match store.post_json("auth/token/renew-self", &Value::Null).await {
                    Ok(reply) => {
                        if let Ok((token, lease)) = parse_login_reply(&reply) {
                            *store.token.write().await = token;
                            *store.lease.write().await = lease;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "token renewal failed; re-authenticating");
                        if let Err(err) = store.login().await {
                            tracing::error!(error = %err, "secret store re-login failed");
                        }
                    }
                }
            }
        })
    }

    /// Read the service config map: `apps/<service>/config` (KV v2).
    pub async fn read_config(&self) -> anyhow::Result<HashMap<String, Value>> {
        let reply = self
            .get_json(&format!("{CONFIG_MOUNT}/data/{SERVICE_NAME}/config"))
            .await?;
        let config = parse_kv_data(&reply);
        if config.is_empty() {
            anyhow::bail!("empty config map at {CONFIG_MOUNT}/{SERVICE_NAME}/config");
        }
        Ok(config)
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let token = self.token.read().await.clone();
        let mut req = self
            .client
            .post(format!("{}/v1/{path}", self.address))
            .header("X-Vault-Token", token);
        if !body.is_null() {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let reply: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("secret store returned HTTP {status}: {reply}");
        }
        Ok(reply)
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<Value> {
        let token = self.token.read().await.clone();
        let resp = self
            .client
            .get(format!("{}/v1/{path}", self.address))
            .header("X-Vault-Token", token)
            .send()
            .await?;
        let status = resp.status();
        let reply: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("secret store returned HTTP {status}: {reply}");
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_method_selection() {
        assert_eq!(auth_method(Some("local")), AuthMethod::Userpass);
        assert_eq!(auth_method(Some("production")), AuthMethod::Kubernetes);
        assert_eq!(auth_method(None), AuthMethod::Kubernetes);
    }

    #[test]
    fn test_parse_login_reply() {
        let reply = json!({
            "auth": { "client_token": "s.abc123", "lease_duration": 3600 }
        });
        let (token, lease) = parse_login_reply(&reply).expect("parse");
        assert_eq!(token, "s.abc123");
        assert_eq!(lease, Duration::from_secs(3600));

        assert!(parse_login_reply(&json!({})).is_err());
    }

    #[test]
    fn test_parse_kv_data_unwraps_v2_envelope() {
        let reply = json!({
            "data": {
                "data": { "temporalHost": "temporal:7233", "executorConfig": "[]" },
                "metadata": { "version": 3 }
            }
        });
        let config = parse_kv_data(&reply);
        assert_eq!(config.len(), 2);
        assert_eq!(config["temporalHost"], json!("temporal:7233"));

        assert!(parse_kv_data(&json!({})).is_empty());
    }
}

use std::{collections::HashMap, env};

use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

/// Opaque key-value provider for credentials and backend settings.
pub struct CredentialStore {
    source: CredentialSource,
}

enum CredentialSource {
    Memory(Mutex<HashMap<String, String>>),
    Environment,
    Redis {
        client: redis::Client,
        prefix: String,
    },
}

impl CredentialStore {
    pub fn memory(values: HashMap<String, String>) -> Self {
        Self {
            source: CredentialSource::Memory(Mutex::new(values)),
        }
    }

    pub fn environment() -> Self {
        Self {
            source: CredentialSource::Environment,
        }
    }

    pub fn from_env() -> Self {
        let source = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => match redis::Client::open(url.clone()) {
                Ok(client) => {
                    let prefix = env::var("ORCH_REDIS_PREFIX")
                        .unwrap_or_else(|_| "orchestrator".to_owned());
                    CredentialSource::Redis { client, prefix }
                }
                Err(error) => {
                    warn!(error = %error, "invalid REDIS_URL, reading settings from environment");
                    CredentialSource::Environment
                }
            },
            _ => CredentialSource::Environment,
        };

        Self { source }
    }

    pub fn kind(&self) -> &'static str {
        match &self.source {
            CredentialSource::Memory(_) => "memory",
            CredentialSource::Environment => "environment",
            CredentialSource::Redis { .. } => "redis",
        }
    }

    /// Value for `key`, with blank values treated as absent.
    pub async fn get(&self, key: &str) -> Option<String> {
        let value = match &self.source {
            CredentialSource::Memory(store) => store.lock().await.get(key).cloned(),
            CredentialSource::Environment => env::var(key).ok(),
            CredentialSource::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for settings read");
                        return None;
                    }
                };
                let redis_key = format!("{prefix}:settings:{key}");
                match connection.get::<_, Option<String>>(&redis_key).await {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(error = %error, key, "redis get failed for settings");
                        None
                    }
                }
            }
        };

        value.filter(|value| !value.trim().is_empty())
    }

    pub async fn set(&self, key: &str, value: &str) {
        match &self.source {
            CredentialSource::Memory(store) => {
                store.lock().await.insert(key.to_owned(), value.to_owned());
            }
            CredentialSource::Environment => {
                warn!(key, "environment settings are read-only");
            }
            CredentialSource::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for settings write");
                        return;
                    }
                };
                let redis_key = format!("{prefix}:settings:{key}");
                if let Err(error) = connection.set::<_, _, ()>(&redis_key, value).await {
                    warn!(error = %error, key, "redis set failed for settings");
                }
            }
        }
    }
}

/// Short stable digest of a credential, safe to log.
pub fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_and_hides_blank_values() {
        let store = CredentialStore::memory(HashMap::from([(
            "OPENAI_API_KEY".to_owned(),
            "  ".to_owned(),
        )]));

        assert_eq!(store.get("OPENAI_API_KEY").await, None);
        store.set("OPENAI_API_KEY", "sk-live").await;
        assert_eq!(store.get("OPENAI_API_KEY").await.as_deref(), Some("sk-live"));
        assert_eq!(store.kind(), "memory");
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let first = fingerprint("sk-secret");
        assert_eq!(first.len(), 8);
        assert_eq!(first, fingerprint("sk-secret"));
        assert_ne!(first, fingerprint("sk-other"));
    }
}

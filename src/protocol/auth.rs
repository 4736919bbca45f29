//! Bearer token acquisition.

use std::sync::Arc;

use async_trait::async_trait;

use crate::health::types::{HealthError, HealthResult, ServerTarget};
use crate::resources::cache::{CacheCategory, CacheManager, CachedValue};

/// Supplies the bearer token for a server, if it needs one.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_token(&self, target: &ServerTarget) -> HealthResult<Option<String>>;
}

/// Reads the token from the environment variable named by the target.
#[derive(Debug, Clone, Default)]
pub struct EnvTokenProvider;

#[async_trait]
impl AuthProvider for EnvTokenProvider {
    async fn get_token(&self, target: &ServerTarget) -> HealthResult<Option<String>> {
        let Some(var) = target.auth_token_env() else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(token) if !token.is_empty() => Ok(Some(token)),
            _ => Err(HealthError::Configuration(format!(
                "auth token variable {var} for server '{}' is not set",
                target.name()
            ))),
        }
    }
}

/// Caches another provider's tokens in the `auth_tokens` category.
pub struct CachedAuthProvider {
    inner: Arc<dyn AuthProvider>,
    cache: Arc<CacheManager>,
}

impl CachedAuthProvider {
    pub fn new(inner: Arc<dyn AuthProvider>, cache: Arc<CacheManager>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl AuthProvider for CachedAuthProvider {
    async fn get_token(&self, target: &ServerTarget) -> HealthResult<Option<String>> {
        let cached = self.cache.get(CacheCategory::AuthTokens, target.name());
        if let Some(CachedValue::Token(token)) = cached {
            return Ok(Some(token));
        }

        let token = self.inner.get_token(target).await?;
        if let Some(token) = &token {
            self.cache.set(
                CacheCategory::AuthTokens,
                target.name(),
                CachedValue::Token(token.clone()),
                None,
            );
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::types::{CapabilityEndpoint, ProtocolWeights, RestEndpoint};
    use crate::resources::cache::CacheConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use url::Url;

    struct CountingProvider(AtomicU32);

    #[async_trait]
    impl AuthProvider for CountingProvider {
        async fn get_token(&self, _target: &ServerTarget) -> HealthResult<Option<String>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("token-{n}")))
        }
    }

    fn target(env: Option<&str>) -> ServerTarget {
        let t = ServerTarget::new(
            "srv",
            CapabilityEndpoint {
                endpoint: Url::parse("http://127.0.0.1:1/mcp").unwrap(),
                timeout: Duration::from_secs(1),
                retries: 0,
                expected_capabilities: vec![],
                enabled: true,
            },
            RestEndpoint {
                endpoint: Url::parse("http://127.0.0.1:1/health").unwrap(),
                timeout: Duration::from_secs(1),
                retries: 0,
                enabled: true,
            },
            ProtocolWeights::default(),
        )
        .unwrap();
        match env {
            Some(var) => t.with_auth_token_env(var),
            None => t,
        }
    }

    #[tokio::test]
    async fn test_env_provider() {
        std::env::set_var("DUAL_HEALTH_TEST_TOKEN_A", "secret");
        let p = EnvTokenProvider;
        assert_eq!(p.get_token(&target(None)).await.unwrap(), None);
        assert_eq!(
            p.get_token(&target(Some("DUAL_HEALTH_TEST_TOKEN_A"))).await.unwrap(),
            Some("secret".to_string())
        );
        assert!(p.get_token(&target(Some("DUAL_HEALTH_TEST_TOKEN_MISSING"))).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_provider_hits_cache() {
        let inner = Arc::new(CountingProvider(AtomicU32::new(0)));
        let cache = Arc::new(CacheManager::new(CacheConfig::default()).unwrap());
        let p = CachedAuthProvider::new(inner.clone(), cache.clone());

        let first = p.get_token(&target(None)).await.unwrap();
        let second = p.get_token(&target(None)).await.unwrap();
        assert_eq!(first, Some("token-0".to_string()));
        assert_eq!(first, second);
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);

        cache.invalidate(CacheCategory::AuthTokens, "srv");
        assert_eq!(p.get_token(&target(None)).await.unwrap(), Some("token-1".to_string()));
    }
}

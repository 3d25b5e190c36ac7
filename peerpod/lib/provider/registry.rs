use std::{collections::BTreeMap, fmt, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use crate::{config::ServerConfig, PeerpodError, PeerpodResult};

use super::{PoolProvider, Provider, POOL_PROVIDER_NAME};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builds a provider from the adaptor configuration.
pub type ProviderFactory =
    Box<dyn Fn(ServerConfig) -> BoxFuture<'static, PeerpodResult<Arc<dyn Provider>>> + Send + Sync>;

/// The providers the adaptor can be started with, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the providers built into this crate.
    pub fn with_builtin() -> Self {
        Self::new().register(POOL_PROVIDER_NAME, |config: ServerConfig| {
            async move {
                let provider = PoolProvider::new(config.get_pool().clone()).await?;
                Ok::<_, PeerpodError>(Arc::new(provider) as Arc<dyn Provider>)
            }
            .boxed()
        })
    }

    /// Adds a provider under `name`, replacing an earlier one of the same name.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ServerConfig) -> BoxFuture<'static, PeerpodResult<Arc<dyn Provider>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    /// The registered provider names in ascending order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds the provider registered under `name`.
    pub async fn create(&self, name: &str, config: &ServerConfig) -> PeerpodResult<Arc<dyn Provider>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            PeerpodError::NotFound(format!(
                "unknown provider {name:?}, available providers: {}",
                self.names().join(", ")
            ))
        })?;
        factory(config.clone()).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::provider::PoolConfig;

    use super::*;

    #[tokio::test]
    async fn test_registry_builds_builtin_pool_provider() -> anyhow::Result<()> {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.names(), ["pool"]);

        let config = ServerConfig::builder()
            .pool(
                PoolConfig::builder()
                    .vm_pool_ips(vec!["192.168.122.10".to_string()])
                    .build(),
            )
            .build();
        let provider = registry.create("pool", &config).await?;
        assert!(provider.config_verifier().await.is_err());

        let Err(err) = registry.create("aws", &config).await else {
            panic!("an unregistered provider was created");
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("pool"));
        Ok(())
    }
}

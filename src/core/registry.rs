//! Provider registry
//!
//! Process-wide, read-mostly mapping from provider name to descriptor.
//! Populate it once at startup; lookups afterwards take a shared lock only.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::connection::{ConnectOptions, Connection};
use crate::core::error::{DbError, Result};
use crate::core::provider::Provider;

/// Registry of pluggable providers
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with every backend enabled by the
    /// crate's feature flags
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry
            .register("SQLite", Arc::new(crate::backends::SqliteProvider::new()))
            .expect("default provider names are unique");

        #[cfg(feature = "postgres")]
        registry
            .register(
                "PostgreSQL",
                Arc::new(crate::backends::PostgresProvider::new()),
            )
            .expect("default provider names are unique");

        #[cfg(feature = "mysql")]
        registry
            .register("MySQL", Arc::new(crate::backends::MysqlProvider::new()))
            .expect("default provider names are unique");

        registry
    }

    /// Register a provider under `name`
    ///
    /// Fails with [`DbError::DuplicateProvider`] if the name is taken.
    pub fn register(&self, name: &str, provider: Arc<dyn Provider>) -> Result<()> {
        let mut providers = self.providers.write();
        if providers.contains_key(name) {
            return Err(DbError::DuplicateProvider(name.to_string()));
        }
        tracing::debug!(provider = name, "provider registered");
        providers.insert(name.to_string(), provider);
        Ok(())
    }

    /// Look up a provider by name
    ///
    /// Fails with [`DbError::UnknownProvider`] for unregistered names.
    pub fn find(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownProvider(name.to_string()))
    }

    /// Registered provider names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a provider and open a connection against it in one step
    pub async fn open(
        &self,
        provider_name: &str,
        connection_string: &str,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let provider = self.find(provider_name)?;
        Connection::open(provider, provider_name, connection_string, options).await
    }
}

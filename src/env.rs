//! The environment: one database, one configuration, the registered class
//! providers and change listeners

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::fields::FieldCatalog;
use crate::listener::{ChangeListener, ListenerRegistry};
use crate::provider::ClassProvider;
use crate::registrar::{SchemaRegistrar, SchemaReport};
use std::sync::Arc;

struct Inner {
    db: Database,
    catalog: FieldCatalog,
    listeners: ListenerRegistry,
}

/// Shared handle passed to every persistent object. Cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

impl Environment {
    pub fn builder(db: Database, config: Config) -> EnvironmentBuilder {
        EnvironmentBuilder {
            db,
            config,
            providers: Vec::new(),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.inner.catalog
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn config(&self) -> Config {
        self.inner.catalog.config()
    }

    pub fn known_realms(&self) -> Vec<String> {
        self.inner.catalog.known_realms()
    }

    /// Create the tables of every provider's realms when missing.
    /// Safe to call on every start.
    pub fn ensure_schema(&self) -> Result<SchemaReport> {
        self.registrar().ensure_schema(&self.inner.db)
    }

    pub fn registrar(&self) -> SchemaRegistrar {
        let mut registrar = SchemaRegistrar::new();
        for provider in self.inner.catalog.providers() {
            registrar.declare_provider(provider);
        }
        registrar
    }
}

pub struct EnvironmentBuilder {
    db: Database,
    config: Config,
    providers: Vec<Arc<dyn ClassProvider>>,
    listeners: ListenerRegistry,
}

impl EnvironmentBuilder {
    pub fn provider(mut self, provider: Arc<dyn ClassProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    pub fn build(self) -> Environment {
        for provider in &self.providers {
            for realm in provider.realms() {
                tracing::debug!("Mapping realm {} to a class provider", realm);
            }
        }
        Environment {
            inner: Arc::new(Inner {
                db: self.db,
                catalog: FieldCatalog::new(self.providers, self.config),
                listeners: self.listeners,
            }),
        }
    }
}

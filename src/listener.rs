//! Change listeners notified after object writes commit

use crate::object::Record;
use crate::value::FieldValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Observer of object lifecycle events.
///
/// Called only after the write committed. Errors are logged and dropped:
/// a failing listener never undoes a persisted change.
pub trait ChangeListener: Send + Sync {
    fn object_created(&self, _realm: &str, _obj: &Record) -> anyhow::Result<()> {
        Ok(())
    }

    fn object_changed(
        &self,
        _realm: &str,
        _obj: &Record,
        _comment: Option<&str>,
        _author: &str,
        _old_values: &BTreeMap<String, FieldValue>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn object_deleted(&self, _realm: &str, _obj: &Record) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of listeners; fan-out follows registration order
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn created(&self, obj: &Record) {
        for listener in &self.listeners {
            if let Err(e) = listener.object_created(obj.realm(), obj) {
                tracing::error!("object_created listener failed for {} {}: {:#}", obj.realm(), obj.key_string(), e);
            }
        }
    }

    pub fn changed(
        &self,
        obj: &Record,
        comment: Option<&str>,
        author: &str,
        old_values: &BTreeMap<String, FieldValue>,
    ) {
        for listener in &self.listeners {
            if let Err(e) = listener.object_changed(obj.realm(), obj, comment, author, old_values) {
                tracing::error!("object_changed listener failed for {} {}: {:#}", obj.realm(), obj.key_string(), e);
            }
        }
    }

    pub fn deleted(&self, obj: &Record) {
        for listener in &self.listeners {
            if let Err(e) = listener.object_deleted(obj.realm(), obj) {
                tracing::error!("object_deleted listener failed for {} {}: {:#}", obj.realm(), obj.key_string(), e);
            }
        }
    }
}

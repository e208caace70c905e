//! Variable-fields persistent objects
//!
//! A [`PersistentObject`] is a record of some realm whose fields are
//! declared by the field catalog rather than by a Rust struct. Standard
//! fields live in the realm's base table, custom fields in `<realm>_custom`,
//! and every saved field change is appended to `<realm>_change`.
//!
//! Field assignments through [`PersistentObject::set`] are tracked, so
//! [`PersistentObject::save_changes`] only writes (and audits) what actually
//! changed. Each write operation runs in one transaction, wrapped by the
//! [`ObjectHooks`] of the object so specializations can add work to the same
//! transaction.

use crate::db::{execute, json_columns, load_json_rows, quote_ident, where_equal, SqlParam};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::fields::{FieldDescriptor, FieldType, RealmMetadata};
use crate::registrar::{ColumnType, RealmSchema};
use crate::value::{from_timestamp, now, FieldValue, ObjectKey};
use chrono::{DateTime, Utc};
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;

static EMPTY: FieldValue = FieldValue::Empty;

/// Callbacks around the lifecycle operations of an object.
///
/// Every hook runs with the connection of the operation's transaction. A
/// `pre_*` hook returning `false` aborts the operation before any row is
/// touched; an error from any hook rolls the whole operation back.
pub trait ObjectHooks {
    fn pre_fetch(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<bool> {
        Ok(true)
    }

    fn post_fetch(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }

    fn pre_insert(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<bool> {
        Ok(true)
    }

    fn post_insert(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }

    fn pre_save_changes(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<bool> {
        Ok(true)
    }

    fn post_save_changes(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }

    fn pre_delete(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<bool> {
        Ok(true)
    }

    fn post_delete(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }

    fn pre_save_as(
        &mut self,
        _obj: &Record,
        _old_key: Option<&ObjectKey>,
        _new_key: &ObjectKey,
        _conn: &mut SqliteConnection,
    ) -> Result<bool> {
        Ok(true)
    }

    fn post_save_as(
        &mut self,
        _obj: &Record,
        _old_key: Option<&ObjectKey>,
        _new_key: &ObjectKey,
        _conn: &mut SqliteConnection,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_list_matching(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> Result<bool> {
        Ok(true)
    }
}

/// Hooks of a plain object: every operation proceeds unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ObjectHooks for NoHooks {}

/// Read-only state of an object: realm, layout, key and values.
///
/// This is what hooks and change listeners see.
#[derive(Debug, Clone)]
pub struct Record {
    realm: String,
    fields: std::sync::Arc<[FieldDescriptor]>,
    metadata: RealmMetadata,
    schema: RealmSchema,
    key: Option<ObjectKey>,
    values: BTreeMap<String, FieldValue>,
    exists: bool,
}

impl Record {
    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn metadata(&self) -> &RealmMetadata {
        &self.metadata
    }

    pub fn schema(&self) -> &RealmSchema {
        &self.schema
    }

    pub fn key_names(&self) -> &[String] {
        &self.schema.key
    }

    /// Key of the stored row; `None` until fetched or inserted
    pub fn key(&self) -> Option<&ObjectKey> {
        self.key.as_ref()
    }

    /// Serialized key, falling back to the key fields' current values
    pub fn key_string(&self) -> String {
        self.key
            .clone()
            .or_else(|| self.key_from_values())
            .map(|k| k.to_key_string())
            .unwrap_or_else(|| "{}".to_string())
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn get(&self, name: &str) -> &FieldValue {
        self.values.get(name).unwrap_or(&EMPTY)
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    fn is_custom(&self, name: &str) -> bool {
        self.field(name).map(|f| f.custom).unwrap_or(false)
    }

    /// Key built from the current values of the key fields, if all are set
    pub fn key_from_values(&self) -> Option<ObjectKey> {
        let mut key = ObjectKey::new();
        for name in &self.schema.key {
            let value = match self.values.get(name) {
                Some(FieldValue::Text(s)) => s.clone(),
                Some(FieldValue::Time(t)) => crate::value::to_timestamp(t).to_string(),
                _ => return None,
            };
            key = key.with(name.as_str(), value);
        }
        Some(key)
    }

    fn key_params(&self, key: &ObjectKey) -> Vec<SqlParam> {
        self.schema
            .key
            .iter()
            .map(|k| SqlParam::text(key.get(k).unwrap_or_default()))
            .collect()
    }

    fn key_where(&self) -> String {
        where_equal(self.schema.key.iter().map(String::as_str))
    }

    fn is_time_column(&self, name: &str) -> bool {
        self.field(name).map(FieldDescriptor::is_time).unwrap_or(false)
            || self
                .schema
                .columns
                .iter()
                .any(|c| c.name == name && c.column_type == ColumnType::Int64)
    }
}

/// Decode a stored value; time columns come back as microsecond timestamps
fn decode(value: &serde_json::Value, as_time: bool) -> FieldValue {
    use serde_json::Value;
    match value {
        Value::Null => FieldValue::Empty,
        Value::String(s) if as_time => s
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(from_timestamp)
            .map(FieldValue::Time)
            .unwrap_or_else(|| FieldValue::Text(s.clone())),
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Number(n) if as_time => n
            .as_i64()
            .and_then(from_timestamp)
            .map(FieldValue::Time)
            .unwrap_or_else(|| FieldValue::Text(n.to_string())),
        other => FieldValue::Text(other.to_string().trim_matches('"').to_string()),
    }
}

/// One row of a realm's change history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub time: DateTime<Utc>,
    pub author: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A persistent object of some realm, with lifecycle hooks `H`
pub struct PersistentObject<H: ObjectHooks = NoHooks> {
    env: Environment,
    record: Record,
    /// Field → value before the first unsaved assignment
    dirty: BTreeMap<String, FieldValue>,
    hooks: H,
}

impl<H: ObjectHooks + Default> PersistentObject<H> {
    /// Empty object without a key, e.g. a search template
    pub fn new(env: &Environment, realm: &str) -> Result<Self> {
        Self::with_hooks(env, realm, None, H::default())
    }

    /// Object with the given key, loaded from storage when a row exists
    pub fn open(env: &Environment, realm: &str, key: ObjectKey) -> Result<Self> {
        Self::with_hooks(env, realm, Some(key), H::default())
    }
}

impl<H: ObjectHooks> PersistentObject<H> {
    pub fn with_hooks(env: &Environment, realm: &str, key: Option<ObjectKey>, hooks: H) -> Result<Self> {
        let catalog = env.catalog();
        let fields = catalog.get_fields(realm)?;
        let metadata = catalog.get_metadata(realm)?;
        let schema = catalog.get_schema(realm)?;

        let mut values = BTreeMap::new();
        if let Some(key) = &key {
            for (column, value) in key.iter() {
                values.insert(column.to_string(), FieldValue::from(value));
            }
        }

        let mut obj = Self {
            env: env.clone(),
            record: Record {
                realm: realm.to_string(),
                fields,
                metadata,
                schema,
                key: None,
                values,
                exists: false,
            },
            dirty: BTreeMap::new(),
            hooks,
        };

        let found = match &key {
            Some(key) if obj.record.schema.key.iter().all(|k| key.get(k).is_some()) => obj.fetch(key)?,
            _ => false,
        };
        if !found {
            obj.init_defaults()?;
        }

        tracing::debug!(realm, exists = obj.record.exists, "constructed {}", obj.record.key_string());
        Ok(obj)
    }

    fn init_defaults(&mut self) -> Result<()> {
        let protected = self.env.catalog().protected_fields(&self.record.realm)?;
        let section = self.env.config().section(&self.record.realm);

        for field in self.record.fields.iter() {
            let current = self.record.values.get(&field.name);
            if current.map(|v| !v.is_empty()).unwrap_or(false) {
                continue;
            }
            let default = if protected.contains(&field.name) {
                FieldValue::Empty
            } else {
                field.default_value(&section)
            };
            self.record.values.insert(field.name.clone(), default);
        }
        for column in &self.record.schema.columns {
            self.record
                .values
                .entry(column.name.clone())
                .or_insert(FieldValue::Empty);
        }
        self.record.exists = false;
        Ok(())
    }

    fn fetch(&mut self, key: &ObjectKey) -> Result<bool> {
        let mut conn = self.env.db().get_conn()?;
        let conn: &mut SqliteConnection = &mut conn;

        if !self.hooks.pre_fetch(&self.record, conn)? {
            return Ok(false);
        }

        let record = &mut self.record;
        let columns: Vec<&str> = record.schema.columns.iter().map(|c| c.name.as_str()).collect();
        let sql = format!(
            "SELECT {} AS row_json FROM {} WHERE {}",
            json_columns(columns.iter().copied()),
            quote_ident(&record.realm),
            record.key_where()
        );
        let rows = load_json_rows(conn, &sql, record.key_params(key))?;
        let Some(row) = rows.into_iter().next() else {
            tracing::debug!(realm = %record.realm, "object {} not found", key);
            return Ok(false);
        };

        for name in &columns {
            let value = row.get(*name).unwrap_or(&serde_json::Value::Null);
            let decoded = decode(value, record.is_time_column(name));
            record.values.insert(name.to_string(), decoded);
        }
        for field in record.fields.iter().filter(|f| !f.custom) {
            record.values.entry(field.name.clone()).or_insert(FieldValue::Empty);
        }

        if record.metadata.has_custom {
            for field in record.fields.iter().filter(|f| f.custom) {
                record.values.insert(field.name.clone(), FieldValue::Empty);
            }
            let sql = format!(
                "SELECT {} AS row_json FROM {} WHERE {}",
                json_columns(["name", "value"]),
                quote_ident(&record.schema.custom_table()),
                record.key_where()
            );
            for row in load_json_rows(conn, &sql, record.key_params(key))? {
                let Some(name) = row.get("name").and_then(|n| n.as_str()).map(str::to_string) else {
                    continue;
                };
                let Some(field) = record.field(&name) else {
                    continue;
                };
                if !field.custom {
                    continue;
                }
                let value = decode(row.get("value").unwrap_or(&serde_json::Value::Null), field.is_time());
                record.values.insert(name, value);
            }
        }

        record.key = record.key_from_values();
        self.hooks.post_fetch(&self.record, conn)?;
        self.record.exists = true;
        Ok(true)
    }

    // ========================================================================
    // Field access
    // ========================================================================

    pub fn realm(&self) -> &str {
        &self.record.realm
    }

    pub fn key(&self) -> Option<&ObjectKey> {
        self.record.key()
    }

    pub fn key_string(&self) -> String {
        self.record.key_string()
    }

    pub fn exists(&self) -> bool {
        self.record.exists
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        self.record.fields()
    }

    pub fn metadata(&self) -> &RealmMetadata {
        self.record.metadata()
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        self.record.values()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn get(&self, name: &str) -> &FieldValue {
        self.record.get(name)
    }

    /// Text of a field, `""` when unset
    pub fn get_str(&self, name: &str) -> &str {
        self.record.get(name).as_str().unwrap_or("")
    }

    /// Value of a field, or the field's configured default when unset
    pub fn get_value_or_default(&self, name: &str) -> FieldValue {
        match self.record.get(name) {
            FieldValue::Empty => {
                let section = self.env.config().section(&self.record.realm);
                self.record
                    .field(name)
                    .map(|f| f.default_value(&section))
                    .unwrap_or(FieldValue::Empty)
            }
            value => value.clone(),
        }
    }

    /// Names of fields with unsaved assignments
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.keys().map(String::as_str)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Assign a field, tracking the change for the next save.
    ///
    /// Single-line text is trimmed. Assigning the current value is a no-op;
    /// assigning the last saved value back cancels the pending change.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let mut value = value.into();
        if matches!(value, FieldValue::List(_)) {
            return Err(Error::UnsupportedValue {
                realm: self.record.realm.clone(),
                field: name.to_string(),
            });
        }
        let field = self.record.field(name).ok_or_else(|| Error::UnknownField {
            realm: self.record.realm.clone(),
            field: name.to_string(),
        })?;

        if field.field_type != FieldType::Textarea {
            if let FieldValue::Text(s) = &value {
                let trimmed = s.trim();
                if trimmed.len() != s.len() {
                    value = FieldValue::Text(trimmed.to_string());
                }
            }
        }

        let current = self.record.get(name).clone();
        if current == value {
            return Ok(());
        }
        match self.dirty.get(name) {
            None => {
                self.dirty.insert(name.to_string(), current);
            }
            Some(original) if *original == value => {
                self.dirty.remove(name);
            }
            Some(_) => {}
        }
        self.record.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Assign every known field present in `values`.
    ///
    /// A `checkbox_<name>` entry without a matching `<name>` entry marks an
    /// unchecked checkbox and sets `<name>` to `"0"`.
    pub fn populate(&mut self, values: &BTreeMap<String, String>) -> Result<()> {
        let names: Vec<String> = self.record.fields.iter().map(|f| f.name.clone()).collect();
        for name in &names {
            if let Some(value) = values.get(name) {
                self.set(name, value.as_str())?;
            }
        }
        for key in values.keys() {
            if let Some(name) = key.strip_prefix("checkbox_") {
                if names.iter().any(|n| n == name) && !values.contains_key(name) {
                    self.set(name, "0")?;
                }
            }
        }
        Ok(())
    }

    /// Assign values without change tracking
    pub fn set_values<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        for (name, value) in values {
            self.record.values.insert(name.into(), value.into());
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Insert the object as a new row. Returns the key, or `None` when a
    /// hook vetoed the insert.
    pub fn insert(&mut self) -> Result<Option<ObjectKey>> {
        self.insert_at(now())
    }

    pub fn insert_at(&mut self, when: DateTime<Utc>) -> Result<Option<ObjectKey>> {
        if self.record.exists {
            return Err(Error::invalid_state(
                &self.record.realm,
                self.record.key_string(),
                "Cannot insert an existing object",
            ));
        }
        let key = self.require_key_from_values()?;
        tracing::debug!(realm = %self.record.realm, "insert {}", key);

        self.record.values.insert("time".to_string(), FieldValue::Time(when));
        self.record.values.insert("changetime".to_string(), FieldValue::Time(when));

        let env = self.env.clone();
        let record = &self.record;
        let hooks = &mut self.hooks;
        let inserted = env
            .db()
            .transaction(|conn| insert_rows(record, hooks, &key, conn))
            .map_err(|e| self.log_failure("insert", e))?;
        if !inserted {
            return Ok(None);
        }

        self.record.exists = true;
        self.record.key = Some(key.clone());
        self.dirty.clear();
        self.env.listeners().created(&self.record);
        Ok(Some(key))
    }

    /// Persist pending field changes and audit them.
    ///
    /// Returns `Ok(false)` without touching storage when nothing changed and
    /// no comment was given, or when a hook vetoed the save.
    pub fn save_changes(&mut self, author: &str, comment: Option<&str>) -> Result<bool> {
        self.save_changes_at(author, comment, now())
    }

    pub fn save_changes_at(&mut self, author: &str, comment: Option<&str>, when: DateTime<Utc>) -> Result<bool> {
        if !self.record.exists {
            return Err(Error::invalid_state(
                &self.record.realm,
                self.record.key_string(),
                "Cannot update a new object",
            ));
        }
        if self.dirty.is_empty() && comment.is_none() {
            return Ok(false);
        }
        if let Some(name) = self.dirty.keys().find(|n| self.record.schema.key.contains(n)) {
            return Err(Error::invalid_state(
                &self.record.realm,
                self.record.key_string(),
                format!("key field '{}' cannot change; use save_as", name),
            ));
        }
        let key = match self.record.key.clone() {
            Some(key) => key,
            None => self.require_key_from_values()?,
        };
        tracing::debug!(realm = %self.record.realm, "save_changes {} ({} fields)", key, self.dirty.len());

        let env = self.env.clone();
        let record = &self.record;
        let dirty = &self.dirty;
        let hooks = &mut self.hooks;
        let saved = env
            .db()
            .transaction(|conn| save_rows(record, dirty, hooks, &key, author, when, conn))
            .map_err(|e| self.log_failure("save_changes", e))?;
        if !saved {
            return Ok(false);
        }

        let old_values = std::mem::take(&mut self.dirty);
        self.record.values.insert("changetime".to_string(), FieldValue::Time(when));
        self.env.listeners().changed(&self.record, comment, author, &old_values);
        Ok(true)
    }

    /// Delete the row with its custom values and change history.
    /// Returns `false` when a hook vetoed the delete.
    pub fn delete(&mut self) -> Result<bool> {
        let key = match self.record.key.clone() {
            Some(key) => key,
            None => self.require_key_from_values()?,
        };
        tracing::debug!(realm = %self.record.realm, "delete {}", key);

        let env = self.env.clone();
        let record = &self.record;
        let hooks = &mut self.hooks;
        let deleted = env
            .db()
            .transaction(|conn| delete_rows(record, hooks, &key, conn))
            .map_err(|e| self.log_failure("delete", e))?;
        if !deleted {
            return Ok(false);
        }

        self.record.exists = false;
        self.env.listeners().deleted(&self.record);
        Ok(true)
    }

    /// Insert a copy of the object under `new_key`. The original row is
    /// left untouched; this object then refers to the copy.
    pub fn save_as(&mut self, new_key: &ObjectKey) -> Result<bool> {
        let when = now();
        let old_key = self.record.key.clone();
        let saved_state = (self.record.values.clone(), self.record.key.clone(), self.record.exists);
        tracing::debug!(realm = %self.record.realm, "save_as {} -> {}", self.record.key_string(), new_key);

        for (column, value) in new_key.iter() {
            if self.record.schema.key.iter().any(|k| k == column) {
                self.record.values.insert(column.to_string(), FieldValue::from(value));
            }
        }
        let key = self.require_key_from_values()?;
        self.record.values.insert("time".to_string(), FieldValue::Time(when));
        self.record.values.insert("changetime".to_string(), FieldValue::Time(when));
        self.record.exists = false;

        let env = self.env.clone();
        let record = &self.record;
        let hooks = &mut self.hooks;
        let result = env.db().transaction(|conn| {
            if !hooks.pre_save_as(record, old_key.as_ref(), &key, conn)? {
                return Ok(false);
            }
            if !insert_rows(record, hooks, &key, conn)? {
                return Ok(false);
            }
            hooks.post_save_as(record, old_key.as_ref(), &key, conn)?;
            Ok(true)
        });

        match result {
            Ok(true) => {
                self.record.exists = true;
                self.record.key = Some(key);
                self.dirty.clear();
                self.env.listeners().created(&self.record);
                Ok(true)
            }
            other => {
                let (values, key, exists) = saved_state;
                self.record.values = values;
                self.record.key = key;
                self.record.exists = exists;
                other.map_err(|e| self.log_failure("save_as", e))
            }
        }
    }

    /// Change history of this object, oldest first
    pub fn list_changes(&self) -> Result<Vec<ChangeRecord>> {
        if !self.record.metadata.has_change {
            return Ok(Vec::new());
        }
        let Some(key) = self.record.key.clone().or_else(|| self.record.key_from_values()) else {
            return Ok(Vec::new());
        };
        let mut conn = self.env.db().get_conn()?;
        let sql = format!(
            "SELECT {} AS row_json FROM {} WHERE {} ORDER BY \"time\", \"field\"",
            json_columns(["time", "author", "field", "oldvalue", "newvalue"]),
            quote_ident(&self.record.schema.change_table()),
            self.record.key_where()
        );
        let rows = load_json_rows(&mut conn, &sql, self.record.key_params(&key))?;

        let text = |row: &serde_json::Map<String, serde_json::Value>, name: &str| {
            row.get(name).and_then(|v| v.as_str()).map(str::to_string)
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                let time = row.get("time").and_then(|t| t.as_i64()).and_then(from_timestamp)?;
                Some(ChangeRecord {
                    time,
                    author: text(row, "author").unwrap_or_default(),
                    field: text(row, "field").unwrap_or_default(),
                    old_value: text(row, "oldvalue"),
                    new_value: text(row, "newvalue"),
                })
            })
            .collect())
    }

    fn require_key_from_values(&self) -> Result<ObjectKey> {
        self.record.key_from_values().ok_or_else(|| {
            Error::invalid_state(
                &self.record.realm,
                self.record.key_string(),
                format!("key fields {:?} must all be set", self.record.schema.key),
            )
        })
    }

    fn log_failure(&self, operation: &str, e: Error) -> Error {
        tracing::error!(
            realm = %self.record.realm,
            "{} of {} failed and was rolled back: {}",
            operation,
            self.record.key_string(),
            e
        );
        e
    }
}

impl<H: ObjectHooks + Default> PersistentObject<H> {
    /// Objects whose standard fields equal every non-empty standard field of
    /// this template. Unset fields are wildcards.
    pub fn list_matching(&mut self) -> Result<Matches<H>> {
        let proceed = {
            let mut conn = self.env.db().get_conn()?;
            self.hooks.pre_list_matching(&self.record, &mut conn)?
        };

        let filters = if proceed {
            let record = &self.record;
            record
                .schema
                .columns
                .iter()
                .filter(|c| !record.is_custom(&c.name))
                .filter_map(|c| {
                    let value = record.get(&c.name);
                    (!value.is_empty()).then(|| (c.name.clone(), value.clone()))
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Matches {
            env: self.env.clone(),
            realm: self.record.realm.clone(),
            key_names: self.record.schema.key.clone(),
            filters,
            enabled: proceed,
            _hooks: PhantomData,
        })
    }
}

/// A restartable match query. Each call to [`Matches::iter`] runs the query
/// again; objects are loaded one by one as the iterator advances.
pub struct Matches<H> {
    env: Environment,
    realm: String,
    key_names: Vec<String>,
    filters: Vec<(String, FieldValue)>,
    enabled: bool,
    _hooks: PhantomData<fn() -> H>,
}

impl<H: ObjectHooks + Default> Matches<H> {
    pub fn iter(&self) -> MatchIter<'_, H> {
        MatchIter {
            matches: self,
            keys: None,
        }
    }

    fn query_keys(&self) -> Result<Vec<ObjectKey>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut conn = self.env.db().get_conn()?;
        let sql = format!(
            "SELECT {} AS row_json FROM {} WHERE {}",
            json_columns(self.key_names.iter().map(String::as_str)),
            quote_ident(&self.realm),
            where_equal(self.filters.iter().map(|(n, _)| n.as_str()))
        );
        let params = self.filters.iter().map(|(_, v)| SqlParam::from(v)).collect();
        let rows = load_json_rows(&mut conn, &sql, params)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                self.key_names.iter().fold(ObjectKey::new(), |key, name| {
                    let value = match row.get(name) {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    key.with(name.as_str(), value)
                })
            })
            .collect())
    }
}

pub struct MatchIter<'a, H> {
    matches: &'a Matches<H>,
    keys: Option<std::vec::IntoIter<ObjectKey>>,
}

impl<H: ObjectHooks + Default> Iterator for MatchIter<'_, H> {
    type Item = Result<PersistentObject<H>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.keys.is_none() {
            match self.matches.query_keys() {
                Ok(keys) => self.keys = Some(keys.into_iter()),
                Err(e) => {
                    self.keys = Some(Vec::new().into_iter());
                    return Some(Err(e));
                }
            }
        }
        let key = self.keys.as_mut()?.next()?;
        Some(PersistentObject::open(&self.matches.env, &self.matches.realm, key))
    }
}

impl<'a, H: ObjectHooks + Default> IntoIterator for &'a Matches<H> {
    type Item = Result<PersistentObject<H>>;
    type IntoIter = MatchIter<'a, H>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ============================================================================
// Row writers, run inside the operation's transaction
// ============================================================================

fn insert_rows<H: ObjectHooks>(
    record: &Record,
    hooks: &mut H,
    key: &ObjectKey,
    conn: &mut SqliteConnection,
) -> Result<bool> {
    if !hooks.pre_insert(record, conn)? {
        return Ok(false);
    }

    let columns: Vec<&str> = record.schema.columns.iter().map(|c| c.name.as_str()).collect();
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(",");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&record.realm),
        quoted.join(","),
        placeholders
    );
    let params = columns.iter().map(|c| SqlParam::from(record.get(c))).collect();
    execute(conn, &sql, params)?;

    if record.metadata.has_custom {
        let sql = custom_insert_sql(record);
        for field in record.fields.iter().filter(|f| f.custom) {
            let value = record.get(&field.name);
            if value.is_empty() {
                continue;
            }
            let mut params = record.key_params(key);
            params.push(SqlParam::text(field.name.as_str()));
            params.push(SqlParam::Text(value.to_stored()));
            execute(conn, &sql, params)?;
        }
    }

    hooks.post_insert(record, conn)?;
    Ok(true)
}

fn custom_insert_sql(record: &Record) -> String {
    let key_columns: Vec<String> = record.schema.key.iter().map(|k| quote_ident(k)).collect();
    format!(
        "INSERT INTO {} ({},\"name\",\"value\") VALUES ({},?,?)",
        quote_ident(&record.schema.custom_table()),
        key_columns.join(","),
        vec!["?"; key_columns.len()].join(",")
    )
}

fn save_rows<H: ObjectHooks>(
    record: &Record,
    dirty: &BTreeMap<String, FieldValue>,
    hooks: &mut H,
    key: &ObjectKey,
    author: &str,
    when: DateTime<Utc>,
    conn: &mut SqliteConnection,
) -> Result<bool> {
    if !hooks.pre_save_changes(record, conn)? {
        return Ok(false);
    }

    let key_where = record.key_where();
    let key_columns: Vec<String> = record.schema.key.iter().map(|k| quote_ident(k)).collect();
    let change_sql = format!(
        "INSERT INTO {} ({},\"time\",\"author\",\"field\",\"oldvalue\",\"newvalue\") VALUES ({},?,?,?,?,?)",
        quote_ident(&record.schema.change_table()),
        key_columns.join(","),
        vec!["?"; key_columns.len()].join(",")
    );

    for (name, old) in dirty {
        let new = record.get(name);
        if record.is_custom(name) {
            save_custom_value(record, key, name, new, conn)?;
        } else {
            let sql = format!(
                "UPDATE {} SET {}=? WHERE {}",
                quote_ident(&record.realm),
                quote_ident(name),
                key_where
            );
            let mut params = vec![SqlParam::from(new)];
            params.extend(record.key_params(key));
            execute(conn, &sql, params)?;
        }

        if record.metadata.has_change {
            let mut params = record.key_params(key);
            params.push(SqlParam::from(&FieldValue::Time(when)));
            params.push(SqlParam::text(author));
            params.push(SqlParam::text(name.as_str()));
            params.push(SqlParam::Text(old.to_stored()));
            params.push(SqlParam::Text(new.to_stored()));
            execute(conn, &change_sql, params)?;
        }
    }

    let sql = format!(
        "UPDATE {} SET \"changetime\"=? WHERE {}",
        quote_ident(&record.realm),
        key_where
    );
    let mut params = vec![SqlParam::from(&FieldValue::Time(when))];
    params.extend(record.key_params(key));
    execute(conn, &sql, params)?;

    hooks.post_save_changes(record, conn)?;
    Ok(true)
}

/// Upsert one custom value; an unset value removes its row
fn save_custom_value(
    record: &Record,
    key: &ObjectKey,
    name: &str,
    value: &FieldValue,
    conn: &mut SqliteConnection,
) -> Result<()> {
    let table = quote_ident(&record.schema.custom_table());
    let key_where = record.key_where();
    let mut where_params = vec![SqlParam::text(name)];
    where_params.extend(record.key_params(key));

    if value.is_empty() {
        let sql = format!("DELETE FROM {} WHERE \"name\"=? AND {}", table, key_where);
        execute(conn, &sql, where_params)?;
        return Ok(());
    }

    let sql = format!("UPDATE {} SET \"value\"=? WHERE \"name\"=? AND {}", table, key_where);
    let mut params = vec![SqlParam::Text(value.to_stored())];
    params.extend(where_params);
    if execute(conn, &sql, params)? == 0 {
        let mut params = record.key_params(key);
        params.push(SqlParam::text(name));
        params.push(SqlParam::Text(value.to_stored()));
        execute(conn, &custom_insert_sql(record), params)?;
    }
    Ok(())
}

fn delete_rows<H: ObjectHooks>(
    record: &Record,
    hooks: &mut H,
    key: &ObjectKey,
    conn: &mut SqliteConnection,
) -> Result<bool> {
    if !hooks.pre_delete(record, conn)? {
        return Ok(false);
    }

    let key_where = record.key_where();
    let mut tables = vec![record.realm.clone()];
    if record.metadata.has_change {
        tables.push(record.schema.change_table());
    }
    if record.metadata.has_custom {
        tables.push(record.schema.custom_table());
    }
    for table in tables {
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(&table), key_where);
        execute(conn, &sql, record.key_params(key))?;
    }

    hooks.post_delete(record, conn)?;
    Ok(true)
}

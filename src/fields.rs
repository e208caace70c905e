//! Field catalog: the ordered, per-realm list of standard and custom fields
//!
//! Standard fields come from class providers; custom fields are parsed from
//! the `<realm>-custom` configuration section. Both are cached per realm
//! until [`FieldCatalog::reset_fields`] is called.

use crate::config::{Config, Section};
use crate::error::{Error, Result};
use crate::provider::ClassProvider;
use crate::registrar::RealmSchema;
use crate::value::FieldValue;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref CUSTOM_FIELD_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]+$").unwrap();
}

/// Kind of a field, driving trimming, decoding and rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Textarea,
    Select,
    Radio,
    Checkbox,
    Time,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "text" => Some(FieldType::Text),
            "textarea" => Some(FieldType::Textarea),
            "select" => Some(FieldType::Select),
            "radio" => Some(FieldType::Radio),
            "checkbox" => Some(FieldType::Checkbox),
            "time" => Some(FieldType::Time),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Select => "select",
            FieldType::Radio => "radio",
            FieldType::Checkbox => "checkbox",
            FieldType::Time => "time",
        }
    }
}

/// Description of one field of a realm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    pub order: i64,
    /// Raw configured default
    pub default: Option<String>,
    /// Choices for select and radio fields
    pub options: Vec<String>,
    /// Select/radio field whose option list contained an empty choice
    pub optional: bool,
    pub format: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub custom: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType, label: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            label: label.to_string(),
            order: 0,
            default: None,
            options: Vec::new(),
            optional: false,
            format: None,
            width: None,
            height: None,
            custom: false,
        }
    }

    pub fn text(name: &str, label: &str) -> Self {
        Self::new(name, FieldType::Text, label)
    }

    pub fn time(name: &str, label: &str) -> Self {
        Self::new(name, FieldType::Time, label)
    }

    pub fn is_time(&self) -> bool {
        self.field_type == FieldType::Time
    }

    /// Default for a new object: the `default_<name>` option of the realm's
    /// section for standard fields, the configured `value` for custom ones.
    /// A select/radio default that is not one of the options is read as an
    /// option index.
    pub fn default_value(&self, realm_section: &Section) -> FieldValue {
        let raw = if self.custom {
            self.default.clone()
        } else {
            realm_section
                .get(&format!("default_{}", self.name))
                .map(str::to_string)
                .or_else(|| self.default.clone())
        };

        let Some(mut default) = raw.filter(|d| !d.is_empty()) else {
            return FieldValue::Empty;
        };

        if !self.options.is_empty() && !self.options.contains(&default) {
            match default.trim().parse::<usize>().ok().and_then(|i| self.options.get(i)) {
                Some(option) => default = option.clone(),
                None => {
                    tracing::warn!(
                        "Invalid default value \"{}\" for custom field \"{}\"",
                        default,
                        self.name
                    );
                    return FieldValue::Empty;
                }
            }
        }
        FieldValue::Text(default)
    }
}

/// Per-realm metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealmMetadata {
    pub label: String,
    pub searchable: bool,
    pub has_custom: bool,
    pub has_change: bool,
}

/// Parse the custom fields declared in a `<realm>-custom` section.
///
/// Options without a dot declare a field (`name = type`); dotted options are
/// its attributes. Invalid names, unknown types and names clashing with
/// `reserved` are logged and skipped.
pub fn parse_custom_fields(realm: &str, section: &Section, reserved: &[&str]) -> Vec<FieldDescriptor> {
    let mut fields = Vec::new();

    for (name, type_name) in section.options().filter(|(name, _)| !name.contains('.')) {
        if !CUSTOM_FIELD_NAME.is_match(name) {
            tracing::warn!("Invalid name for custom field: \"{}\" (ignoring)", name);
            continue;
        }
        if reserved.contains(&name) {
            tracing::warn!(
                "Custom field \"{}\" clashes with a standard field of {} (ignoring)",
                name,
                realm
            );
            continue;
        }
        let Some(field_type) = FieldType::parse(type_name) else {
            tracing::warn!("Unknown type \"{}\" for custom field \"{}\" (ignoring)", type_name, name);
            continue;
        };

        let attr = |a: &str| format!("{}.{}", name, a);
        let mut field = FieldDescriptor::new(name, field_type, "");
        field.custom = true;
        field.order = section.get_int(&attr("order")).unwrap_or(0);
        field.label = section
            .get(&attr("label"))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| capitalize(name));
        field.default = Some(section.get(&attr("value")).unwrap_or("").to_string());

        match field_type {
            FieldType::Select | FieldType::Radio => {
                let mut options = section.get_list(&attr("options"), '|');
                if options.iter().any(|o| o.is_empty()) {
                    field.optional = true;
                    options.retain(|o| !o.is_empty());
                }
                field.options = options;
            }
            FieldType::Text => {
                field.format = Some(section.get(&attr("format")).unwrap_or("plain").to_string());
            }
            FieldType::Textarea => {
                field.format = Some(section.get(&attr("format")).unwrap_or("plain").to_string());
                field.width = section.get_int(&attr("cols"));
                field.height = section.get_int(&attr("rows"));
            }
            FieldType::Checkbox | FieldType::Time => {}
        }

        fields.push(field);
    }

    // Stable: ties keep declaration order
    fields.sort_by_key(|f| f.order);
    fields
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Process-wide field and metadata cache, filled on first use per realm
pub struct FieldCatalog {
    providers: Vec<Arc<dyn ClassProvider>>,
    config: RwLock<Config>,
    fields: RwLock<HashMap<String, Arc<[FieldDescriptor]>>>,
    metadata: RwLock<HashMap<String, RealmMetadata>>,
}

impl FieldCatalog {
    pub fn new(providers: Vec<Arc<dyn ClassProvider>>, config: Config) -> Self {
        Self {
            providers,
            config: RwLock::new(config),
            fields: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn providers(&self) -> &[Arc<dyn ClassProvider>] {
        &self.providers
    }

    /// Provider responsible for a realm
    pub fn provider(&self, realm: &str) -> Result<&Arc<dyn ClassProvider>> {
        self.providers
            .iter()
            .find(|p| p.realms().iter().any(|r| r == realm))
            .ok_or_else(|| Error::UnknownRealm {
                realm: realm.to_string(),
            })
    }

    pub fn known_realms(&self) -> Vec<String> {
        self.providers.iter().flat_map(|p| p.realms()).collect()
    }

    /// Table declaration of a realm
    pub fn get_schema(&self, realm: &str) -> Result<RealmSchema> {
        self.provider(realm)?
            .schemas()
            .into_iter()
            .find(|s| s.realm == realm)
            .ok_or_else(|| Error::UnknownRealm {
                realm: realm.to_string(),
            })
    }

    pub fn protected_fields(&self, realm: &str) -> Result<Vec<String>> {
        Ok(self.provider(realm)?.protected_fields(realm))
    }

    /// Snapshot of the configuration the catalog reads from
    pub fn config(&self) -> Config {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Replace the configuration. Takes effect after [`Self::reset_fields`].
    pub fn set_config(&self, config: Config) {
        if let Ok(mut current) = self.config.write() {
            *current = config;
        }
    }

    /// Invalidate the field and metadata caches
    pub fn reset_fields(&self) {
        if let Ok(mut fields) = self.fields.write() {
            fields.clear();
        }
        if let Ok(mut metadata) = self.metadata.write() {
            metadata.clear();
        }
    }

    pub fn get_metadata(&self, realm: &str) -> Result<RealmMetadata> {
        if let Some(m) = self.metadata.read().ok().and_then(|m| m.get(realm).cloned()) {
            return Ok(m);
        }
        let metadata = self.provider(realm)?.metadata(realm);
        if let Ok(mut cache) = self.metadata.write() {
            cache.insert(realm.to_string(), metadata.clone());
        }
        Ok(metadata)
    }

    pub fn get_fields(&self, realm: &str) -> Result<Arc<[FieldDescriptor]>> {
        if let Some(f) = self.fields.read().ok().and_then(|f| f.get(realm).cloned()) {
            return Ok(f);
        }

        let provider = self.provider(realm)?;
        let metadata = self.get_metadata(realm)?;
        let mut fields = provider.fields(realm);

        if metadata.has_custom {
            let section = self.config().section(&format!("{}-custom", realm));
            let reserved: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            let custom = parse_custom_fields(realm, &section, &reserved);
            fields.extend(custom);
        }

        tracing::debug!("Fields for realm {}:", realm);
        for f in &fields {
            tracing::debug!("   {} : {}{}", f.name, f.field_type.as_str(), if f.custom { " (custom)" } else { "" });
        }

        let fields: Arc<[FieldDescriptor]> = fields.into();
        if let Ok(mut cache) = self.fields.write() {
            cache.insert(realm.to_string(), fields.clone());
        }
        Ok(fields)
    }
}

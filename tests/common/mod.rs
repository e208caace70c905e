//! Shared fixtures: a temporary database and a small provider with two
//! realms, `widget` (single key) and `slot` (composite key).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use testman::fields::FieldType;
use testman::{
    ChangeListener, ClassProvider, Column, Config, Database, Environment, FieldDescriptor, FieldValue,
    RealmMetadata, RealmSchema, Record, WorkflowProvider,
};

pub const WIDGET_CONFIG: &str = r#"
[widget]
default_owner = "qa"

[widget-custom]
color = "select"
"color.options" = "|red|green|blue"
notes = "text"
active = "checkbox"
seen = "time"
"#;

pub struct WidgetProvider;

impl ClassProvider for WidgetProvider {
    fn realms(&self) -> Vec<String> {
        vec!["widget".to_string(), "slot".to_string()]
    }

    fn schemas(&self) -> Vec<RealmSchema> {
        vec![
            RealmSchema::declare(
                "widget",
                &["id"],
                vec![
                    Column::text("name"),
                    Column::text("body"),
                    Column::text("owner"),
                    Column::int64("due"),
                ],
                true,
                true,
            ),
            RealmSchema::declare("slot", &["id", "planid"], vec![Column::text("status")], true, true),
        ]
    }

    fn fields(&self, realm: &str) -> Vec<FieldDescriptor> {
        match realm {
            "widget" => vec![
                FieldDescriptor::text("id", "ID"),
                FieldDescriptor::text("name", "Name"),
                FieldDescriptor::new("body", FieldType::Textarea, "Body"),
                FieldDescriptor::text("owner", "Owner"),
                FieldDescriptor::time("due", "Due"),
            ],
            _ => vec![
                FieldDescriptor::text("id", "ID"),
                FieldDescriptor::text("planid", "Plan"),
                FieldDescriptor::text("status", "Status"),
            ],
        }
    }

    fn metadata(&self, realm: &str) -> RealmMetadata {
        RealmMetadata {
            label: realm.to_string(),
            searchable: false,
            has_custom: true,
            has_change: true,
        }
    }

    fn protected_fields(&self, _realm: &str) -> Vec<String> {
        vec!["id".to_string()]
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub env: Environment,
}

pub fn open_db(dir: &TempDir) -> Database {
    Database::open_at(dir.path().join("test.db")).unwrap()
}

/// Widget realms plus the workflow realm, schema created
pub fn widget_env(config: &str) -> TestEnv {
    widget_env_with_listeners(config, Vec::new())
}

pub fn widget_env_with_listeners(config: &str, listeners: Vec<Arc<dyn ChangeListener>>) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let mut builder = Environment::builder(open_db(&dir), Config::parse(config).unwrap())
        .provider(Arc::new(WidgetProvider))
        .provider(Arc::new(WorkflowProvider));
    for listener in listeners {
        builder = builder.listener(listener);
    }
    let env = builder.build();
    env.ensure_schema().unwrap();
    TestEnv { dir, env }
}

/// Test manager and workflow realms, schema created
pub fn testman_env(config: &str) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let env = testman::standard_environment(open_db(&dir), Config::parse(config).unwrap());
    env.ensure_schema().unwrap();
    TestEnv { dir, env }
}

/// Listener recording every event as a line of text
#[derive(Default)]
pub struct Recorder {
    pub name: String,
    pub events: Arc<Mutex<Vec<String>>>,
    pub fail: bool,
}

impl ChangeListener for Recorder {
    fn object_created(&self, realm: &str, obj: &Record) -> anyhow::Result<()> {
        self.push(format!("{} created {} {}", self.name, realm, obj.key_string()));
        Ok(())
    }

    fn object_changed(
        &self,
        realm: &str,
        obj: &Record,
        comment: Option<&str>,
        author: &str,
        old_values: &std::collections::BTreeMap<String, FieldValue>,
    ) -> anyhow::Result<()> {
        let fields: Vec<&str> = old_values.keys().map(String::as_str).collect();
        self.push(format!(
            "{} changed {} {} by {} [{}] {}",
            self.name,
            realm,
            obj.key_string(),
            author,
            fields.join(","),
            comment.unwrap_or("")
        ));
        if self.fail {
            anyhow::bail!("listener {} failed", self.name);
        }
        Ok(())
    }

    fn object_deleted(&self, realm: &str, obj: &Record) -> anyhow::Result<()> {
        self.push(format!("{} deleted {} {}", self.name, realm, obj.key_string()));
        Ok(())
    }
}

impl Recorder {
    fn push(&self, line: String) {
        self.events.lock().unwrap().push(line);
    }
}

/// Count rows of a table through the library's own query helpers
pub fn count_rows(env: &Environment, table: &str) -> usize {
    let mut conn = env.db().get_conn().unwrap();
    let sql = format!(
        "SELECT json_object('n', COUNT(*)) AS row_json FROM {}",
        testman::db::quote_ident(table)
    );
    let rows = testman::db::load_json_rows(&mut conn, &sql, vec![]).unwrap();
    rows[0]["n"].as_u64().unwrap() as usize
}

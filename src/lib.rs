//! testman - test case management on a generic persistent-object layer
//!
//! Many realms (test catalogs, test cases, plans, workflow states) share one
//! implementation of CRUD, user-configurable custom fields and field-level
//! change history.
//!
//! # Tables
//!
//! Each realm declares its base columns; the registrar derives up to three
//! tables from that declaration:
//!
//! | Table | Holds |
//! |-------|-------|
//! | `<realm>` | standard fields, plus `time` and `changetime` |
//! | `<realm>_custom` | one row per set custom field |
//! | `<realm>_change` | one row per changed field per save |
//!
//! # Quick Start
//!
//! ```no_run
//! use testman::{Config, Database, ObjectKey, PersistentObject};
//!
//! let db = Database::new("testman.db").unwrap();
//! let env = testman::standard_environment(db, Config::default());
//! env.ensure_schema().unwrap();
//!
//! let mut plan: PersistentObject = PersistentObject::open(&env, "testplan", ObjectKey::id("1")).unwrap();
//! plan.set("name", "Release 2.0").unwrap();
//! plan.insert().unwrap();
//!
//! plan.set("name", "Release 2.1").unwrap();
//! plan.save_changes("alice", Some("renamed")).unwrap();
//! assert_eq!(plan.list_changes().unwrap().len(), 1);
//! ```

pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod fields;
pub mod init;
pub mod listener;
pub mod object;
pub mod provider;
pub mod registrar;
pub mod schema;
pub mod testmanager;
pub mod value;
pub mod wiki;
pub mod workflow;

pub use config::{Config, Section};
pub use db::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use fields::{FieldCatalog, FieldDescriptor, FieldType, RealmMetadata};
pub use listener::{ChangeListener, ListenerRegistry};
pub use object::{ChangeRecord, Matches, NoHooks, ObjectHooks, PersistentObject, Record};
pub use provider::ClassProvider;
pub use registrar::{Column, ColumnType, RealmSchema, SchemaRegistrar, SchemaReport};
pub use testmanager::TestManagerProvider;
pub use value::{FieldValue, ObjectKey};
pub use wiki::{DocumentStore, SqliteWikiStore, WikiPageHooks, WikiPageObject};
pub use workflow::{
    PermissionOracle, PermissionSet, Resource, ResourceWorkflowState, TransitionRequest, WorkflowProvider,
    WorkflowSystem,
};

use std::sync::Arc;

/// Environment with the test manager and workflow realms registered
pub fn standard_environment(db: Database, config: Config) -> Environment {
    Environment::builder(db, config)
        .provider(Arc::new(TestManagerProvider::default()))
        .provider(Arc::new(WorkflowProvider))
        .build()
}

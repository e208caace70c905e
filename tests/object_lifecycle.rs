//! Integration tests for persistent objects: CRUD, dirty tracking, change
//! history, custom fields, matching and lifecycle hooks.

mod common;

use common::*;
use diesel::sqlite::SqliteConnection;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use testman::value::now;
use testman::{Config, Error, FieldValue, ObjectHooks, ObjectKey, PersistentObject, Record};

fn widget(env: &testman::Environment, id: &str) -> PersistentObject {
    PersistentObject::open(env, "widget", ObjectKey::id(id)).unwrap()
}

fn insert_widget(env: &testman::Environment, id: &str, name: &str) -> PersistentObject {
    let mut w = widget(env, id);
    w.set("name", name).unwrap();
    w.insert().unwrap().unwrap();
    w
}

// =============================================================================
// Construction and round trips
// =============================================================================

#[test]
fn test_insert_then_open_round_trips_every_field() {
    let t = widget_env(WIDGET_CONFIG);
    let due = now();

    let mut w = widget(&t.env, "1");
    assert!(!w.exists());
    w.set("name", "Sprocket").unwrap();
    w.set("body", "  indented\ntext  ").unwrap();
    w.set("due", due).unwrap();
    w.set("color", "green").unwrap();
    let key = w.insert().unwrap().unwrap();
    assert_eq!(key, ObjectKey::id("1"));
    assert!(w.exists());
    assert!(!w.is_dirty());

    let loaded = widget(&t.env, "1");
    assert!(loaded.exists());
    assert_eq!(loaded.get("name"), &FieldValue::from("Sprocket"));
    assert_eq!(loaded.get("body"), &FieldValue::from("  indented\ntext  "));
    assert_eq!(loaded.get("due"), &FieldValue::Time(due));
    assert_eq!(loaded.get("color"), &FieldValue::from("green"));
    assert_eq!(loaded.get("owner"), &FieldValue::from("qa"));
    assert!(matches!(loaded.get("time"), FieldValue::Time(_)));
    assert_eq!(loaded.key(), Some(&ObjectKey::id("1")));
}

#[test]
fn test_custom_time_field_round_trips() {
    let t = widget_env(WIDGET_CONFIG);
    let first_seen = now();

    let mut w = widget(&t.env, "1");
    w.set("seen", first_seen).unwrap();
    w.insert().unwrap();
    assert_eq!(count_rows(&t.env, "widget_custom"), 1);
    assert_eq!(widget(&t.env, "1").get("seen"), &FieldValue::Time(first_seen));

    let last_seen = first_seen + chrono::Duration::days(3);
    w.set("seen", last_seen).unwrap();
    assert!(w.save_changes("alice", None).unwrap());
    let loaded = widget(&t.env, "1");
    assert_eq!(loaded.get("seen"), &FieldValue::Time(last_seen));
    assert_eq!(loaded.get("due"), &FieldValue::Empty);
}

#[test]
fn test_load_miss_populates_defaults() {
    let t = widget_env(WIDGET_CONFIG);
    let w = widget(&t.env, "missing");
    assert!(!w.exists());
    assert_eq!(w.key(), None);
    assert_eq!(w.get("id"), &FieldValue::from("missing"));
    assert_eq!(w.get("owner"), &FieldValue::from("qa"));
    assert_eq!(w.get("name"), &FieldValue::Empty);
    assert_eq!(w.get("not_a_field"), &FieldValue::Empty);
}

#[test]
fn test_unknown_realm_is_rejected() {
    let t = widget_env(WIDGET_CONFIG);
    let err = PersistentObject::<testman::NoHooks>::new(&t.env, "gadget").err().unwrap();
    assert!(matches!(err, Error::UnknownRealm { ref realm } if realm == "gadget"));
}

#[test]
fn test_composite_key_round_trip() {
    let t = widget_env(WIDGET_CONFIG);
    let key = ObjectKey::id("7").with("planid", "2");

    let mut slot: PersistentObject = PersistentObject::open(&t.env, "slot", key.clone()).unwrap();
    slot.set("status", "running").unwrap();
    slot.insert().unwrap();

    let other: PersistentObject =
        PersistentObject::open(&t.env, "slot", ObjectKey::id("7").with("planid", "3")).unwrap();
    assert!(!other.exists());

    let loaded: PersistentObject = PersistentObject::open(&t.env, "slot", key).unwrap();
    assert!(loaded.exists());
    assert_eq!(loaded.get_str("status"), "running");
    assert_eq!(loaded.key_string(), r#"{"id":"7","planid":"2"}"#);
}

// =============================================================================
// Assignment rules
// =============================================================================

#[test]
fn test_set_rejects_lists_and_unknown_fields() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");

    let err = w.set("name", vec!["a".to_string(), "b".to_string()]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedValue { .. }));

    let err = w.set("nope", "x").unwrap_err();
    assert!(matches!(err, Error::UnknownField { ref field, .. } if field == "nope"));
    assert!(!w.is_dirty());
}

#[test]
fn test_single_line_text_is_trimmed_textarea_is_not() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set("name", "  padded  ").unwrap();
    w.set("body", "  padded  ").unwrap();
    assert_eq!(w.get_str("name"), "padded");
    assert_eq!(w.get_str("body"), "  padded  ");
}

#[test]
fn test_reverting_a_field_clears_dirty() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "first");

    w.set("name", "second").unwrap();
    assert!(w.is_dirty());
    w.set("name", "first").unwrap();
    assert!(!w.is_dirty());
    assert!(!w.save_changes("alice", None).unwrap());
}

#[test]
fn test_populate_handles_checkbox_convention() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");

    let mut values = BTreeMap::new();
    values.insert("name".to_string(), "from form".to_string());
    values.insert("checkbox_active".to_string(), "on".to_string());
    values.insert("csrf_token".to_string(), "ignored".to_string());
    w.populate(&values).unwrap();

    assert_eq!(w.get_str("name"), "from form");
    assert_eq!(w.get_str("active"), "0");
    assert!(w.get("csrf_token").is_empty());
}

#[test]
fn test_get_value_or_default() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set_values([("owner", FieldValue::Empty)]);
    assert_eq!(w.get_value_or_default("owner"), FieldValue::from("qa"));
    assert_eq!(w.get_value_or_default("name"), FieldValue::Empty);
}

// =============================================================================
// Insert / save / delete
// =============================================================================

#[test]
fn test_insert_twice_is_invalid_state() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "once");
    let err = w.insert().unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(count_rows(&t.env, "widget"), 1);
}

#[test]
fn test_insert_without_key_is_invalid_state() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w: PersistentObject = PersistentObject::new(&t.env, "widget").unwrap();
    w.set("name", "keyless").unwrap();
    assert!(matches!(w.insert().unwrap_err(), Error::InvalidState { .. }));
}

#[test]
fn test_save_changes_on_new_object_is_invalid_state() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set("name", "never inserted").unwrap();
    assert!(matches!(w.save_changes("alice", None).unwrap_err(), Error::InvalidState { .. }));
}

#[test]
fn test_save_without_changes_is_a_no_op() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "steady");
    assert!(!w.save_changes("alice", None).unwrap());
    assert_eq!(count_rows(&t.env, "widget_change"), 0);

    // A comment alone still counts as a save
    assert!(w.save_changes("alice", Some("looked at it")).unwrap());
    assert_eq!(count_rows(&t.env, "widget_change"), 0);
}

#[test]
fn test_save_changes_writes_one_change_row_per_dirty_field() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "before");
    let when = now();

    w.set("name", "after").unwrap();
    w.set("color", "red").unwrap();
    assert!(w.save_changes_at("alice", Some("rename"), when).unwrap());

    let changes = w.list_changes().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|c| c.time == when && c.author == "alice"));

    let color = changes.iter().find(|c| c.field == "color").unwrap();
    assert_eq!(color.old_value, None);
    assert_eq!(color.new_value.as_deref(), Some("red"));
    let name = changes.iter().find(|c| c.field == "name").unwrap();
    assert_eq!(name.old_value.as_deref(), Some("before"));
    assert_eq!(name.new_value.as_deref(), Some("after"));

    let loaded = widget(&t.env, "1");
    assert_eq!(loaded.get_str("name"), "after");
    assert_eq!(loaded.get_str("color"), "red");
    assert_eq!(loaded.get("changetime"), &FieldValue::Time(when));
}

#[test]
fn test_change_records_serialize_with_rfc3339_time() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "before");
    let when = now();
    w.set("name", "after").unwrap();
    w.save_changes_at("alice", None, when).unwrap();

    let changes = w.list_changes().unwrap();
    let json = serde_json::to_value(&changes[0]).unwrap();
    assert_eq!(json["author"], "alice");
    assert_eq!(json["field"], "name");
    assert_eq!(json["old_value"], "before");
    let time: chrono::DateTime<chrono::Utc> = json["time"].as_str().unwrap().parse().unwrap();
    assert_eq!(time, when);
}

#[test]
fn test_changing_a_key_field_requires_save_as() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = insert_widget(&t.env, "1", "keyed");
    w.set("id", "2").unwrap();
    assert!(matches!(w.save_changes("alice", None).unwrap_err(), Error::InvalidState { .. }));
}

#[test]
fn test_unsetting_a_custom_field_removes_its_row() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set("notes", "remember").unwrap();
    w.insert().unwrap();
    assert_eq!(count_rows(&t.env, "widget_custom"), 1);

    w.set("notes", FieldValue::Empty).unwrap();
    w.save_changes("alice", None).unwrap();
    assert_eq!(count_rows(&t.env, "widget_custom"), 0);
    assert_eq!(widget(&t.env, "1").get("notes"), &FieldValue::Empty);
}

#[test]
fn test_delete_removes_base_custom_and_change_rows() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set("notes", "n").unwrap();
    w.insert().unwrap();
    w.set("notes", "m").unwrap();
    w.save_changes("alice", None).unwrap();
    insert_widget(&t.env, "2", "survivor");

    assert!(w.delete().unwrap());
    assert!(!w.exists());
    assert_eq!(count_rows(&t.env, "widget"), 1);
    assert_eq!(count_rows(&t.env, "widget_custom"), 0);
    assert_eq!(count_rows(&t.env, "widget_change"), 0);
    assert!(!widget(&t.env, "1").exists());
    assert!(widget(&t.env, "2").exists());
}

#[test]
fn test_save_as_copies_under_new_key() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = widget(&t.env, "1");
    w.set("name", "original").unwrap();
    w.set("color", "blue").unwrap();
    w.insert().unwrap();

    assert!(w.save_as(&ObjectKey::id("2")).unwrap());
    assert_eq!(w.key(), Some(&ObjectKey::id("2")));

    let original = widget(&t.env, "1");
    let copy = widget(&t.env, "2");
    assert!(original.exists());
    assert!(copy.exists());
    for field in ["name", "color", "owner"] {
        assert_eq!(original.get(field), copy.get(field), "field {}", field);
    }
    assert_eq!(copy.get_str("id"), "2");
}

#[test]
fn test_save_as_conflict_restores_object() {
    let t = widget_env(WIDGET_CONFIG);
    insert_widget(&t.env, "2", "occupant");
    let mut w = insert_widget(&t.env, "1", "mover");

    assert!(w.save_as(&ObjectKey::id("2")).is_err());
    assert_eq!(w.key(), Some(&ObjectKey::id("1")));
    assert_eq!(w.get_str("id"), "1");
    assert!(w.exists());
    assert_eq!(widget(&t.env, "2").get_str("name"), "occupant");
}

#[test]
fn test_custom_field_never_written_differs_from_saved_empty() {
    let t = widget_env(WIDGET_CONFIG);

    let mut unset = widget(&t.env, "1");
    unset.insert().unwrap();

    let mut blank = widget(&t.env, "2");
    blank.set("notes", "").unwrap();
    blank.insert().unwrap();

    assert_eq!(widget(&t.env, "1").get("notes"), &FieldValue::Empty);
    assert_eq!(widget(&t.env, "2").get("notes"), &FieldValue::from(""));
}

#[test]
fn test_schema_creation_is_idempotent() {
    let t = widget_env(WIDGET_CONFIG);
    insert_widget(&t.env, "1", "kept");
    let report = t.env.ensure_schema().unwrap();
    assert!(report.is_empty());
    assert!(widget(&t.env, "1").exists());
}

// =============================================================================
// Field catalog
// =============================================================================

#[test]
fn test_config_change_applies_after_reset_fields() {
    let t = widget_env(WIDGET_CONFIG);
    let catalog = t.env.catalog();
    let before = catalog.get_fields("widget").unwrap();
    assert!(before.iter().all(|f| f.name != "size"));

    // WIDGET_CONFIG ends inside [widget-custom]
    let extended = format!("{}size = \"text\"\n", WIDGET_CONFIG);
    catalog.set_config(Config::parse(&extended).unwrap());

    // Cached fields stay until they are reset
    let cached = catalog.get_fields("widget").unwrap();
    assert_eq!(cached.len(), before.len());
    assert!(widget(&t.env, "1").set("size", "XL").is_err());

    catalog.reset_fields();
    let after = catalog.get_fields("widget").unwrap();
    assert_eq!(after.len(), before.len() + 1);
    assert!(after.iter().any(|f| f.name == "size" && f.custom));

    let mut w = widget(&t.env, "1");
    w.set("size", "XL").unwrap();
    w.insert().unwrap();
    assert_eq!(widget(&t.env, "1").get_str("size"), "XL");
    // Settings outside the custom section are still read
    assert_eq!(widget(&t.env, "1").get_str("owner"), "qa");
}

// =============================================================================
// Matching
// =============================================================================

#[test]
fn test_list_matching_uses_set_fields_only() {
    let t = widget_env(WIDGET_CONFIG);
    for (id, owner) in [("1", "qa"), ("2", "dev"), ("3", "qa")] {
        let mut w = widget(&t.env, id);
        w.set("owner", owner).unwrap();
        w.insert().unwrap();
    }

    let mut template: PersistentObject = PersistentObject::new(&t.env, "widget").unwrap();
    template.set_values([("owner", FieldValue::Empty)]);
    let all: Vec<_> = template.list_matching().unwrap().iter().map(|o| o.unwrap()).collect();
    assert_eq!(all.len(), 3);

    template.set("owner", "qa").unwrap();
    let mut ids: Vec<String> = template
        .list_matching()
        .unwrap()
        .iter()
        .map(|o| o.unwrap().get_str("id").to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "3"]);
}

#[test]
fn test_list_matching_is_restartable() {
    let t = widget_env(WIDGET_CONFIG);
    insert_widget(&t.env, "1", "a");

    let mut template: PersistentObject = PersistentObject::new(&t.env, "widget").unwrap();
    template.set_values([("owner", FieldValue::Empty)]);
    let matches = template.list_matching().unwrap();
    assert_eq!(matches.iter().count(), 1);

    insert_widget(&t.env, "2", "b");
    assert_eq!(matches.iter().count(), 2);
    assert!(matches.iter().all(|o| o.unwrap().exists()));
}

// =============================================================================
// Hooks
// =============================================================================

#[derive(Default)]
struct Gate {
    allow_insert: bool,
    fail_post_insert: bool,
    calls: Vec<&'static str>,
}

impl ObjectHooks for Gate {
    fn pre_insert(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> testman::Result<bool> {
        self.calls.push("pre_insert");
        Ok(self.allow_insert)
    }

    fn post_insert(&mut self, obj: &Record, _conn: &mut SqliteConnection) -> testman::Result<()> {
        self.calls.push("post_insert");
        if self.fail_post_insert {
            return Err(Error::Config(format!("refusing {}", obj.key_string())));
        }
        Ok(())
    }

    fn post_fetch(&mut self, _obj: &Record, _conn: &mut SqliteConnection) -> testman::Result<()> {
        self.calls.push("post_fetch");
        Ok(())
    }
}

#[test]
fn test_pre_hook_veto_writes_nothing() {
    let t = widget_env(WIDGET_CONFIG);
    let mut w = PersistentObject::with_hooks(&t.env, "widget", Some(ObjectKey::id("1")), Gate::default()).unwrap();
    w.set("name", "blocked").unwrap();

    assert_eq!(w.insert().unwrap(), None);
    assert!(!w.exists());
    assert_eq!(w.hooks().calls, vec!["pre_insert"]);
    assert_eq!(count_rows(&t.env, "widget"), 0);
}

#[test]
fn test_failing_post_hook_rolls_back_insert() {
    let t = widget_env(WIDGET_CONFIG);
    let gate = Gate {
        allow_insert: true,
        fail_post_insert: true,
        calls: Vec::new(),
    };
    let mut w = PersistentObject::with_hooks(&t.env, "widget", Some(ObjectKey::id("1")), gate).unwrap();
    w.set("notes", "rolled back too").unwrap();

    assert!(w.insert().is_err());
    assert!(!w.exists());
    assert_eq!(count_rows(&t.env, "widget"), 0);
    assert_eq!(count_rows(&t.env, "widget_custom"), 0);
}

#[test]
fn test_post_fetch_runs_on_load() {
    let t = widget_env(WIDGET_CONFIG);
    insert_widget(&t.env, "1", "fetched");
    let w = PersistentObject::with_hooks(&t.env, "widget", Some(ObjectKey::id("1")), Gate::default()).unwrap();
    assert_eq!(w.hooks().calls, vec!["post_fetch"]);
}

// =============================================================================
// Listeners
// =============================================================================

#[test]
fn test_listeners_run_in_order_and_failures_do_not_undo_writes() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let first = Recorder {
        name: "first".into(),
        events: events.clone(),
        fail: true,
    };
    let second = Recorder {
        name: "second".into(),
        events: events.clone(),
        fail: false,
    };
    let t = widget_env_with_listeners(WIDGET_CONFIG, vec![Arc::new(first), Arc::new(second)]);

    let mut w = insert_widget(&t.env, "1", "watched");
    w.set("name", "renamed").unwrap();
    assert!(w.save_changes("bob", Some("why not")).unwrap());
    w.delete().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            r#"first created widget {"id":"1"}"#,
            r#"second created widget {"id":"1"}"#,
            r#"first changed widget {"id":"1"} by bob [name] why not"#,
            r#"second changed widget {"id":"1"} by bob [name] why not"#,
            r#"first deleted widget {"id":"1"}"#,
            r#"second deleted widget {"id":"1"}"#,
        ]
    );
}

// =============================================================================
// Dirty tracking properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_change_rows_match_net_changes(names in proptest::collection::vec("[a-c]{1,2}", 1..6)) {
        let t = widget_env(WIDGET_CONFIG);
        let mut w = insert_widget(&t.env, "1", "a");

        for name in &names {
            w.set("name", name.as_str()).unwrap();
        }
        let changed = names.last().map(|n| n != "a").unwrap_or(false);

        prop_assert_eq!(w.is_dirty(), changed);
        prop_assert_eq!(w.save_changes("prop", None).unwrap(), changed);
        let changes = w.list_changes().unwrap();
        prop_assert_eq!(changes.len(), usize::from(changed));
        if let Some(change) = changes.first() {
            prop_assert_eq!(change.old_value.as_deref(), Some("a"));
            prop_assert_eq!(change.new_value.as_deref(), names.last().map(String::as_str));
        }
    }
}

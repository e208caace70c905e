//! Integration tests for catalogs, test cases and plans

mod common;

use common::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use testman::testmanager::{self, IdKind, TestDescription, TESTCATALOG};
use testman::wiki::WikiPageVersion;
use testman::{
    DocumentStore, Environment, Error, ObjectKey, PersistentObject, SqliteWikiStore, WikiPageObject,
};

fn page(env: &Environment, name: &str) -> Option<WikiPageVersion> {
    let mut conn = env.db().get_conn().unwrap();
    SqliteWikiStore.load(&mut conn, name).unwrap()
}

#[test]
fn test_counters_are_seeded_and_advance() {
    let t = testman_env("");
    assert_eq!(testmanager::next_id(&t.env, IdKind::Catalog).unwrap(), "0");
    assert_eq!(testmanager::next_id(&t.env, IdKind::Catalog).unwrap(), "1");
    assert_eq!(testmanager::next_id(&t.env, IdKind::Catalog).unwrap(), "2");
    // Counters are independent
    assert_eq!(testmanager::next_id(&t.env, IdKind::Plan).unwrap(), "0");

    let counter: PersistentObject = PersistentObject::open(
        &t.env,
        "testconfig",
        ObjectKey::new().with("propname", IdKind::Catalog.property()),
    )
    .unwrap();
    assert_eq!(counter.get_str("value"), "3");
}

#[test]
fn test_root_page_is_created_with_schema() {
    let t = testman_env("");
    let root = page(&t.env, testmanager::ROOT_PAGE).unwrap();
    assert_eq!(root.author, "System");
    assert_eq!(root.ipnr.as_deref(), Some("127.0.0.1"));
}

#[test]
fn test_catalog_and_testcase_pages() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Checkout", "Everything about paying", "alice").unwrap();
    assert_eq!(catalog.get_str("page_name"), "TC_TT0");

    let tc = testmanager::create_testcase(&t.env, &catalog, "Pay by card", "Enter a card.\r\nPay.", "bob").unwrap();
    assert_eq!(tc.get_str("page_name"), "TC_TT0_TC0");

    let stored = page(&t.env, "TC_TT0_TC0").unwrap();
    assert_eq!(stored.text, "Pay by card\r\n\r\nEnter a card.\r\nPay.");
    assert_eq!(stored.author, "bob");
    assert_eq!(stored.version, 1);

    let reopened = testmanager::open_testcase(&t.env, "0").unwrap();
    assert!(reopened.exists());
    assert_eq!(reopened.title(), "Pay by card");
    assert_eq!(reopened.description(), "Enter a card.\r\nPay.");
    assert_eq!(reopened.hooks().wiki().author, "bob");

    let enclosing = testmanager::enclosing_catalog(&t.env, &reopened).unwrap();
    assert!(enclosing.exists());
    assert_eq!(enclosing.title(), "Checkout");
}

#[test]
fn test_editing_description_adds_page_version() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Search", "", "alice").unwrap();
    let mut tc = testmanager::create_testcase(&t.env, &catalog, "Find by name", "Type a name", "alice").unwrap();

    // Page-only changes need a comment to be saved
    tc.describe("Find by name", "Type a partial name", "carol");
    assert!(!tc.save_changes("carol", None).unwrap());
    assert_eq!(page(&t.env, tc.get_str("page_name")).unwrap().version, 1);

    assert!(tc.save_changes("carol", Some("clarified")).unwrap());
    let stored = page(&t.env, tc.get_str("page_name")).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.author, "carol");
    assert_eq!(stored.text, "Find by name\r\n\r\nType a partial name");
    assert_eq!(tc.hooks().wiki().page().map(|p| p.version), Some(2));
}

#[test]
fn test_deleting_testcase_removes_page() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Login", "", "alice").unwrap();
    let mut first = testmanager::create_testcase(&t.env, &catalog, "Valid password", "", "alice").unwrap();
    let mut second = testmanager::create_testcase(&t.env, &catalog, "Wrong password", "", "alice").unwrap();

    assert!(first.delete().unwrap());
    assert!(page(&t.env, "TC_TT0_TC0").is_none());
    assert!(!testmanager::open_testcase(&t.env, "0").unwrap().exists());

    second.hooks_mut().wiki_mut().delete_page = false;
    assert!(second.delete().unwrap());
    assert!(page(&t.env, "TC_TT0_TC1").is_some());
    assert_eq!(count_rows(&t.env, "testcase"), 0);
}

#[test]
fn test_delete_with_page_is_caller_controlled() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Profile", "", "alice").unwrap();
    testmanager::create_testcase(&t.env, &catalog, "Change avatar", "Upload", "alice").unwrap();
    testmanager::create_testcase(&t.env, &catalog, "Change name", "", "alice").unwrap();

    let mut kept_page =
        WikiPageObject::open_with_store(&t.env, "testcase", Some(ObjectKey::id("0")), Arc::new(SqliteWikiStore))
            .unwrap();
    assert_eq!(kept_page.page_text(), "Change avatar\r\n\r\nUpload");
    assert!(kept_page.delete_with_page(false).unwrap());
    assert!(!kept_page.exists());
    assert!(kept_page.hooks().delete_page);
    assert_eq!(page(&t.env, "TC_TT0_TC0").unwrap().text, "Change avatar\r\n\r\nUpload");
    assert!(!testmanager::open_testcase(&t.env, "0").unwrap().exists());
    assert_eq!(count_rows(&t.env, "testcase"), 1);

    let mut dropped_page =
        WikiPageObject::open_with_store(&t.env, "testcase", Some(ObjectKey::id("1")), Arc::new(SqliteWikiStore))
            .unwrap();
    assert!(dropped_page.delete_with_page(true).unwrap());
    assert!(page(&t.env, "TC_TT0_TC1").is_none());
    assert_eq!(count_rows(&t.env, "testcase"), 0);
}

#[test]
fn test_status_history_serializes_for_reports() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Checkout", "", "alice").unwrap();
    let tc = testmanager::create_testcase(&t.env, &catalog, "Pay by card", "", "alice").unwrap();
    let plan = testmanager::create_testplan(&t.env, &catalog, "Release 2.0", "alice").unwrap();
    let mut tcip = testmanager::add_to_plan(&t.env, &tc, &plan, "TO_BE_TESTED").unwrap();
    testmanager::set_status(&mut tcip, "FAILED", "bob").unwrap();

    let history = testmanager::list_history(&tcip).unwrap();
    let json = serde_json::to_value(&history).unwrap();
    assert_eq!(json[0]["author"], "bob");
    assert_eq!(json[0]["status"], "FAILED");
    let time: chrono::DateTime<chrono::Utc> = json[0]["time"].as_str().unwrap().parse().unwrap();
    assert_eq!(time, history[0].time);
}

#[test]
fn test_custom_fields_from_default_config() {
    let t = testman_env(testman::init::DEFAULT_CONFIG);
    let catalog = testmanager::create_catalog(&t.env, "Reports", "", "alice").unwrap();
    let mut tc = testmanager::create_testcase(&t.env, &catalog, "Export CSV", "", "alice").unwrap();

    tc.set("priority", "high").unwrap();
    assert!(tc.save_changes("alice", None).unwrap());
    let reopened = testmanager::open_testcase(&t.env, "0").unwrap();
    assert_eq!(reopened.get_str("priority"), "high");
    assert_eq!(count_rows(&t.env, "testcase_custom"), 1);
}

#[test]
fn test_plans_and_status_history() {
    let t = testman_env("");
    let catalog = testmanager::create_catalog(&t.env, "Checkout", "", "alice").unwrap();
    let other = testmanager::create_catalog(&t.env, "Search", "", "alice").unwrap();
    let tc = testmanager::create_testcase(&t.env, &catalog, "Pay by card", "", "alice").unwrap();

    let plan = testmanager::create_testplan(&t.env, &catalog, "Release 2.0", "alice").unwrap();
    assert!(testmanager::plan_created(&plan).is_some());
    assert_eq!(plan.get_str("page_name"), "TC_TT0");

    let plans = testmanager::list_testplans(&t.env, &catalog).unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].get_str("name"), "Release 2.0");
    assert!(testmanager::list_testplans(&t.env, &other).unwrap().is_empty());

    let mut tcip = testmanager::add_to_plan(&t.env, &tc, &plan, "TO_BE_TESTED").unwrap();
    assert!(tcip.exists());
    assert!(testmanager::list_history(&tcip).unwrap().is_empty());

    testmanager::set_status(&mut tcip, "FAILED", "bob").unwrap();
    std::thread::sleep(Duration::from_millis(2));
    testmanager::set_status(&mut tcip, "SUCCESSFUL", "carol").unwrap();

    let history = testmanager::list_history(&tcip).unwrap();
    let statuses: Vec<(&str, &str)> = history.iter().map(|h| (h.author.as_str(), h.status.as_str())).collect();
    assert_eq!(statuses, vec![("carol", "SUCCESSFUL"), ("bob", "FAILED")]);
    assert!(history[0].time > history[1].time);

    let reopened = testmanager::open_testcaseinplan(&t.env, "0", "0").unwrap();
    assert_eq!(reopened.get_str("status"), "SUCCESSFUL");
    assert_eq!(reopened.list_changes().unwrap().len(), 2);
}

#[test]
fn test_move_testcase_between_catalogs() {
    let t = testman_env("");
    let source = testmanager::create_catalog(&t.env, "Old", "", "alice").unwrap();
    let target = testmanager::create_catalog(&t.env, "New", "", "alice").unwrap();
    let mut tc = testmanager::create_testcase(&t.env, &source, "Moved case", "Steps", "alice").unwrap();
    let plan = testmanager::create_testplan(&t.env, &source, "Plan", "alice").unwrap();
    testmanager::add_to_plan(&t.env, &tc, &plan, "TO_BE_TESTED").unwrap();

    testmanager::move_testcase(&t.env, &mut tc, &target, "dave").unwrap();

    assert_eq!(tc.get_str("page_name"), "TC_TT1_TC0");
    assert!(page(&t.env, "TC_TT0_TC0").is_none());
    let moved = page(&t.env, "TC_TT1_TC0").unwrap();
    assert_eq!(moved.text, "Moved case\r\n\r\nSteps");
    assert_eq!(moved.comment.as_deref(), Some("Moved from TC_TT0_TC0"));
    assert_eq!(count_rows(&t.env, "testcaseinplan"), 0);

    let reopened = testmanager::open_testcase(&t.env, "0").unwrap();
    assert_eq!(testmanager::enclosing_catalog(&t.env, &reopened).unwrap().get_str("id"), "1");
    let changes = reopened.list_changes().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].field, "page_name");
    assert_eq!(changes[0].author, "dave");
}

struct OfflineStore;

impl DocumentStore for OfflineStore {
    fn install(&self, _conn: &mut SqliteConnection) -> testman::Result<()> {
        Ok(())
    }

    fn load(&self, _conn: &mut SqliteConnection, _name: &str) -> testman::Result<Option<WikiPageVersion>> {
        Ok(None)
    }

    fn save(
        &self,
        _conn: &mut SqliteConnection,
        _name: &str,
        _text: &str,
        _author: &str,
        _remote_addr: Option<&str>,
        _comment: Option<&str>,
    ) -> testman::Result<i32> {
        Err(Error::Connection("document store is offline".to_string()))
    }

    fn delete(&self, _conn: &mut SqliteConnection, _name: &str) -> testman::Result<bool> {
        Ok(false)
    }
}

#[test]
fn test_page_failure_rolls_back_object() {
    let t = testman_env("");
    let mut catalog = PersistentObject::with_hooks(
        &t.env,
        TESTCATALOG,
        Some(ObjectKey::id("42")),
        TestDescription::new(Arc::new(OfflineStore)),
    )
    .unwrap();
    catalog.set("page_name", "TC_TT42").unwrap();
    catalog.describe("Unreachable", "", "alice");

    let err = catalog.insert().unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(!catalog.exists());
    assert_eq!(count_rows(&t.env, "testcatalog"), 0);
}

#[test]
fn test_wiki_object_requires_page_name() {
    let t = testman_env("");
    let mut catalog = testmanager::open_catalog(&t.env, "7").unwrap();
    catalog.describe("No page", "", "alice");
    assert!(matches!(catalog.insert(), Err(Error::InvalidState { .. })));
}

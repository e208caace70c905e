//! Test management realms: catalogs, test cases, plans and execution status
//!
//! Catalogs and test cases are wiki-backed: their title and description
//! live in a page (`TC_TT<id>` for catalogs, `<catalog page>_TC<id>` for
//! test cases). Plans pick test cases from a catalog; each test case in a
//! plan carries a status whose changes are kept in `testcasehistory`.

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::fields::{FieldDescriptor, RealmMetadata};
use crate::object::{ObjectHooks, PersistentObject, Record};
use crate::provider::ClassProvider;
use crate::registrar::{Column, RealmSchema};
use crate::schema::{testcasehistory, testconfig};
use crate::value::{from_timestamp, now, to_timestamp, FieldValue, ObjectKey};
use crate::wiki::{DocumentStore, SqliteWikiStore, WikiPageHooks};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

pub const TESTCONFIG: &str = "testconfig";
pub const TESTCATALOG: &str = "testcatalog";
pub const TESTCASE: &str = "testcase";
pub const TESTCASEINPLAN: &str = "testcaseinplan";
pub const TESTCASEHISTORY: &str = "testcasehistory";
pub const TESTPLAN: &str = "testplan";

/// Page holding the root catalog
pub const ROOT_PAGE: &str = "TC";

const CRLF: &str = "\r\n";

// ============================================================================
// Id counters
// ============================================================================

/// Kind of object numbered by a `testconfig` counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Catalog,
    TestCase,
    Plan,
}

impl IdKind {
    pub fn property(&self) -> &'static str {
        match self {
            IdKind::Catalog => "NEXT_CATALOG_ID",
            IdKind::TestCase => "NEXT_TESTCASE_ID",
            IdKind::Plan => "NEXT_PLAN_ID",
        }
    }
}

/// Take the next id of a kind. Ids start at `0`.
pub fn next_id(env: &Environment, kind: IdKind) -> Result<String> {
    let propname = kind.property();
    env.db().transaction(|conn| {
        let current: Option<Option<String>> = testconfig::table
            .filter(testconfig::propname.eq(propname))
            .select(testconfig::value)
            .first(conn)
            .optional()?;
        let latest = current.flatten().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| "0".to_string());
        let n: i64 = latest
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("counter {} holds a non-numeric value '{}'", propname, latest)))?;

        diesel::replace_into(testconfig::table)
            .values((testconfig::propname.eq(propname), testconfig::value.eq(Some((n + 1).to_string()))))
            .execute(conn)?;
        Ok(latest)
    })
}

// ============================================================================
// Catalogs and test cases
// ============================================================================

/// Hooks of catalogs and test cases: the page text is the title, a blank
/// line, and the description.
#[derive(Default)]
pub struct TestDescription {
    wiki: WikiPageHooks,
    pub title: String,
    pub description: String,
}

impl TestDescription {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            wiki: WikiPageHooks::new(store),
            title: String::new(),
            description: String::new(),
        }
    }

    pub fn wiki(&self) -> &WikiPageHooks {
        &self.wiki
    }

    pub fn wiki_mut(&mut self) -> &mut WikiPageHooks {
        &mut self.wiki
    }

    pub fn page_text(&self) -> String {
        format!("{}{}{}{}", self.title, CRLF, CRLF, self.description)
    }
}

/// Split page text into title and description
pub fn parse_page_text(text: &str) -> (String, String) {
    let text = text.replace(CRLF, "\n");
    match text.split_once("\n\n") {
        Some((title, description)) => (title.trim().to_string(), description.replace('\n', CRLF)),
        None => match text.split_once('\n') {
            Some((title, rest)) => (title.trim().to_string(), rest.trim_start().replace('\n', CRLF)),
            None => (text.trim().to_string(), String::new()),
        },
    }
}

impl ObjectHooks for TestDescription {
    fn post_fetch(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<()> {
        self.wiki.post_fetch(obj, conn)?;
        if let Some(page) = self.wiki.page() {
            let (title, description) = parse_page_text(&page.text);
            self.title = title;
            self.description = description;
            self.wiki.author = page.author.clone();
        }
        Ok(())
    }

    fn pre_insert(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        self.wiki.text = Some(self.page_text());
        self.wiki.pre_insert(obj, conn)
    }

    fn pre_save_changes(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        self.wiki.text = Some(self.page_text());
        self.wiki.pre_save_changes(obj, conn)
    }

    fn pre_delete(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        self.wiki.pre_delete(obj, conn)
    }
}

pub type TestCatalog = PersistentObject<TestDescription>;
pub type TestCase = PersistentObject<TestDescription>;
pub type TestCaseInPlan = PersistentObject;
pub type TestPlan = PersistentObject;

impl PersistentObject<TestDescription> {
    pub fn title(&self) -> &str {
        &self.hooks().title
    }

    pub fn description(&self) -> &str {
        &self.hooks().description
    }

    /// Stage title and description for the next insert or save
    pub fn describe(&mut self, title: &str, description: &str, author: &str) {
        let hooks = self.hooks_mut();
        hooks.title = title.trim().to_string();
        hooks.description = description.to_string();
        hooks.wiki_mut().author = author.to_string();
    }
}

pub fn open_catalog(env: &Environment, id: &str) -> Result<TestCatalog> {
    PersistentObject::open(env, TESTCATALOG, ObjectKey::id(id))
}

pub fn open_testcase(env: &Environment, id: &str) -> Result<TestCase> {
    PersistentObject::open(env, TESTCASE, ObjectKey::id(id))
}

pub fn open_testplan(env: &Environment, id: &str) -> Result<TestPlan> {
    PersistentObject::open(env, TESTPLAN, ObjectKey::id(id))
}

pub fn open_testcaseinplan(env: &Environment, id: &str, planid: &str) -> Result<TestCaseInPlan> {
    PersistentObject::open(env, TESTCASEINPLAN, ObjectKey::id(id).with("planid", planid))
}

/// Create a catalog below the root page
pub fn create_catalog(env: &Environment, title: &str, description: &str, author: &str) -> Result<TestCatalog> {
    let id = next_id(env, IdKind::Catalog)?;
    let mut catalog = open_catalog(env, &id)?;
    catalog.set("page_name", format!("{}_TT{}", ROOT_PAGE, id))?;
    catalog.describe(title, description, author);
    catalog.insert()?;
    tracing::info!("created catalog {} ({})", id, catalog.get_str("page_name"));
    Ok(catalog)
}

/// Create a test case inside `catalog`
pub fn create_testcase(
    env: &Environment,
    catalog: &TestCatalog,
    title: &str,
    description: &str,
    author: &str,
) -> Result<TestCase> {
    let id = next_id(env, IdKind::TestCase)?;
    let mut testcase = open_testcase(env, &id)?;
    testcase.set("page_name", format!("{}_TC{}", catalog.get_str("page_name"), id))?;
    testcase.describe(title, description, author);
    testcase.insert()?;
    tracing::info!("created test case {} ({})", id, testcase.get_str("page_name"));
    Ok(testcase)
}

/// Catalog a test case belongs to, derived from its page name
pub fn enclosing_catalog(env: &Environment, testcase: &TestCase) -> Result<TestCatalog> {
    let page_name = testcase.get_str("page_name");
    let catalog_page = page_name.rsplit_once("_TC").map(|(c, _)| c).unwrap_or(page_name);
    let catalog_id = catalog_page.rsplit_once("TT").map(|(_, id)| id).unwrap_or("");
    open_catalog(env, catalog_id)
}

/// Move a test case into another catalog: its page is renamed and it is
/// removed from every plan.
pub fn move_testcase(env: &Environment, testcase: &mut TestCase, target: &TestCatalog, author: &str) -> Result<()> {
    let old_page = testcase.get_str("page_name").to_string();
    let id = testcase.get_str("id").to_string();
    let new_page = format!("{}_TC{}", target.get_str("page_name"), id);

    let mut template: TestCaseInPlan = PersistentObject::new(env, TESTCASEINPLAN)?;
    template.set("id", id.as_str())?;
    for tcip in template.list_matching()?.iter() {
        tcip?.delete()?;
    }

    testcase.set("page_name", new_page.as_str())?;
    testcase.hooks_mut().wiki_mut().author = author.to_string();
    testcase.hooks_mut().wiki_mut().comment = Some(format!("Moved from {}", old_page));
    testcase.save_changes(author, Some("Moved"))?;
    testcase.hooks_mut().wiki_mut().comment = None;

    let store = testcase.hooks().wiki().store().clone();
    env.db().transaction(|conn| store.delete(conn, &old_page))?;
    tracing::info!("moved test case {} from {} to {}", id, old_page, new_page);
    Ok(())
}

// ============================================================================
// Plans
// ============================================================================

/// Create a plan over the test cases of `catalog`
pub fn create_testplan(env: &Environment, catalog: &TestCatalog, name: &str, author: &str) -> Result<TestPlan> {
    let id = next_id(env, IdKind::Plan)?;
    let mut plan = open_testplan(env, &id)?;
    plan.set("catid", catalog.get_str("id"))?;
    plan.set("page_name", catalog.get_str("page_name"))?;
    plan.set("name", name)?;
    plan.set("author", author)?;
    plan.insert()?;
    Ok(plan)
}

/// Plans created for a catalog
pub fn list_testplans(env: &Environment, catalog: &TestCatalog) -> Result<Vec<TestPlan>> {
    let mut template: TestPlan = PersistentObject::new(env, TESTPLAN)?;
    template.set("catid", catalog.get_str("id"))?;
    template.list_matching()?.iter().collect()
}

/// Put a test case into a plan with an initial status
pub fn add_to_plan(env: &Environment, testcase: &TestCase, plan: &TestPlan, status: &str) -> Result<TestCaseInPlan> {
    let mut tcip = open_testcaseinplan(env, testcase.get_str("id"), plan.get_str("id"))?;
    tcip.set("page_name", testcase.get_str("page_name"))?;
    tcip.set("status", status)?;
    tcip.insert()?;
    Ok(tcip)
}

/// One entry of a test case's status history within a plan
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatusChange {
    pub time: DateTime<Utc>,
    pub author: String,
    pub status: String,
}

/// Change the status of a test case in a plan and record it in the
/// status history. A stored object is saved right away.
pub fn set_status(tcip: &mut TestCaseInPlan, status: &str, author: &str) -> Result<()> {
    tcip.set("status", status)?;

    let id = tcip.get_str("id").to_string();
    let planid = tcip.get_str("planid").to_string();
    let when = to_timestamp(&now());
    tcip.env().db().transaction(|conn| {
        diesel::insert_into(testcasehistory::table)
            .values((
                testcasehistory::id.eq(&id),
                testcasehistory::planid.eq(&planid),
                testcasehistory::time.eq(when),
                testcasehistory::author.eq(Some(author)),
                testcasehistory::status.eq(Some(status)),
            ))
            .execute(conn)?;
        Ok(())
    })?;

    if tcip.exists() {
        tcip.save_changes(author, None)?;
    }
    Ok(())
}

/// Status history of a test case in a plan, newest first
pub fn list_history(tcip: &TestCaseInPlan) -> Result<Vec<StatusChange>> {
    let mut conn = tcip.env().db().get_conn()?;
    let rows: Vec<(i64, Option<String>, Option<String>)> = testcasehistory::table
        .filter(testcasehistory::id.eq(tcip.get_str("id")))
        .filter(testcasehistory::planid.eq(tcip.get_str("planid")))
        .order(testcasehistory::time.desc())
        .select((testcasehistory::time, testcasehistory::author, testcasehistory::status))
        .load(&mut conn)?;

    Ok(rows
        .into_iter()
        .filter_map(|(time, author, status)| {
            Some(StatusChange {
                time: from_timestamp(time)?,
                author: author.unwrap_or_default(),
                status: status.unwrap_or_default(),
            })
        })
        .collect())
}

// ============================================================================
// Provider
// ============================================================================

/// Class provider of the test management realms
pub struct TestManagerProvider {
    store: Arc<dyn DocumentStore>,
}

impl Default for TestManagerProvider {
    fn default() -> Self {
        Self::new(Arc::new(SqliteWikiStore))
    }
}

impl TestManagerProvider {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

impl ClassProvider for TestManagerProvider {
    fn realms(&self) -> Vec<String> {
        [TESTCONFIG, TESTCATALOG, TESTCASE, TESTCASEINPLAN, TESTCASEHISTORY, TESTPLAN]
            .iter()
            .map(|r| r.to_string())
            .collect()
    }

    fn schemas(&self) -> Vec<RealmSchema> {
        vec![
            RealmSchema::declare(
                TESTCONFIG,
                &["propname"],
                vec![Column::text("propname"), Column::text("value")],
                false,
                false,
            ),
            RealmSchema::declare(TESTCATALOG, &["id"], vec![Column::text("page_name")], true, true),
            RealmSchema::declare(TESTCASE, &["id"], vec![Column::text("page_name")], true, true),
            RealmSchema::declare(
                TESTCASEINPLAN,
                &["id", "planid"],
                vec![Column::text("page_name"), Column::text("status")],
                true,
                true,
            ),
            RealmSchema::declare(
                TESTCASEHISTORY,
                &["id", "planid", "time"],
                vec![
                    Column::text("id"),
                    Column::text("planid"),
                    Column::int64("time"),
                    Column::text("author"),
                    Column::text("status"),
                ],
                false,
                false,
            ),
            RealmSchema::declare(
                TESTPLAN,
                &["id"],
                vec![
                    Column::text("catid"),
                    Column::text("page_name"),
                    Column::text("name"),
                    Column::text("author"),
                    Column::int64("time"),
                ],
                true,
                true,
            ),
        ]
    }

    fn fields(&self, realm: &str) -> Vec<FieldDescriptor> {
        let id = || FieldDescriptor::text("id", "ID");
        let page = || FieldDescriptor::text("page_name", "Wiki page name");
        match realm {
            TESTCONFIG => vec![
                FieldDescriptor::text("propname", "Property name"),
                FieldDescriptor::text("value", "Property value"),
            ],
            TESTCATALOG | TESTCASE => vec![id(), page()],
            TESTCASEINPLAN => vec![
                id(),
                FieldDescriptor::text("planid", "Plan ID"),
                page(),
                FieldDescriptor::text("status", "Status"),
            ],
            TESTCASEHISTORY => vec![
                id(),
                FieldDescriptor::text("planid", "Plan ID"),
                FieldDescriptor::time("time", "Time"),
                FieldDescriptor::text("author", "Author"),
                FieldDescriptor::text("status", "Status"),
            ],
            TESTPLAN => vec![
                id(),
                FieldDescriptor::text("catid", "Catalog ID"),
                page(),
                FieldDescriptor::text("name", "Name"),
                FieldDescriptor::text("author", "Author"),
                FieldDescriptor::time("time", "Created"),
            ],
            _ => Vec::new(),
        }
    }

    fn metadata(&self, realm: &str) -> RealmMetadata {
        let (label, searchable, tracked) = match realm {
            TESTCONFIG => ("Test Configuration", false, false),
            TESTCATALOG => ("Test Catalog", true, true),
            TESTCASE => ("Test Case", true, true),
            TESTCASEINPLAN => ("Test Case in a Plan", false, true),
            TESTCASEHISTORY => ("Test Case History", false, false),
            _ => ("Test Plan", true, true),
        };
        RealmMetadata {
            label: label.to_string(),
            searchable,
            has_custom: tracked,
            has_change: tracked,
        }
    }

    fn protected_fields(&self, realm: &str) -> Vec<String> {
        let names: &[&str] = match realm {
            TESTCATALOG | TESTCASE => &["id", "page_name"],
            TESTCASEINPLAN => &["id", "planid", "page_name", "status"],
            TESTPLAN => &["id", "catid", "page_name", "name", "author", "time"],
            _ => &[],
        };
        names.iter().map(|n| n.to_string()).collect()
    }

    fn seed(&self, realm: &str, conn: &mut SqliteConnection) -> Result<()> {
        match realm {
            TESTCONFIG => {
                for kind in [IdKind::Catalog, IdKind::TestCase, IdKind::Plan] {
                    diesel::insert_into(testconfig::table)
                        .values((testconfig::propname.eq(kind.property()), testconfig::value.eq(Some("0"))))
                        .execute(conn)?;
                }
            }
            TESTCATALOG => {
                self.store.install(conn)?;
                self.store.save(conn, ROOT_PAGE, " ", "System", Some("127.0.0.1"), None)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Value of a test plan's creation time, if recorded
pub fn plan_created(plan: &TestPlan) -> Option<DateTime<Utc>> {
    match plan.get("time") {
        FieldValue::Time(t) => Some(*t),
        _ => None,
    }
}

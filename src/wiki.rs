//! Wiki-page-backed objects
//!
//! A [`WikiPageObject`] owns a text document named by its `page_name`
//! field. The page is written before the object row on insert and update,
//! and removed before the row on delete, so a failed page write leaves the
//! object untouched.

use crate::db::execute;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::object::{ObjectHooks, PersistentObject, Record};
use crate::schema::wiki;
use crate::value::{from_timestamp, now, to_timestamp, ObjectKey};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

/// One stored version of a page
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, serde::Serialize)]
#[diesel(table_name = wiki)]
pub struct WikiPageVersion {
    pub name: String,
    pub version: i32,
    pub time: i64,
    pub author: String,
    pub ipnr: Option<String>,
    pub text: String,
    pub comment: Option<String>,
}

impl WikiPageVersion {
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        from_timestamp(self.time)
    }
}

#[derive(Insertable)]
#[diesel(table_name = wiki)]
struct NewWikiPageVersion<'a> {
    name: &'a str,
    version: i32,
    time: i64,
    author: &'a str,
    ipnr: Option<&'a str>,
    text: &'a str,
    comment: Option<&'a str>,
}

/// Storage of named, versioned text documents.
///
/// Every call gets the connection of the surrounding transaction so page
/// writes commit or roll back together with the object row.
pub trait DocumentStore: Send + Sync {
    /// Create the backing storage when missing
    fn install(&self, conn: &mut SqliteConnection) -> Result<()>;

    /// Latest version of a page, `None` when the page does not exist
    fn load(&self, conn: &mut SqliteConnection, name: &str) -> Result<Option<WikiPageVersion>>;

    /// Store `text` as the next version of a page and return that version.
    /// Saving unchanged text keeps the current version.
    fn save(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        text: &str,
        author: &str,
        remote_addr: Option<&str>,
        comment: Option<&str>,
    ) -> Result<i32>;

    /// Remove every version of a page. Returns whether anything was removed.
    fn delete(&self, conn: &mut SqliteConnection, name: &str) -> Result<bool>;
}

/// Versioned `wiki` table in the object database
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteWikiStore;

const WIKI_DDL: &str = "CREATE TABLE IF NOT EXISTS \"wiki\" (
    \"name\" TEXT NOT NULL,
    \"version\" INTEGER NOT NULL,
    \"time\" INTEGER NOT NULL,
    \"author\" TEXT NOT NULL,
    \"ipnr\" TEXT,
    \"text\" TEXT NOT NULL,
    \"comment\" TEXT,
    PRIMARY KEY (\"name\", \"version\")
)";

impl DocumentStore for SqliteWikiStore {
    fn install(&self, conn: &mut SqliteConnection) -> Result<()> {
        execute(conn, WIKI_DDL, vec![])?;
        Ok(())
    }

    fn load(&self, conn: &mut SqliteConnection, name: &str) -> Result<Option<WikiPageVersion>> {
        Ok(wiki::table
            .filter(wiki::name.eq(name))
            .order(wiki::version.desc())
            .select(WikiPageVersion::as_select())
            .first(conn)
            .optional()?)
    }

    fn save(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        text: &str,
        author: &str,
        remote_addr: Option<&str>,
        comment: Option<&str>,
    ) -> Result<i32> {
        let current = self.load(conn, name)?;
        if let Some(page) = &current {
            if page.text == text {
                tracing::debug!("page {} not modified", name);
                return Ok(page.version);
            }
        }

        let version = current.map(|p| p.version + 1).unwrap_or(1);
        diesel::insert_into(wiki::table)
            .values(&NewWikiPageVersion {
                name,
                version,
                time: to_timestamp(&now()),
                author,
                ipnr: remote_addr,
                text,
                comment,
            })
            .execute(conn)?;
        tracing::debug!("saved page {} version {}", name, version);
        Ok(version)
    }

    fn delete(&self, conn: &mut SqliteConnection, name: &str) -> Result<bool> {
        let removed = diesel::delete(wiki::table.filter(wiki::name.eq(name))).execute(conn)?;
        tracing::debug!("deleted page {} ({} versions)", name, removed);
        Ok(removed > 0)
    }
}

/// Hooks keeping a page in lockstep with its object.
///
/// Set [`Self::text`], [`Self::author`] and optionally
/// [`Self::remote_addr`] before inserting or saving.
pub struct WikiPageHooks {
    store: Arc<dyn DocumentStore>,
    pub text: Option<String>,
    pub author: String,
    pub remote_addr: Option<String>,
    pub comment: Option<String>,
    /// Whether deleting the object also deletes its page
    pub delete_page: bool,
    page: Option<WikiPageVersion>,
}

impl Default for WikiPageHooks {
    fn default() -> Self {
        Self::new(Arc::new(SqliteWikiStore))
    }
}

impl WikiPageHooks {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            text: None,
            author: "anonymous".to_string(),
            remote_addr: None,
            comment: None,
            delete_page: true,
            page: None,
        }
    }

    /// Page as last loaded or written
    pub fn page(&self) -> Option<&WikiPageVersion> {
        self.page.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn page_name(obj: &Record) -> Result<String> {
        match obj.get("page_name").as_str() {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(Error::invalid_state(
                obj.realm(),
                obj.key_string(),
                "page_name must be set on a wiki-backed object",
            )),
        }
    }

    fn write_page(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<()> {
        let name = Self::page_name(obj)?;
        let text = match &self.text {
            Some(text) => text.clone(),
            None => self.page.as_ref().map(|p| p.text.clone()).unwrap_or_default(),
        };
        self.store.save(
            conn,
            &name,
            &text,
            &self.author,
            self.remote_addr.as_deref(),
            self.comment.as_deref(),
        )?;
        self.page = self.store.load(conn, &name)?;
        Ok(())
    }
}

impl ObjectHooks for WikiPageHooks {
    fn post_fetch(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<()> {
        self.page = match obj.get("page_name").as_str() {
            Some(name) if !name.is_empty() => self.store.load(conn, name)?,
            _ => None,
        };
        Ok(())
    }

    fn pre_insert(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        self.write_page(obj, conn)?;
        Ok(true)
    }

    fn pre_save_changes(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        self.write_page(obj, conn)?;
        Ok(true)
    }

    fn pre_delete(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        if self.delete_page {
            let name = Self::page_name(obj)?;
            self.store.delete(conn, &name)?;
        }
        self.page = None;
        Ok(true)
    }
}

/// Persistent object coupled to a wiki page through its `page_name` field
pub type WikiPageObject = PersistentObject<WikiPageHooks>;

impl PersistentObject<WikiPageHooks> {
    /// Open with a custom document store
    pub fn open_with_store(
        env: &Environment,
        realm: &str,
        key: Option<ObjectKey>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        Self::with_hooks(env, realm, key, WikiPageHooks::new(store))
    }

    /// Current page text, `""` when the page does not exist
    pub fn page_text(&self) -> &str {
        self.hooks().page().map(|p| p.text.as_str()).unwrap_or("")
    }

    /// Stage the page text and author for the next insert or save
    pub fn stage_text(&mut self, text: impl Into<String>, author: &str) {
        let hooks = self.hooks_mut();
        hooks.text = Some(text.into());
        hooks.author = author.to_string();
    }

    /// Delete the object, optionally keeping its page
    pub fn delete_with_page(&mut self, delete_page: bool) -> Result<bool> {
        self.hooks_mut().delete_page = delete_page;
        let deleted = self.delete();
        self.hooks_mut().delete_page = true;
        deleted
    }
}

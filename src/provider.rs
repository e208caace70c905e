//! Class providers: components that contribute realms to the object layer

use crate::error::Result;
use crate::fields::{FieldDescriptor, RealmMetadata};
use crate::registrar::RealmSchema;
use diesel::sqlite::SqliteConnection;

/// A component implementing concrete classes on top of the generic
/// persistent-object framework.
///
/// The framework only queries providers; it never mutates what they return.
pub trait ClassProvider: Send + Sync {
    /// Realm names served by this provider
    fn realms(&self) -> Vec<String>;

    /// Table declarations for every realm of this provider
    fn schemas(&self) -> Vec<RealmSchema>;

    /// Standard fields of one realm, in display order
    fn fields(&self, realm: &str) -> Vec<FieldDescriptor>;

    fn metadata(&self, realm: &str) -> RealmMetadata;

    /// Fields only the owning component may change. They never receive
    /// configured defaults.
    fn protected_fields(&self, _realm: &str) -> Vec<String> {
        Vec::new()
    }

    /// Seed realm-specific rows right after the realm's base table was
    /// created, inside the creating transaction.
    fn seed(&self, _realm: &str, _conn: &mut SqliteConnection) -> Result<()> {
        Ok(())
    }
}

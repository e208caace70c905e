//! Resource workflow state machine
//!
//! Workflows are declared per resource realm in a `<realm>-resource_workflow`
//! configuration section:
//!
//! ```toml
//! [testcaseinplan-resource_workflow]
//! submit = "draft -> review"
//! "submit.permissions" = "EDIT"
//! "submit.operations" = "notify"
//! "submit.default" = 5
//! publish = "review -> published"
//! "publish.name" = "Publish"
//! reopen = "* -> draft"
//! ```
//!
//! The current state of each resource is itself a persistent object in the
//! `resourceworkflowstate` realm. A resource without a state row is in the
//! `new` state; the row is created by its first transition.

use crate::config::Section;
use crate::db::{execute, json_columns, load_json_rows, quote_ident, SqlParam};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::fields::{FieldDescriptor, RealmMetadata};
use crate::object::{ObjectHooks, PersistentObject, Record};
use crate::provider::ClassProvider;
use crate::registrar::{Column, RealmSchema};
use crate::value::ObjectKey;
use diesel::sqlite::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

pub const WORKFLOW_REALM: &str = "resourceworkflowstate";
pub const INITIAL_STATE: &str = "new";
const SECTION_SUFFIX: &str = "-resource_workflow";

// ============================================================================
// Model
// ============================================================================

/// A resource whose state is tracked by a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub realm: String,
    pub id: String,
}

impl Resource {
    pub fn new(realm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            id: id.into(),
        }
    }

    fn state_key(&self) -> ObjectKey {
        ObjectKey::id(self.id.as_str()).with("res_realm", self.realm.as_str())
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.realm, self.id)
    }
}

/// Persisted workflow state of one resource
pub struct ResourceWorkflowState {
    obj: PersistentObject<StateGuard>,
}

impl ResourceWorkflowState {
    pub fn open(env: &Environment, resource: &Resource) -> Result<Self> {
        let obj = PersistentObject::open(env, WORKFLOW_REALM, resource.state_key())?;
        Ok(Self { obj })
    }

    /// Current state; `new` when no row exists
    pub fn state(&self) -> &str {
        match self.obj.get("state").as_str() {
            Some(state) if self.obj.exists() && !state.is_empty() => state,
            _ => INITIAL_STATE,
        }
    }

    pub fn exists(&self) -> bool {
        self.obj.exists()
    }

    pub fn object(&self) -> &PersistentObject<StateGuard> {
        &self.obj
    }

    /// Write `new_state`, provided the stored state is still `expected`.
    ///
    /// The check and the write share one transaction, so of two sessions
    /// moving the same resource out of `expected` only the first commits.
    fn move_to(&mut self, resource: &Resource, expected: &str, new_state: &str, author: &str) -> Result<()> {
        self.obj.hooks_mut().expected = Some(expected.to_string());
        self.obj.set("state", new_state)?;
        let written = if self.obj.exists() {
            self.obj.save_changes(author, Some("State changed")).map(|_| ())
        } else {
            self.obj.insert().map(|_| ())
        };
        match written {
            // Another session created the row first
            Err(e) if e.is_unique_violation() => {
                let latest = ResourceWorkflowState::open(self.obj.env(), resource)?;
                Err(Error::ConcurrentModification {
                    realm: resource.realm.clone(),
                    id: resource.id.clone(),
                    expected: expected.to_string(),
                    actual: latest.state().to_string(),
                })
            }
            other => other,
        }
    }
}

/// Hooks of the state object: an update only applies while the row still
/// holds the state it was read in.
#[derive(Debug, Default)]
pub struct StateGuard {
    expected: Option<String>,
}

impl ObjectHooks for StateGuard {
    fn pre_save_changes(&mut self, obj: &Record, conn: &mut SqliteConnection) -> Result<bool> {
        let Some(expected) = self.expected.as_deref() else {
            return Ok(true);
        };
        let id = obj.get("id").as_str().unwrap_or_default();
        let res_realm = obj.get("res_realm").as_str().unwrap_or_default();

        // Taking the write lock first makes a racing session wait here
        let sql = format!(
            "UPDATE {} SET \"state\"=? WHERE \"id\"=? AND \"res_realm\"=? AND ifnull(nullif(\"state\", ''), ?)=?",
            quote_ident(WORKFLOW_REALM)
        );
        let params = vec![
            SqlParam::from(obj.get("state")),
            SqlParam::text(id),
            SqlParam::text(res_realm),
            SqlParam::text(INITIAL_STATE),
            SqlParam::text(expected),
        ];
        if execute(conn, &sql, params)? > 0 {
            return Ok(true);
        }

        let sql = format!(
            "SELECT {} AS row_json FROM {} WHERE \"id\"=? AND \"res_realm\"=?",
            json_columns(["state"]),
            quote_ident(WORKFLOW_REALM)
        );
        let rows = load_json_rows(conn, &sql, vec![SqlParam::text(id), SqlParam::text(res_realm)])?;
        let actual = rows
            .first()
            .and_then(|row| row.get("state"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(INITIAL_STATE);
        Err(Error::ConcurrentModification {
            realm: res_realm.to_string(),
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// One configured action of a workflow
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkflowAction {
    pub action: String,
    /// Display label
    pub name: String,
    /// States the action applies to; `*` matches any
    pub old_states: Vec<String>,
    /// Target state; `*` keeps the current state
    pub new_state: String,
    /// Any one of these is required; empty means everyone
    pub permissions: Vec<String>,
    pub operations: Vec<String>,
    /// Display weight, higher first
    pub weight: i64,
}

impl WorkflowAction {
    pub fn applies_to(&self, state: &str) -> bool {
        self.old_states.iter().any(|s| s == "*" || s == state)
    }

    pub fn is_allowed(&self, perm: &dyn PermissionOracle) -> bool {
        self.permissions.is_empty() || self.permissions.iter().any(|p| perm.has(p))
    }

    pub fn target_state<'a>(&'a self, current: &'a str) -> &'a str {
        if self.new_state == "*" {
            current
        } else {
            &self.new_state
        }
    }
}

/// Parse the actions of one `-resource_workflow` section, in declaration
/// order. Malformed transitions are logged and skipped.
pub fn parse_workflow_section(realm: &str, section: &Section) -> Vec<WorkflowAction> {
    let mut actions = Vec::new();
    for (action, transition) in section.options().filter(|(name, _)| !name.contains('.')) {
        let Some((old, new)) = transition.split_once("->") else {
            tracing::warn!("Invalid transition \"{}\" for action {} of {} (ignoring)", transition, action, realm);
            continue;
        };
        let old_states: Vec<String> = old
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let new_state = new.trim().to_string();
        if old_states.is_empty() || new_state.is_empty() {
            tracing::warn!("Incomplete transition \"{}\" for action {} of {} (ignoring)", transition, action, realm);
            continue;
        }

        let attr = |a: &str| format!("{}.{}", action, a);
        let list = |a: &str| {
            section
                .get_list(&attr(a), ',')
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };
        actions.push(WorkflowAction {
            action: action.to_string(),
            name: section
                .get(&attr("name"))
                .filter(|n| !n.is_empty())
                .unwrap_or(action)
                .to_string(),
            old_states,
            new_state,
            permissions: list("permissions"),
            operations: list("operations"),
            weight: section.get_int(&attr("default")).unwrap_or(0),
        });
    }
    actions
}

// ============================================================================
// Extension points
// ============================================================================

/// Answers whether the acting user holds a permission
pub trait PermissionOracle {
    fn has(&self, permission: &str) -> bool;
}

/// Fixed set of granted permissions
#[derive(Debug, Clone, Default)]
pub struct PermissionSet(HashSet<String>);

impl PermissionSet {
    pub fn new<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(permissions.into_iter().map(Into::into).collect())
    }
}

impl PermissionOracle for PermissionSet {
    fn has(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }
}

/// Veto point consulted before any operation of a transition runs
pub trait TransitionAuthorizer: Send + Sync {
    fn is_authorized(&self, state: &ResourceWorkflowState, resource: &Resource, old_state: &str, new_state: &str)
        -> bool;
}

/// What an operation provider gets to see of a running transition
pub struct OperationContext<'a> {
    pub action: &'a str,
    pub operation: &'a str,
    pub old_state: &'a str,
    pub new_state: &'a str,
    pub resource: &'a Resource,
    pub state: &'a ResourceWorkflowState,
    pub request: &'a TransitionRequest<'a>,
}

/// Implements named side effects of workflow actions
pub trait OperationProvider: Send + Sync {
    fn implemented_operations(&self) -> Vec<String>;

    fn perform_operation(&self, ctx: &OperationContext<'_>) -> anyhow::Result<()>;
}

/// Notified after a transition was persisted
pub trait TransitionListener: Send + Sync {
    fn object_transition(
        &self,
        state: &ResourceWorkflowState,
        resource: &Resource,
        old_state: &str,
        new_state: &str,
    ) -> anyhow::Result<()>;
}

/// Who asks for a transition, and what they saw
pub struct TransitionRequest<'a> {
    pub author: String,
    /// Permissions of the author; when given, the action must be allowed
    pub perm: Option<&'a dyn PermissionOracle>,
    /// Free-form arguments for operation providers
    pub args: BTreeMap<String, String>,
    /// State the author saw when loading the resource
    pub expected_state: Option<String>,
}

impl<'a> TransitionRequest<'a> {
    pub fn new(author: &str) -> Self {
        Self {
            author: author.to_string(),
            perm: None,
            args: BTreeMap::new(),
            expected_state: None,
        }
    }

    pub fn with_perm(mut self, perm: &'a dyn PermissionOracle) -> Self {
        self.perm = Some(perm);
        self
    }

    pub fn expecting(mut self, state: &str) -> Self {
        self.expected_state = Some(state.to_string());
        self
    }

    pub fn arg(mut self, name: &str, value: &str) -> Self {
        self.args.insert(name.to_string(), value.to_string());
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct WorkflowSystem {
    env: Environment,
    actions: BTreeMap<String, Vec<WorkflowAction>>,
    authorizers: Vec<Arc<dyn TransitionAuthorizer>>,
    operations: BTreeMap<String, Arc<dyn OperationProvider>>,
    listeners: Vec<Arc<dyn TransitionListener>>,
}

pub struct WorkflowSystemBuilder {
    env: Environment,
    authorizers: Vec<Arc<dyn TransitionAuthorizer>>,
    operation_providers: Vec<Arc<dyn OperationProvider>>,
    listeners: Vec<Arc<dyn TransitionListener>>,
}

impl WorkflowSystemBuilder {
    pub fn authorizer(mut self, authorizer: Arc<dyn TransitionAuthorizer>) -> Self {
        self.authorizers.push(authorizer);
        self
    }

    pub fn operation_provider(mut self, provider: Arc<dyn OperationProvider>) -> Self {
        self.operation_providers.push(provider);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Load the configured workflows and check every action's operations
    /// against the registered providers.
    pub fn build(self) -> Result<WorkflowSystem> {
        // The state realm must be served by some provider
        self.env.catalog().provider(WORKFLOW_REALM)?;

        let mut operations: BTreeMap<String, Arc<dyn OperationProvider>> = BTreeMap::new();
        for provider in &self.operation_providers {
            for name in provider.implemented_operations() {
                operations.entry(name).or_insert_with(|| provider.clone());
            }
        }

        let config = self.env.config();
        let mut actions = BTreeMap::new();
        for section_name in config.section_names() {
            let Some(realm) = section_name.strip_suffix(SECTION_SUFFIX) else {
                continue;
            };
            tracing::debug!("parsing workflow section {}", section_name);
            let realm_actions = parse_workflow_section(realm, &config.section(section_name));
            for action in &realm_actions {
                if let Some(unknown) = action.operations.iter().find(|op| !operations.contains_key(*op)) {
                    return Err(Error::UnknownOperation {
                        realm: realm.to_string(),
                        action: action.action.clone(),
                        operation: unknown.clone(),
                    });
                }
            }
            actions.insert(realm.to_string(), realm_actions);
        }

        Ok(WorkflowSystem {
            env: self.env,
            actions,
            authorizers: self.authorizers,
            operations,
            listeners: self.listeners,
        })
    }
}

impl WorkflowSystem {
    pub fn builder(env: &Environment) -> WorkflowSystemBuilder {
        WorkflowSystemBuilder {
            env: env.clone(),
            authorizers: Vec::new(),
            operation_providers: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Configured actions of a realm, in declaration order
    pub fn actions(&self, realm: &str) -> &[WorkflowAction] {
        self.actions.get(realm).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn action(&self, realm: &str, action: &str) -> Result<&WorkflowAction> {
        self.actions(realm)
            .iter()
            .find(|a| a.action == action)
            .ok_or_else(|| Error::UnknownAction {
                realm: realm.to_string(),
                action: action.to_string(),
            })
    }

    /// Every state named by the realm's workflow
    pub fn all_states(&self, realm: &str) -> BTreeSet<String> {
        let mut states = BTreeSet::new();
        for action in self.actions(realm) {
            states.extend(action.old_states.iter().cloned());
            states.insert(action.new_state.clone());
        }
        states.remove("*");
        states
    }

    pub fn state_of(&self, resource: &Resource) -> Result<ResourceWorkflowState> {
        ResourceWorkflowState::open(&self.env, resource)
    }

    /// Actions applicable to the resource's current state and allowed by
    /// `perm`, by descending weight then action name
    pub fn available_actions(
        &self,
        resource: &Resource,
        perm: Option<&dyn PermissionOracle>,
    ) -> Result<Vec<&WorkflowAction>> {
        let state = self.state_of(resource)?;
        let current = state.state();

        let mut available: Vec<&WorkflowAction> = self
            .actions(&resource.realm)
            .iter()
            .filter(|a| a.applies_to(current))
            .filter(|a| perm.map(|p| a.is_allowed(p)).unwrap_or(true))
            .collect();
        available.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.action.cmp(&b.action)));
        Ok(available)
    }

    /// Run `action` on a resource and persist its new state.
    ///
    /// Operations already performed are not undone when a later step fails.
    /// Returns the new state.
    pub fn transition(&self, resource: &Resource, action: &str, request: &TransitionRequest<'_>) -> Result<String> {
        let mut state = self.state_of(resource)?;
        let current = state.state().to_string();
        let conflict = |actual: &str, expected: &str| Error::ConcurrentModification {
            realm: resource.realm.clone(),
            id: resource.id.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        };

        if let Some(expected) = &request.expected_state {
            if *expected != current {
                return Err(conflict(&current, expected));
            }
        }

        let this_action = self.action(&resource.realm, action)?;
        if !this_action.applies_to(&current) {
            return Err(Error::ActionNotAvailable {
                realm: resource.realm.clone(),
                action: action.to_string(),
                state: current,
            });
        }
        let new_state = this_action.target_state(&current).to_string();
        let denied = || Error::TransitionDenied {
            realm: resource.realm.clone(),
            id: resource.id.clone(),
            from: current.clone(),
            to: new_state.clone(),
        };

        tracing::debug!("Transitioning {} from {} to {}", resource, current, new_state);

        if let Some(perm) = request.perm {
            if !this_action.is_allowed(perm) {
                return Err(denied());
            }
        }
        if !self
            .authorizers
            .iter()
            .all(|auth| auth.is_authorized(&state, resource, &current, &new_state))
        {
            tracing::info!("transition of {} to {} denied by an authorizer", resource, new_state);
            return Err(denied());
        }

        for operation in &this_action.operations {
            let provider = self.operations.get(operation).ok_or_else(|| Error::UnknownOperation {
                realm: resource.realm.clone(),
                action: action.to_string(),
                operation: operation.clone(),
            })?;
            let ctx = OperationContext {
                action,
                operation,
                old_state: &current,
                new_state: &new_state,
                resource,
                state: &state,
                request,
            };
            provider.perform_operation(&ctx).map_err(|source| Error::Operation {
                operation: operation.clone(),
                source,
            })?;
        }

        // Fails with a conflict if someone moved the resource while the
        // operations ran
        state.move_to(resource, &current, &new_state, &request.author)?;

        for listener in &self.listeners {
            if let Err(e) = listener.object_transition(&state, resource, &current, &new_state) {
                tracing::error!("transition listener failed for {}: {:#}", resource, e);
            }
        }
        Ok(new_state)
    }
}

/// Class provider of the `resourceworkflowstate` realm
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowProvider;

impl ClassProvider for WorkflowProvider {
    fn realms(&self) -> Vec<String> {
        vec![WORKFLOW_REALM.to_string()]
    }

    fn schemas(&self) -> Vec<RealmSchema> {
        vec![RealmSchema::declare(
            WORKFLOW_REALM,
            &["id", "res_realm"],
            vec![Column::text("id"), Column::text("res_realm"), Column::text("state")],
            true,
            true,
        )]
    }

    fn fields(&self, _realm: &str) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::text("id", "ID"),
            FieldDescriptor::text("res_realm", "Resource realm"),
            FieldDescriptor::text("state", "Workflow state"),
        ]
    }

    fn metadata(&self, _realm: &str) -> RealmMetadata {
        RealmMetadata {
            label: "Workflow State".to_string(),
            searchable: false,
            has_custom: true,
            has_change: true,
        }
    }

    fn protected_fields(&self, _realm: &str) -> Vec<String> {
        vec!["id".to_string(), "res_realm".to_string(), "state".to_string()]
    }
}

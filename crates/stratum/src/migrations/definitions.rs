//! Core migration types
//!
//! A [`Migration`] is a named, hash-identified unit of reversible schema
//! change with declared dependencies. Its [`Step`]s are declarative
//! apply/rollback pairs; code-style migrations supply them through a
//! provider closure evaluated on first use. A [`MigrationList`] is an
//! ordered working set that enforces id uniqueness.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, MigrateResult};

/// Stable hash of a migration id, used as the durable key in bookkeeping
/// tables. Depends only on the id, never on step content.
pub fn migration_hash(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Direction a step or migration is being run in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Rollback,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Apply => Direction::Rollback,
            Direction::Rollback => Direction::Apply,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Apply => "apply",
            Direction::Rollback => "rollback",
        }
    }
}

/// Per-step policy for swallowing database errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreErrors {
    #[default]
    Never,
    Apply,
    Rollback,
    All,
}

impl IgnoreErrors {
    pub fn covers(self, direction: Direction) -> bool {
        match self {
            IgnoreErrors::Never => false,
            IgnoreErrors::All => true,
            IgnoreErrors::Apply => direction == Direction::Apply,
            IgnoreErrors::Rollback => direction == Direction::Rollback,
        }
    }
}

/// The work a step performs
#[derive(Debug, Clone)]
pub enum StepBody {
    /// An apply statement and its optional inverse. A missing rollback
    /// statement means the step cannot be undone.
    Sql {
        apply: Option<String>,
        rollback: Option<String>,
    },
    /// Steps aggregated together; rollback reverses child order
    Group(Vec<Step>),
}

/// A reversible unit of work within a migration
#[derive(Debug, Clone)]
pub struct Step {
    pub body: StepBody,
    pub ignore_errors: IgnoreErrors,
}

impl Step {
    pub fn sql(apply: impl Into<String>, rollback: Option<String>) -> Self {
        Self {
            body: StepBody::Sql {
                apply: Some(apply.into()),
                rollback,
            },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    pub fn group(steps: Vec<Step>) -> Self {
        Self {
            body: StepBody::Group(steps),
            ignore_errors: IgnoreErrors::Never,
        }
    }

    pub fn ignore_errors(mut self, policy: IgnoreErrors) -> Self {
        self.ignore_errors = policy;
        self
    }
}

/// Ordinary migrations are dependency-ordered; post-apply hooks re-run
/// after every successful apply batch and stay out of the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Ordinary,
    PostApply,
}

type StepProvider = dyn Fn() -> MigrateResult<Vec<Step>> + Send + Sync;

#[derive(Clone)]
enum StepSpec {
    Inline(Vec<Step>),
    Provider(Arc<StepProvider>),
}

/// A named, hash-identified unit of reversible schema change
pub struct Migration {
    id: String,
    hash: String,
    path: Option<PathBuf>,
    depends: BTreeSet<String>,
    use_transactions: bool,
    kind: MigrationKind,
    spec: StepSpec,
    steps_cache: OnceLock<Vec<Step>>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("depends", &self.depends)
            .field("use_transactions", &self.use_transactions)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Migration {
    pub fn builder(id: impl Into<String>) -> MigrationBuilder {
        MigrationBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn depends(&self) -> &BTreeSet<String> {
        &self.depends
    }

    pub fn use_transactions(&self) -> bool {
        self.use_transactions
    }

    pub fn is_post_apply(&self) -> bool {
        self.kind == MigrationKind::PostApply
    }

    /// The migration's steps, materialized on first use. A provider failure
    /// surfaces as [`MigrateError::BadMigration`].
    pub fn steps(&self) -> MigrateResult<&[Step]> {
        if let Some(steps) = self.steps_cache.get() {
            return Ok(steps);
        }
        let built = match &self.spec {
            StepSpec::Inline(steps) => steps.clone(),
            StepSpec::Provider(provider) => provider()
                .map_err(|e| MigrateError::bad_migration(&self.id, e))?,
        };
        Ok(self.steps_cache.get_or_init(|| built))
    }
}

/// Registration contract for migrations defined in code rather than SQL
/// files: declare metadata and steps explicitly, no code is executed to
/// discover them.
pub struct MigrationBuilder {
    id: String,
    depends: BTreeSet<String>,
    use_transactions: bool,
    kind: MigrationKind,
    path: Option<PathBuf>,
    steps: Vec<Step>,
    provider: Option<Arc<StepProvider>>,
}

impl MigrationBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends: BTreeSet::new(),
            use_transactions: true,
            kind: MigrationKind::Ordinary,
            path: None,
            steps: Vec::new(),
            provider: None,
        }
    }

    pub fn depends<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn transactional(mut self, use_transactions: bool) -> Self {
        self.use_transactions = use_transactions;
        self
    }

    pub fn post_apply(mut self) -> Self {
        self.kind = MigrationKind::PostApply;
        self
    }

    pub(crate) fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Append a plain SQL step
    pub fn step(mut self, apply: impl Into<String>, rollback: Option<String>) -> Self {
        self.steps.push(Step::sql(apply, rollback));
        self
    }

    /// Append a prepared step (group, custom ignore policy)
    pub fn raw_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Defer step construction to a provider evaluated on first use.
    /// Replaces any steps appended so far.
    pub fn step_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> MigrateResult<Vec<Step>> + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> Migration {
        let hash = migration_hash(&self.id);
        let spec = match self.provider {
            Some(provider) => StepSpec::Provider(provider),
            None => StepSpec::Inline(self.steps),
        };
        Migration {
            id: self.id,
            hash,
            path: self.path,
            depends: self.depends,
            use_transactions: self.use_transactions,
            kind: self.kind,
            spec,
            steps_cache: OnceLock::new(),
        }
    }
}

/// An ordered working set of migrations plus its post-apply hooks.
///
/// Id uniqueness is enforced on every construction, insert, and replace;
/// a violation is a [`MigrateError::Conflict`], never a silent overwrite.
#[derive(Debug, Clone, Default)]
pub struct MigrationList {
    items: Vec<Arc<Migration>>,
    post_apply: Vec<Arc<Migration>>,
    keys: std::collections::HashSet<String>,
}

impl MigrationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        items: Vec<Arc<Migration>>,
        post_apply: Vec<Arc<Migration>>,
    ) -> MigrateResult<Self> {
        let mut list = Self {
            items: Vec::new(),
            post_apply,
            keys: std::collections::HashSet::new(),
        };
        for item in items {
            list.push_arc(item)?;
        }
        Ok(list)
    }

    pub fn push(&mut self, migration: Migration) -> MigrateResult<()> {
        self.push_arc(Arc::new(migration))
    }

    pub fn push_arc(&mut self, migration: Arc<Migration>) -> MigrateResult<()> {
        if !self.keys.insert(migration.id().to_string()) {
            return Err(MigrateError::Conflict(migration.id().to_string()));
        }
        self.items.push(migration);
        Ok(())
    }

    pub fn insert(&mut self, index: usize, migration: Migration) -> MigrateResult<()> {
        if self.keys.contains(migration.id()) {
            return Err(MigrateError::Conflict(migration.id().to_string()));
        }
        self.keys.insert(migration.id().to_string());
        self.items.insert(index, Arc::new(migration));
        Ok(())
    }

    /// Replace the migration at `index`. The incoming id may equal the id
    /// being replaced but must not collide with any other.
    pub fn set(&mut self, index: usize, migration: Migration) -> MigrateResult<()> {
        let outgoing = self.items[index].id().to_string();
        if migration.id() != outgoing && self.keys.contains(migration.id()) {
            return Err(MigrateError::Conflict(migration.id().to_string()));
        }
        self.keys.remove(&outgoing);
        self.keys.insert(migration.id().to_string());
        self.items[index] = Arc::new(migration);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Arc<Migration> {
        let removed = self.items.remove(index);
        self.keys.remove(removed.id());
        removed
    }

    pub fn push_post_apply(&mut self, migration: Migration) {
        self.post_apply.push(Arc::new(migration));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Migration>> {
        self.items.get(index)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.keys.contains(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Migration>> {
        self.items.iter()
    }

    pub fn post_apply(&self) -> &[Arc<Migration>] {
        &self.post_apply
    }

    /// A new list keeping only migrations matching `predicate`, with the
    /// same post-apply hooks
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Migration) -> bool,
    {
        Self {
            items: self
                .items
                .iter()
                .filter(|m| predicate(m))
                .cloned()
                .collect(),
            post_apply: self.post_apply.clone(),
            keys: self
                .items
                .iter()
                .filter(|m| predicate(m))
                .map(|m| m.id().to_string())
                .collect(),
        }
    }

    /// A new list with different items but the same post-apply hooks
    pub fn replace_items(&self, items: Vec<Arc<Migration>>) -> MigrateResult<Self> {
        Self::from_parts(items, self.post_apply.clone())
    }
}

impl<'a> IntoIterator for &'a MigrationList {
    type Item = &'a Arc<Migration>;
    type IntoIter = std::slice::Iter<'a, Arc<Migration>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let first = migration_hash("0001-initial");
        let second = migration_hash("0001-initial");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, migration_hash("0002-followup"));
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let mut list = MigrationList::new();
        list.push(Migration::builder("a").build()).unwrap();
        let err = list.push(Migration::builder("a").build()).unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(id) if id == "a"));
    }

    #[test]
    fn set_allows_same_slot_id_but_rejects_collisions() {
        let mut list = MigrationList::new();
        list.push(Migration::builder("a").build()).unwrap();
        list.push(Migration::builder("b").build()).unwrap();

        // same id back into its own slot is fine
        list.set(0, Migration::builder("a").build()).unwrap();
        // colliding with the other slot is not
        let err = list.set(0, Migration::builder("b").build()).unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(id) if id == "b"));
        // replaced ids are released
        list.set(0, Migration::builder("c").build()).unwrap();
        list.push(Migration::builder("a").build()).unwrap();
    }

    #[test]
    fn provider_steps_materialize_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let migration = Migration::builder("lazy")
            .step_provider(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Step::sql("SELECT 1", None)])
            })
            .build();
        assert_eq!(migration.steps().unwrap().len(), 1);
        assert_eq!(migration.steps().unwrap().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_provider_is_a_bad_migration() {
        let migration = Migration::builder("broken")
            .step_provider(|| {
                Err(MigrateError::Configuration("steps unavailable".into()))
            })
            .build();
        assert!(migration.steps().unwrap_err().is_bad_migration());
    }

    #[test]
    fn ignore_policy_coverage() {
        assert!(!IgnoreErrors::Never.covers(Direction::Apply));
        assert!(IgnoreErrors::All.covers(Direction::Rollback));
        assert!(IgnoreErrors::Apply.covers(Direction::Apply));
        assert!(!IgnoreErrors::Apply.covers(Direction::Rollback));
        assert!(IgnoreErrors::Rollback.covers(Direction::Rollback));
    }
}

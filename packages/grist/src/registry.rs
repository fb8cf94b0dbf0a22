//! The rule registry.
//!
//! A build script populates a [`Build`] with file rules, phony rules and
//! per-target metadata, then hands control to the driver. Registration and
//! graph construction are single-threaded phases; during execution the
//! registry is only read (metadata and resource lookups aside, which have
//! their own synchronisation).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bon::Builder;
use color_eyre::Result;
use dashmap::DashMap;
use derive_more::{Display, Error};
use tracing::{info, instrument};

use crate::{
    resource::{Resource, ResourceError, Resources},
    rule::{Action, Job, action, no_op},
    sync::lock,
    uri::Uri,
};

/// Errors raised at declaration time.
#[derive(Debug, Display, Error)]
pub enum RegistryError {
    /// Each concrete target maps to at most one rule.
    #[display("target {target} is already bound to a rule")]
    DuplicateTarget {
        target: Uri,
    },

    /// A phony label takes at most one action across all declarations.
    #[display("phony {target} already has an action")]
    DuplicateAction {
        target: Uri,
    },

    /// Metadata keys are write-once; rewriting the same value is fine.
    #[display("refusing to overwrite meta[{key:?}] = {current:?} with {proposed:?} for {uri}")]
    MetaConflict {
        uri: Uri,
        key: String,
        current: MetaValue,
        proposed: MetaValue,
    },

    #[display("a file rule needs at least one target")]
    NoTargets,
}

/// A per-target metadata value.
///
/// Recognised keys: `keep` (boolean: don't delete the target on failure)
/// and `credential` (opaque token forwarded to the resource backend).
#[derive(Clone, Debug, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    Text(String),
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Per-target metadata with write-once-same-value semantics.
#[derive(Debug, Default)]
struct Metadata {
    entries: DashMap<Uri, HashMap<String, MetaValue>>,
}

impl Metadata {
    fn set(&self, uri: &Uri, key: &str, value: MetaValue) -> Result<(), RegistryError> {
        let mut entry = self.entries.entry(uri.clone()).or_default();
        match entry.get(key) {
            Some(current) if *current != value => Err(RegistryError::MetaConflict {
                uri: uri.clone(),
                key: key.to_owned(),
                current: current.clone(),
                proposed: value,
            }),
            Some(_) => Ok(()),
            None => {
                entry.insert(key.to_owned(), value);
                Ok(())
            }
        }
    }

    fn keep(&self, uri: &Uri) -> bool {
        self.entries
            .get(uri)
            .is_some_and(|entry| matches!(entry.get("keep"), Some(MetaValue::Bool(true))))
    }

    fn credential(&self, uri: &Uri) -> Option<String> {
        self.entries.get(uri).and_then(|entry| match entry.get("credential") {
            Some(MetaValue::Text(token)) => Some(token.clone()),
            _ => None,
        })
    }
}

/// Options for a file rule.
#[derive(Builder, Clone, Debug, Default)]
pub struct FileOpts {
    /// Human description shown by `--descriptions`.
    #[builder(into)]
    pub desc: Option<String>,

    /// Override the engine-wide hash-stamp default for this rule.
    pub use_hash: Option<bool>,

    /// Take an exclusive serial slot while running. Useful for rules that
    /// need the GPU or most of the machine's memory.
    #[builder(default)]
    pub serial: bool,

    /// Scheduling hint; lower runs earlier.
    #[builder(default)]
    pub priority: i64,
}

/// Options for a phony rule.
#[derive(Builder, Clone, Debug, Default)]
pub struct PhonyOpts {
    /// Human description shown by `--descriptions`.
    #[builder(into)]
    pub desc: Option<String>,

    /// Scheduling hint; lower runs earlier. The last declaration wins.
    pub priority: Option<i64>,
}

#[derive(Default)]
struct PhonyEntry {
    deps: Vec<Uri>,
    descs: Vec<String>,
    action: Option<Action>,
    priority: Option<i64>,
}

/// Phony declarations accumulate across calls, in declaration order.
#[derive(Default)]
struct PhonyTable {
    order: Vec<Uri>,
    entries: HashMap<Uri, PhonyEntry>,
}

struct BuildInner {
    jobs: Mutex<HashMap<Uri, Arc<Job>>>,
    phonies: Mutex<PhonyTable>,
    meta: Metadata,
    resources: Resources,
    use_hash: bool,
}

/// A build definition.
///
/// Cloning is cheap and shares the underlying registry, so a script can
/// pass handles into helper functions freely.
#[derive(Clone)]
pub struct Build {
    inner: Arc<BuildInner>,
}

impl Default for Build {
    fn default() -> Self {
        Self::new()
    }
}

impl Build {
    pub fn new() -> Self {
        Self::with_use_hash(false)
    }

    /// A build whose file rules default to hash-stabilised dependency
    /// stamps unless they opt out individually.
    pub fn with_use_hash(use_hash: bool) -> Self {
        Self {
            inner: Arc::new(BuildInner {
                jobs: Mutex::default(),
                phonies: Mutex::default(),
                meta: Metadata::default(),
                resources: Resources::new(".grist"),
                use_hash,
            }),
        }
    }

    /// Mount a resource backend for a URI scheme.
    pub fn register_resource(&self, scheme: impl Into<String>, backend: Arc<dyn Resource>) {
        self.inner.resources.register(scheme, backend);
    }

    /// Declare a file rule: `targets` are produced from `deps` by `act`.
    ///
    /// All targets share the one action. Declaring a target that is
    /// already bound is an error.
    pub fn file<F, Fut>(
        &self,
        targets: impl IntoIterator<Item: AsRef<str>>,
        deps: impl IntoIterator<Item: AsRef<str>>,
        opts: FileOpts,
        act: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.install_file(parse_all(targets)?, parse_all(deps)?, opts, action(act))
    }

    pub(crate) fn install_file(
        &self,
        targets: Vec<Uri>,
        deps: Vec<Uri>,
        opts: FileOpts,
        act: Action,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(RegistryError::NoTargets.into());
        }
        let use_hash = opts.use_hash.unwrap_or(self.inner.use_hash);
        let job = Job::file(
            targets.clone(),
            deps,
            opts.desc.into_iter().collect(),
            use_hash,
            opts.serial,
            opts.priority,
            act,
        );
        let mut jobs = lock(&self.inner.jobs);
        for target in &targets {
            if jobs.contains_key(target) {
                return Err(RegistryError::DuplicateTarget {
                    target: target.clone(),
                }
                .into());
            }
        }
        for target in targets {
            jobs.insert(target, Arc::clone(&job));
        }
        Ok(())
    }

    /// Declare (or extend) a phony rule: a label standing for its deps.
    ///
    /// Repeated declarations of the same label merge their dependency and
    /// description lists.
    pub fn phony(
        &self,
        label: &str,
        deps: impl IntoIterator<Item: AsRef<str>>,
        opts: PhonyOpts,
    ) -> Result<()> {
        let label = Uri::parse(label)?;
        let deps = parse_all(deps)?;
        let mut table = lock(&self.inner.phonies);
        let entry = phony_entry(&mut table, &label);
        entry.deps.extend(deps);
        entry.descs.extend(opts.desc);
        if let Some(priority) = opts.priority {
            entry.priority = Some(priority);
        }
        Ok(())
    }

    /// Bind the action run when `label` itself is built. At most one per
    /// label, however many times the label is declared.
    pub fn phony_action<F, Fut>(&self, label: &str, act: F) -> Result<()>
    where
        F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let label = Uri::parse(label)?;
        let mut table = lock(&self.inner.phonies);
        let entry = phony_entry(&mut table, &label);
        if entry.action.is_some() {
            return Err(RegistryError::DuplicateAction { target: label }.into());
        }
        entry.action = Some(action(act));
        Ok(())
    }

    /// Attach one metadata key to a target URI.
    ///
    /// Keys are write-once: rewriting the same value is idempotent, a
    /// different value is an error.
    pub fn meta(&self, uri: &str, key: &str, value: impl Into<MetaValue>) -> Result<()> {
        let uri = Uri::parse(uri)?;
        self.inner.meta.set(&uri, key, value.into())?;
        Ok(())
    }

    /// Remove whatever `uri` points at, via its scheme's backend.
    #[instrument(skip(self))]
    pub async fn rm(&self, uri: &str) -> Result<()> {
        let uri = Uri::parse(uri)?;
        self.remove(&uri).await?;
        Ok(())
    }

    pub(crate) async fn remove(&self, uri: &Uri) -> Result<(), ResourceError> {
        info!(%uri, "rm");
        let credential = self.inner.meta.credential(uri);
        self.inner.resources.rm(uri, credential.as_deref()).await
    }

    /// Delete a failed rule's targets, honouring `keep` metadata. Removal
    /// failures are logged, not raised: the target may never have been
    /// created.
    pub(crate) async fn rm_targets(&self, job: &Job) {
        if !job.is_file() {
            return;
        }
        info!(%job, "removing targets of failed rule");
        for target in job.targets() {
            if self.inner.meta.keep(target) {
                continue;
            }
            if let Err(err) = self.remove(target).await {
                info!(%target, %err, "failed to remove target");
            }
        }
    }

    /// Effective timestamp of `uri`, forwarding its credential metadata.
    pub(crate) async fn mtime(&self, uri: &Uri, use_hash: bool) -> Result<f64, ResourceError> {
        let credential = self.inner.meta.credential(uri);
        self.inner
            .resources
            .mtime(uri, credential.as_deref(), use_hash)
            .await
    }

    pub(crate) fn set_meta(&self, uri: &Uri, key: &str, value: MetaValue) -> Result<()> {
        self.inner.meta.set(uri, key, value)?;
        Ok(())
    }

    /// Materialise every accumulated phony declaration as a job.
    ///
    /// Runs once, before introspection or graph construction; a label that
    /// collides with a file target is rejected here.
    pub(crate) fn collect_phonies(&self) -> Result<()> {
        let mut table = lock(&self.inner.phonies);
        let mut jobs = lock(&self.inner.jobs);
        for label in std::mem::take(&mut table.order) {
            let Some(entry) = table.entries.remove(&label) else {
                continue;
            };
            if jobs.contains_key(&label) {
                return Err(RegistryError::DuplicateTarget { target: label }.into());
            }
            let job = Job::phony(
                label.clone(),
                entry.deps,
                entry.descs,
                entry.priority.unwrap_or(0),
                entry.action.unwrap_or_else(no_op),
            );
            jobs.insert(label, job);
        }
        Ok(())
    }

    pub(crate) fn job_for(&self, uri: &Uri) -> Option<Arc<Job>> {
        lock(&self.inner.jobs).get(uri).cloned()
    }

    /// Bind a synthesised leaf job created during graph construction.
    pub(crate) fn install_leaf(&self, target: Uri, job: Arc<Job>) {
        lock(&self.inner.jobs).insert(target, job);
    }

    /// Every (target, job) binding, sorted by target.
    pub(crate) fn bindings(&self) -> Vec<(Uri, Arc<Job>)> {
        let jobs = lock(&self.inner.jobs);
        let mut bindings = jobs
            .iter()
            .map(|(uri, job)| (uri.clone(), Arc::clone(job)))
            .collect::<Vec<_>>();
        bindings.sort_by(|(a, _), (b, _)| a.cmp(b));
        bindings
    }

    /// Every distinct rule, sorted by target list.
    pub(crate) fn distinct_jobs(&self) -> Vec<Arc<Job>> {
        let jobs = lock(&self.inner.jobs);
        let mut distinct: Vec<Arc<Job>> = Vec::new();
        for job in jobs.values() {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, job)) {
                distinct.push(Arc::clone(job));
            }
        }
        distinct.sort_by(|a, b| a.targets().cmp(b.targets()));
        distinct
    }
}

fn phony_entry<'a>(table: &'a mut PhonyTable, label: &Uri) -> &'a mut PhonyEntry {
    if !table.entries.contains_key(label) {
        table.order.push(label.clone());
    }
    table.entries.entry(label.clone()).or_default()
}

fn parse_all(names: impl IntoIterator<Item: AsRef<str>>) -> Result<Vec<Uri>> {
    names
        .into_iter()
        .map(|name| Uri::parse(name.as_ref()).map_err(Into::into))
        .collect()
}

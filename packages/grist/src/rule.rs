//! Rules at runtime.
//!
//! A [`Job`] is the runtime instance of one declared rule within a single
//! build invocation: the rule's targets and dependencies plus the mutable
//! state the scheduler tracks for it.

use std::{
    fmt,
    fmt::Write as _,
    sync::{Arc, atomic::AtomicBool},
};

use color_eyre::Result;
use futures::future::BoxFuture;
use itertools::Itertools;

use crate::{
    sync::{Countdown, Flag},
    uri::Uri,
};

/// The body of a rule: an async closure over the job being built.
pub type Action = Arc<dyn Fn(Arc<Job>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`Action`].
pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

/// An [`Action`] that does nothing, for phony labels declared without one.
pub(crate) fn no_op() -> Action {
    action(|_| async { Ok(()) })
}

/// What kind of rule a job executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    /// Produces concrete targets; freshness decides whether it runs.
    File {
        /// Stabilise dependency stamps with content hashes.
        use_hash: bool,
    },
    /// A label grouping other targets; always runs.
    Phony,
}

/// The runtime instance of a rule within one build invocation.
pub struct Job {
    kind: JobKind,
    serial: bool,
    priority: i64,
    targets: Vec<Uri>,
    deps: Vec<Uri>,
    unique_deps: Vec<Uri>,
    descs: Vec<String>,
    action: Action,
    /// Dependencies not yet completed; `-1` once this job is done.
    pub(crate) remaining: Countdown,
    pub(crate) visited: AtomicBool,
    pub(crate) dry_run: Flag,
}

impl Job {
    pub(crate) fn file(
        targets: Vec<Uri>,
        deps: Vec<Uri>,
        descs: Vec<String>,
        use_hash: bool,
        serial: bool,
        priority: i64,
        action: Action,
    ) -> Arc<Self> {
        Self::new(JobKind::File { use_hash }, serial, priority, targets, deps, descs, action)
    }

    pub(crate) fn phony(
        label: Uri,
        deps: Vec<Uri>,
        descs: Vec<String>,
        priority: i64,
        action: Action,
    ) -> Arc<Self> {
        Self::new(JobKind::Phony, false, priority, vec![label], deps, descs, action)
    }

    fn new(
        kind: JobKind,
        serial: bool,
        priority: i64,
        targets: Vec<Uri>,
        deps: Vec<Uri>,
        descs: Vec<String>,
        action: Action,
    ) -> Arc<Self> {
        let unique_deps = deps.iter().cloned().unique().collect::<Vec<_>>();
        let remaining = Countdown::new(unique_deps.len());
        Arc::new(Self {
            kind,
            serial,
            priority,
            targets,
            deps,
            unique_deps,
            descs,
            action,
            remaining,
            visited: AtomicBool::new(false),
            dry_run: Flag::default(),
        })
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, JobKind::File { .. })
    }

    /// Whether this job takes an exclusive serial slot while running.
    pub fn serial(&self) -> bool {
        self.serial
    }

    /// Scheduling hint; lower runs earlier.
    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn targets(&self) -> &[Uri] {
        &self.targets
    }

    /// Dependencies as declared, duplicates included.
    pub fn deps(&self) -> &[Uri] {
        &self.deps
    }

    /// Dependencies with duplicates removed, declaration order kept.
    pub fn unique_deps(&self) -> &[Uri] {
        &self.unique_deps
    }

    pub fn descs(&self) -> &[String] {
        &self.descs
    }

    pub(crate) fn invoke(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let action = Arc::clone(&self.action);
        action(self)
    }

    /// Targets then tab-indented dependencies: the shape printed by the
    /// plain dependencies mode and by dry runs.
    pub(crate) fn render(&self, out: &mut String) {
        for target in &self.targets {
            let _ = writeln!(out, "{target}");
        }
        for dep in &self.deps {
            let _ = writeln!(out, "\t{dep}");
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            JobKind::File { .. } => "file",
            JobKind::Phony => "phony",
        };
        write!(f, "{kind}({:?} <- {:?})", self.targets, self.deps)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("targets", &self.targets)
            .field("deps", &self.deps)
            .field("serial", &self.serial)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    fn uris(names: &[&str]) -> Vec<Uri> {
        names.iter().map(|n| Uri::parse(n).unwrap()).collect()
    }

    #[test]
    fn countdown_covers_unique_deps_only() {
        let job = Job::file(
            uris(&["out"]),
            uris(&["a", "b", "a", "c", "b"]),
            vec![],
            false,
            false,
            0,
            no_op(),
        );
        pretty_assert_eq!(job.unique_deps(), &uris(&["a", "b", "c"])[..]);
        pretty_assert_eq!(job.deps().len(), 5);
        pretty_assert_eq!(job.remaining.remaining(), 3);
    }

    #[test]
    fn renders_targets_then_deps() {
        let job = Job::file(
            uris(&["x", "y"]),
            uris(&["a", "a"]),
            vec![],
            false,
            false,
            0,
            no_op(),
        );
        let mut out = String::new();
        job.render(&mut out);
        pretty_assert_eq!(out, "x\ny\n\ta\n\ta\n");
    }

    #[test]
    fn display_names_the_rule() {
        let job = Job::phony(Uri::parse("check").unwrap(), uris(&["t1"]), vec![], 0, no_op());
        pretty_assert_eq!(job.to_string(), r#"phony(["check"] <- ["t1"])"#);
    }
}

//! Dependency-graph construction.
//!
//! Walks the registry depth-first from the requested targets, producing the
//! dependent-of-each-target adjacency and the initial leaf frontier the
//! scheduler starts from. Names with no rule are either synthesised as
//! pre-existing inputs or rejected here, before any worker starts.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, atomic::Ordering},
};

use color_eyre::{Result, eyre::eyre};
use derive_more::{Display, Error};

use crate::{
    registry::{Build, MetaValue},
    rule::{Job, action},
    uri::Uri,
};

/// Errors detected while resolving the requested targets.
#[derive(Debug, Display, Error)]
pub enum GraphError {
    /// No rule produces the target and nothing by that name exists.
    #[display("no rule to make {target}")]
    NoRule {
        target: Uri,
    },

    /// The dependency chain revisits a target.
    #[display("circular dependency detected: {target} via {chain}")]
    Cycle {
        target: Uri,
        chain: String,
    },
}

/// The executable view of the registry for one invocation.
#[derive(Debug)]
pub struct Graph {
    /// Dependency URI → jobs waiting on it.
    pub(crate) dependents: HashMap<Uri, Vec<Arc<Job>>>,
    /// Jobs with nothing to wait for: the scheduler's initial frontier.
    pub(crate) leaves: Vec<Arc<Job>>,
}

/// The active call chain as a cons list: O(depth) membership checks and
/// nothing to clone on the way down.
struct Chain<'a> {
    target: &'a Uri,
    parent: Option<&'a Chain<'a>>,
}

impl Chain<'_> {
    fn contains(&self, uri: &Uri) -> bool {
        self.target == uri || self.parent.is_some_and(|parent| parent.contains(uri))
    }
}

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)?;
        let mut link = self.parent;
        while let Some(chain) = link {
            write!(f, " <- {}", chain.target)?;
            link = chain.parent;
        }
        Ok(())
    }
}

/// Resolve `targets` into a [`Graph`].
pub(crate) fn build(build: &Build, targets: &[Uri]) -> Result<Graph> {
    let mut graph = Graph {
        dependents: HashMap::new(),
        leaves: Vec::new(),
    };
    for target in targets {
        visit(build, &mut graph, target, None)?;
    }
    Ok(graph)
}

fn visit(build: &Build, graph: &mut Graph, target: &Uri, chain: Option<&Chain<'_>>) -> Result<()> {
    if chain.is_some_and(|chain| chain.contains(target)) {
        return Err(GraphError::Cycle {
            target: target.clone(),
            chain: chain.map(|c| c.to_string()).unwrap_or_default(),
        }
        .into());
    }
    let job = match build.job_for(target) {
        Some(job) => job,
        None => synthesize_leaf(build, target)?,
    };
    if job.visited.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let link = Chain {
        target,
        parent: chain,
    };
    // Visit dependencies in producer-priority order so higher-priority
    // producers reach the frontier first; unknown producers sort last.
    let mut deps = job.unique_deps().iter().collect::<Vec<_>>();
    deps.sort_by_key(|dep| build.job_for(dep).map_or(i64::MAX, |producer| producer.priority()));
    for dep in deps {
        graph
            .dependents
            .entry(dep.clone())
            .or_default()
            .push(Arc::clone(&job));
        visit(build, graph, dep, Some(&link))?;
    }
    if job.unique_deps().is_empty() {
        graph.leaves.push(job);
    }
    Ok(())
}

/// Stand in for a name with no rule.
///
/// A local file that already exists becomes a keep-marked leaf whose action
/// must never run. For any other scheme existence is only discoverable
/// through the backend, so the leaf is accepted as-is and its absence
/// surfaces through `mtime` during freshness.
fn synthesize_leaf(build: &Build, target: &Uri) -> Result<Arc<Job>> {
    let local = target.is_local_file();
    // std::fs is fine here: graph construction is a synchronous
    // single-threaded phase before any worker starts.
    if local && std::fs::symlink_metadata(target.path()).is_err() {
        return Err(GraphError::NoRule {
            target: target.clone(),
        }
        .into());
    }
    build.set_meta(target, "keep", MetaValue::Bool(true))?;
    let act = {
        let uri = target.clone();
        if local {
            action(move |_| {
                let uri = uri.clone();
                async move { Err(eyre!("engine bug: ran the leaf for pre-existing input {uri}")) }
            })
        } else {
            action(move |_| {
                let uri = uri.clone();
                async move { Err(eyre!("no rule to make {uri}")) }
            })
        }
    };
    let job = Job::file(vec![target.clone()], Vec::new(), Vec::new(), false, false, 0, act);
    build.install_leaf(target.clone(), Arc::clone(&job));
    Ok(job)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;
    use crate::registry::{FileOpts, PhonyOpts};

    fn uri(name: &str) -> Uri {
        Uri::parse(name).unwrap()
    }

    #[test]
    fn counts_unique_deps_and_registers_dependents_once() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::write(&input, "x").unwrap();
        let input = input.to_str().unwrap().to_owned();
        let out = dir.path().join("out").to_str().unwrap().to_owned();

        let build = Build::new();
        build
            .file(
                [out.as_str()],
                [input.as_str(), input.as_str(), input.as_str()],
                FileOpts::default(),
                |_| async { Ok(()) },
            )
            .unwrap();
        let graph = super::build(&build, &[uri(&out)]).unwrap();

        let job = build.job_for(&uri(&out)).unwrap();
        pretty_assert_eq!(job.remaining.remaining(), 1);
        pretty_assert_eq!(graph.dependents[&uri(&input)].len(), 1);
        // The pre-existing input synthesises into the leaf frontier.
        pretty_assert_eq!(graph.leaves.len(), 1);
        assert!(graph.leaves[0].targets().contains(&uri(&input)));
    }

    #[test]
    fn synthesised_leaves_are_kept_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::write(&input, "x").unwrap();
        let input = input.to_str().unwrap().to_owned();
        let out = dir.path().join("out").to_str().unwrap().to_owned();

        let build = Build::new();
        build
            .file([out.as_str()], [input.as_str()], FileOpts::default(), |_| async {
                Ok(())
            })
            .unwrap();
        super::build(&build, &[uri(&out)]).unwrap();

        // A later keep=true is idempotent; keep=false conflicts.
        build.meta(&input, "keep", true).unwrap();
        assert!(build.meta(&input, "keep", false).is_err());
    }

    #[test]
    fn missing_rule_is_rejected() {
        let build = Build::new();
        let err = super::build(&build, &[uri("/definitely/not/there")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::NoRule { .. })
        ));
    }

    #[test]
    fn absent_remote_names_are_accepted() {
        let build = Build::new();
        let graph = super::build(&build, &[uri("s3://bucket/key")]).unwrap();
        pretty_assert_eq!(graph.leaves.len(), 1);
    }

    #[test]
    fn cycles_are_detected() {
        let build = Build::new();
        build.phony("a", ["b"], PhonyOpts::default()).unwrap();
        build.phony("b", ["c"], PhonyOpts::default()).unwrap();
        build.phony("c", ["a"], PhonyOpts::default()).unwrap();
        build.collect_phonies().unwrap();

        let err = super::build(&build, &[uri("a")]).unwrap_err();
        let cycle = err.downcast_ref::<GraphError>();
        assert!(matches!(cycle, Some(GraphError::Cycle { .. })));
        let message = err.to_string();
        assert!(message.contains("circular dependency"), "{message}");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let build = Build::new();
        build.phony("a", ["a"], PhonyOpts::default()).unwrap();
        build.collect_phonies().unwrap();
        let err = super::build(&build, &[uri("a")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn shared_deps_fan_in() {
        let build = Build::new();
        build.phony("all", ["x", "y"], PhonyOpts::default()).unwrap();
        build.phony("x", ["base"], PhonyOpts::default()).unwrap();
        build.phony("y", ["base"], PhonyOpts::default()).unwrap();
        build.phony("base", Vec::<&str>::new(), PhonyOpts::default()).unwrap();
        build.collect_phonies().unwrap();

        let graph = super::build(&build, &[uri("all")]).unwrap();
        pretty_assert_eq!(graph.dependents[&uri("base")].len(), 2);
        pretty_assert_eq!(graph.leaves.len(), 1);
        assert!(graph.leaves[0].targets().contains(&uri("base")));
    }
}

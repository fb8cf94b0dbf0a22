//! Freshness: deciding whether a rule must run.
//!
//! Dependency stamps are memoised for the length of one run, so the
//! potentially expensive hash-stabilised lookup happens at most once per
//! URI however many rules share the dependency.

use color_eyre::Result;
use tracing::{instrument, trace};

use crate::{
    registry::Build,
    resource::ResourceError,
    rule::{Job, JobKind},
    sync::Memo,
    uri::Uri,
};

/// Per-run staleness evaluator.
pub(crate) struct Freshness {
    build: Build,
    stamps: Memo<Uri, f64>,
}

impl Freshness {
    pub(crate) fn new(build: Build) -> Self {
        Self {
            build,
            stamps: Memo::new(),
        }
    }

    /// Whether `job` must execute.
    #[instrument(name = "Freshness::is_stale", skip_all, fields(job = %job))]
    pub(crate) async fn is_stale(&self, job: &Job) -> Result<bool, ResourceError> {
        let JobKind::File { use_hash } = job.kind() else {
            // Phony labels have no artifact to compare against.
            return Ok(true);
        };
        if job.dry_run.get() {
            // An upstream rule would have rebuilt, so this one would too.
            return Ok(true);
        }

        let mut oldest_target = f64::INFINITY;
        for target in job.targets() {
            match self.build.mtime(target, false).await {
                Ok(seconds) => oldest_target = oldest_target.min(seconds),
                Err(err @ ResourceError::UnsupportedScheme { .. }) => return Err(err),
                Err(err) => {
                    trace!(%target, %err, "target unreadable; rebuilding");
                    // Still warm the stamp cache so every evaluation in
                    // this run observes the same dependency values.
                    for dep in job.unique_deps() {
                        self.stamp(dep, use_hash).await?;
                    }
                    return Ok(true);
                }
            }
        }

        let mut newest_dep = f64::NEG_INFINITY;
        for dep in job.unique_deps() {
            newest_dep = newest_dep.max(self.stamp(dep, use_hash).await?);
        }
        trace!(newest_dep, oldest_target, "compared stamps");
        // Strict comparison: equal times count as up to date.
        Ok(newest_dep > oldest_target)
    }

    /// The dependency's effective timestamp, memoised for this run.
    async fn stamp(&self, dep: &Uri, use_hash: bool) -> Result<f64, ResourceError> {
        self.stamps
            .get_or_try(dep, || async {
                match self.build.mtime(dep, use_hash).await {
                    Ok(seconds) => Ok(seconds),
                    // Absent dependencies are acceptable as empty.
                    Err(err) if err.is_not_found() => Ok(f64::NEG_INFINITY),
                    Err(err) => Err(err),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use dashmap::DashMap;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;
    use crate::{
        registry::FileOpts,
        resource::Resource,
        rule::no_op,
    };

    /// Backend with scripted timestamps, counting lookups per URI.
    struct Scripted {
        times: DashMap<String, f64>,
        lookups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Resource for Scripted {
        async fn mtime(
            &self,
            uri: &Uri,
            _credential: Option<&str>,
            _use_hash: bool,
        ) -> Result<f64, ResourceError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.times
                .get(uri.as_str())
                .map(|seconds| *seconds)
                .ok_or_else(|| ResourceError::NotFound { uri: uri.clone() })
        }

        async fn rm(&self, _uri: &Uri, _credential: Option<&str>) -> Result<(), ResourceError> {
            Ok(())
        }
    }

    fn scripted(build: &Build, times: &[(&str, f64)]) -> Arc<AtomicUsize> {
        let lookups = Arc::new(AtomicUsize::new(0));
        let backend = Scripted {
            times: times
                .iter()
                .map(|(uri, seconds)| (uri.to_string(), *seconds))
                .collect(),
            lookups: Arc::clone(&lookups),
        };
        build.register_resource("mem", Arc::new(backend));
        lookups
    }

    fn file_job(build: &Build, target: &str, deps: &[&str]) -> Arc<Job> {
        build
            .install_file(
                vec![Uri::parse(target).unwrap()],
                deps.iter().map(|d| Uri::parse(d).unwrap()).collect(),
                FileOpts::default(),
                no_op(),
            )
            .unwrap();
        build.job_for(&Uri::parse(target).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn newer_dep_means_stale() {
        let build = Build::new();
        scripted(&build, &[("mem://t", 10.0), ("mem://d", 20.0)]);
        let job = file_job(&build, "mem://t", &["mem://d"]);
        let fresh = Freshness::new(build);
        assert!(fresh.is_stale(&job).await.unwrap());
    }

    #[tokio::test]
    async fn equal_stamps_count_as_up_to_date() {
        let build = Build::new();
        scripted(&build, &[("mem://t", 10.0), ("mem://d", 10.0)]);
        let job = file_job(&build, "mem://t", &["mem://d"]);
        let fresh = Freshness::new(build);
        assert!(!fresh.is_stale(&job).await.unwrap());
    }

    #[tokio::test]
    async fn no_deps_means_fresh_when_target_exists() {
        let build = Build::new();
        scripted(&build, &[("mem://t", 10.0)]);
        let job = file_job(&build, "mem://t", &[]);
        let fresh = Freshness::new(build);
        assert!(!fresh.is_stale(&job).await.unwrap());
    }

    #[tokio::test]
    async fn missing_target_is_stale_and_warms_the_cache() {
        let build = Build::new();
        let lookups = scripted(&build, &[("mem://d", 20.0)]);
        let job = file_job(&build, "mem://t", &["mem://d"]);
        let fresh = Freshness::new(build);

        assert!(fresh.is_stale(&job).await.unwrap());
        // One lookup for the target, one to warm the dependency.
        pretty_assert_eq!(lookups.load(Ordering::SeqCst), 2);

        // A second evaluation reuses the warmed dependency stamp.
        assert!(fresh.is_stale(&job).await.unwrap());
        pretty_assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn absent_deps_are_acceptable_as_empty() {
        let build = Build::new();
        scripted(&build, &[("mem://t", 10.0)]);
        let job = file_job(&build, "mem://t", &["mem://missing"]);
        let fresh = Freshness::new(build);
        assert!(!fresh.is_stale(&job).await.unwrap());
    }

    #[tokio::test]
    async fn stamps_are_shared_between_rules() {
        let build = Build::new();
        let lookups = scripted(
            &build,
            &[("mem://a", 1.0), ("mem://b", 1.0), ("mem://d", 5.0)],
        );
        let first = file_job(&build, "mem://a", &["mem://d"]);
        let second = file_job(&build, "mem://b", &["mem://d"]);
        let fresh = Freshness::new(build);

        assert!(fresh.is_stale(&first).await.unwrap());
        assert!(fresh.is_stale(&second).await.unwrap());
        // Two target lookups, but the shared dependency resolves once.
        pretty_assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dry_run_inheritance_forces_staleness() {
        let build = Build::new();
        scripted(&build, &[("mem://t", 10.0), ("mem://d", 5.0)]);
        let job = file_job(&build, "mem://t", &["mem://d"]);
        let fresh = Freshness::new(build);

        assert!(!fresh.is_stale(&job).await.unwrap());
        job.dry_run.raise_if(true);
        assert!(fresh.is_stale(&job).await.unwrap());
    }
}

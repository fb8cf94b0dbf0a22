//! URI-addressed resources.
//!
//! Each URI scheme is served by a backend exposing the two operations the
//! engine needs: an effective modification time and removal. Backends are
//! registered in a scheme table at startup; the local filesystem is always
//! mounted at `file`.

pub mod local;

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use derive_more::{Display, Error};

use crate::uri::Uri;

pub use local::LocalFs;

/// Failure modes a backend may report.
///
/// Callers routinely need to tell plain absence apart from a real error, so
/// `NotFound` is its own kind rather than a flavour of `Io`.
#[derive(Debug, Display, Error)]
pub enum ResourceError {
    /// The resource does not exist.
    #[display("resource not found: {uri}")]
    NotFound {
        uri: Uri,
    },

    /// Any other I/O failure from the backend.
    #[display("i/o error for {uri}: {source}")]
    Io { uri: Uri, source: std::io::Error },

    /// No backend is registered for the URI's scheme.
    #[display("no resource backend for scheme {:?}: {uri}", uri.scheme())]
    UnsupportedScheme {
        uri: Uri,
    },
}

impl ResourceError {
    /// True when the failure is plain absence rather than a real error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn from_io(uri: &Uri, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { uri: uri.clone() }
        } else {
            Self::Io {
                uri: uri.clone(),
                source,
            }
        }
    }
}

/// A scheme backend.
///
/// `credential` is an opaque token taken from the target's metadata and
/// forwarded untouched; backends that don't need one ignore it.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Effective timestamp of `uri` in seconds since the Unix epoch.
    ///
    /// With `use_hash`, backends that support it return a content-stable
    /// stamp: rewriting identical bytes keeps the earlier time.
    async fn mtime(
        &self,
        uri: &Uri,
        credential: Option<&str>,
        use_hash: bool,
    ) -> Result<f64, ResourceError>;

    /// Remove `uri`.
    async fn rm(&self, uri: &Uri, credential: Option<&str>) -> Result<(), ResourceError>;
}

/// Scheme → backend table.
#[derive(Clone)]
pub struct Resources {
    by_scheme: Arc<DashMap<String, Arc<dyn Resource>>>,
}

impl Resources {
    /// A table with the local filesystem mounted at `file`, keeping its
    /// stamp sidecar under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let by_scheme: DashMap<String, Arc<dyn Resource>> = DashMap::new();
        by_scheme.insert("file".to_owned(), Arc::new(LocalFs::new(state_dir)) as Arc<dyn Resource>);
        Self {
            by_scheme: Arc::new(by_scheme),
        }
    }

    /// Mount `backend` at `scheme`, replacing any previous backend.
    pub fn register(&self, scheme: impl Into<String>, backend: Arc<dyn Resource>) {
        self.by_scheme.insert(scheme.into(), backend);
    }

    fn backend_for(&self, uri: &Uri) -> Result<Arc<dyn Resource>, ResourceError> {
        self.by_scheme
            .get(uri.scheme())
            .map(|backend| Arc::clone(backend.value()))
            .ok_or_else(|| ResourceError::UnsupportedScheme { uri: uri.clone() })
    }

    /// Dispatch a modification-time lookup by scheme.
    pub async fn mtime(
        &self,
        uri: &Uri,
        credential: Option<&str>,
        use_hash: bool,
    ) -> Result<f64, ResourceError> {
        self.backend_for(uri)?.mtime(uri, credential, use_hash).await
    }

    /// Dispatch a removal by scheme.
    pub async fn rm(&self, uri: &Uri, credential: Option<&str>) -> Result<(), ResourceError> {
        self.backend_for(uri)?.rm(uri, credential).await
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schemes = self
            .by_scheme
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        f.debug_struct("Resources").field("schemes", &schemes).finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    #[tokio::test]
    async fn unregistered_scheme_is_an_error() {
        let resources = Resources::new(tempfile::tempdir().unwrap().path());
        let uri = Uri::parse("s3://bucket/key").unwrap();
        let err = resources.mtime(&uri, None, false).await.unwrap_err();
        assert!(matches!(err, ResourceError::UnsupportedScheme { .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn registered_backend_takes_over() {
        struct Fixed;

        #[async_trait]
        impl Resource for Fixed {
            async fn mtime(
                &self,
                _uri: &Uri,
                _credential: Option<&str>,
                _use_hash: bool,
            ) -> Result<f64, ResourceError> {
                Ok(42.0)
            }

            async fn rm(&self, _uri: &Uri, _credential: Option<&str>) -> Result<(), ResourceError> {
                Ok(())
            }
        }

        let resources = Resources::new(tempfile::tempdir().unwrap().path());
        resources.register("mem", Arc::new(Fixed));
        let uri = Uri::parse("mem://x/y").unwrap();
        pretty_assert_eq!(resources.mtime(&uri, None, false).await.unwrap(), 42.0);
    }
}

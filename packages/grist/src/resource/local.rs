//! The local filesystem backend.
//!
//! Modification times are reported in seconds since the Unix epoch. With
//! hash stamps enabled, a sidecar database keyed by absolute path records
//! the earliest mtime at which each content hash was observed, so rewriting
//! a file with identical bytes keeps its earlier effective timestamp and
//! content-preserving touches do not ripple through the graph.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tap::TapFallible;
use tokio::{sync::OnceCell, task::spawn_blocking};
use tracing::{instrument, trace};

use super::{Resource, ResourceError};
use crate::{sync::lock, uri::Uri};

/// The `file` scheme backend.
pub struct LocalFs {
    state_dir: PathBuf,
    stamps: OnceCell<Arc<StampDb>>,
}

impl LocalFs {
    /// A backend whose stamp sidecar lives under `state_dir`.
    ///
    /// Nothing is created on disk until the first hash-stamp lookup.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            stamps: OnceCell::new(),
        }
    }

    async fn stamps(&self, uri: &Uri) -> Result<Arc<StampDb>, ResourceError> {
        let db = self
            .stamps
            .get_or_try_init(|| {
                let path = self.state_dir.join("stamps.sqlite");
                async move {
                    spawn_blocking(move || StampDb::open(&path).map(Arc::new))
                        .await
                        .map_err(|err| io::Error::other(format!("join stamp db open: {err}")))?
                }
            })
            .await
            .map_err(|err| ResourceError::Io {
                uri: uri.clone(),
                source: err,
            })?;
        Ok(Arc::clone(db))
    }
}

#[async_trait]
impl Resource for LocalFs {
    #[instrument(name = "LocalFs::mtime", skip(self, _credential))]
    async fn mtime(
        &self,
        uri: &Uri,
        _credential: Option<&str>,
        use_hash: bool,
    ) -> Result<f64, ResourceError> {
        let path = PathBuf::from(uri.path());
        // symlink_metadata so a dangling symlink still counts as present.
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|err| ResourceError::from_io(uri, err))?;
        let modified = metadata
            .modified()
            .map_err(|err| ResourceError::from_io(uri, err))?;
        let seconds = epoch_seconds(modified);
        if !use_hash || !metadata.is_file() {
            trace!(%uri, seconds, "mtime");
            return Ok(seconds);
        }

        let db = self.stamps(uri).await?;
        let size = metadata.len();
        let stamped = spawn_blocking(move || db.stamp(&path, size, seconds))
            .await
            .map_err(|err| ResourceError::Io {
                uri: uri.clone(),
                source: io::Error::other(format!("join stamp task: {err}")),
            })?
            .map_err(|err| ResourceError::Io {
                uri: uri.clone(),
                source: err,
            })?;
        trace!(%uri, seconds, stamped, "hash-stable mtime");
        Ok(stamped)
    }

    #[instrument(name = "LocalFs::rm", skip(self, _credential))]
    async fn rm(&self, uri: &Uri, _credential: Option<&str>) -> Result<(), ResourceError> {
        tokio::fs::remove_file(uri.path())
            .await
            .map_err(|err| ResourceError::from_io(uri, err))
            .tap_ok(|_| trace!(%uri, "removed"))
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        // Pre-epoch mtimes are legal on most filesystems.
        Err(err) => -err.duration().as_secs_f64(),
    }
}

/// Sidecar store for content-stable stamps.
///
/// One row per absolute path: the size and mtime the file had when last
/// hashed, its content hash, and the earliest mtime observed for that hash.
struct StampDb {
    conn: Mutex<Connection>,
}

impl StampDb {
    /// Open or create the database at the given path.
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            // std::fs is fine here: this runs inside spawn_blocking.
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(io::Error::other)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema().map_err(io::Error::other)?;
        Ok(db)
    }

    /// Create an in-memory database for testing.
    #[cfg(test)]
    fn in_memory() -> io::Result<Self> {
        let conn = Connection::open_in_memory().map_err(io::Error::other)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema().map_err(io::Error::other)?;
        Ok(db)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        lock(&self.conn).execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stamps (
                path TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                mtime REAL NOT NULL,
                hash TEXT NOT NULL,
                stamp REAL NOT NULL
            );
            "#,
        )
    }

    /// Effective timestamp for `path` given its current size and mtime.
    ///
    /// The file is only re-hashed when its (size, mtime) pair has changed
    /// since the last call that saw it.
    fn stamp(&self, path: &Path, size: u64, mtime: f64) -> io::Result<f64> {
        let key = absolute_key(path)?;
        let row = self.fetch(&key).map_err(io::Error::other)?;
        if let Some(row) = &row {
            if row.size == size && row.mtime == mtime {
                return Ok(row.stamp);
            }
        }

        let hash = hash_file(path)?;
        let conn = lock(&self.conn);
        if let Some(row) = &row {
            if row.hash == hash {
                // Same bytes under a new mtime: remember the touch, keep the stamp.
                conn.execute(
                    "UPDATE stamps SET size = ?2, mtime = ?3 WHERE path = ?1",
                    params![key, size as i64, mtime],
                )
                .map_err(io::Error::other)?;
                return Ok(row.stamp);
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO stamps (path, size, mtime, hash, stamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, size as i64, mtime, hash, mtime],
        )
        .map_err(io::Error::other)?;
        Ok(mtime)
    }

    fn fetch(&self, key: &str) -> rusqlite::Result<Option<StampRow>> {
        lock(&self.conn)
            .query_row(
                "SELECT size, mtime, hash, stamp FROM stamps WHERE path = ?1",
                params![key],
                |row| {
                    Ok(StampRow {
                        size: row.get::<_, i64>(0)? as u64,
                        mtime: row.get(1)?,
                        hash: row.get(2)?,
                        stamp: row.get(3)?,
                    })
                },
            )
            .optional()
    }
}

struct StampRow {
    size: u64,
    mtime: f64,
    hash: String,
    stamp: f64,
}

fn absolute_key(path: &Path) -> io::Result<String> {
    let absolute = std::path::absolute(path)?;
    Ok(absolute.to_string_lossy().into_owned())
}

/// Hash the file's contents, streamed.
fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

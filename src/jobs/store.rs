//! Filesystem marker protocol for job runs.
//!
//! A run of job `name` is represented by at most one of two files in the
//! marker directory: `<name>.stdout` while the process is alive and
//! `<name>.finish` once it has exited. Both hold the captured standard
//! output. The transition between them is a single `rename`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Running,
    Done,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 2] = [MarkerKind::Running, MarkerKind::Done];

    pub fn extension(self) -> &'static str {
        match self {
            MarkerKind::Running => "stdout",
            MarkerKind::Done => "finish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunState {
    Absent,
    Running,
    Finished,
    Stale,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("недопустимое имя задачи '{0}'")]
    InvalidName(String),
    #[error("маркер {path} уже существует")]
    AlreadyExists { path: String },
    #[error("ошибка работы с маркером {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

pub fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str, kind: MarkerKind) -> Result<PathBuf, StoreError> {
        if !is_valid_job_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.{}", kind.extension())))
    }

    pub async fn exists(&self, name: &str, kind: MarkerKind) -> Result<bool, StoreError> {
        let path = self.path(name, kind)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    pub async fn state(&self, name: &str) -> Result<JobRunState, StoreError> {
        let running = self.exists(name, MarkerKind::Running).await?;
        let done = self.exists(name, MarkerKind::Done).await?;
        Ok(match (running, done) {
            (false, false) => JobRunState::Absent,
            (true, false) => JobRunState::Running,
            (false, true) => JobRunState::Finished,
            (true, true) => JobRunState::Stale,
        })
    }

    pub async fn create_running(&self, name: &str) -> Result<RunningMarker, StoreError> {
        let path = self.path(name, MarkerKind::Running)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| StoreError::io(&self.dir, err))?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::AlreadyExists {
                    StoreError::AlreadyExists {
                        path: path.display().to_string(),
                    }
                } else {
                    StoreError::io(&path, err)
                }
            })?;

        debug!(marker = %path.display(), "running marker created");
        Ok(RunningMarker { path, file })
    }

    pub async fn append_output(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(name, MarkerKind::Running)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.flush().await.map_err(|err| StoreError::io(&path, err))
    }

    pub async fn seal(&self, name: &str) -> Result<(), StoreError> {
        let running = self.path(name, MarkerKind::Running)?;
        let done = self.path(name, MarkerKind::Done)?;
        fs::rename(&running, &done)
            .await
            .map_err(|err| StoreError::io(&running, err))
    }

    pub async fn read(&self, name: &str) -> Result<String, StoreError> {
        for kind in MarkerKind::ALL {
            let path = self.path(name, kind)?;
            match fs::read(&path).await {
                Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                // Sealing may rename the running marker between the two reads.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(&path, err)),
            }
        }
        Ok(String::new())
    }

    pub async fn remove(&self, name: &str, kind: MarkerKind) -> Result<(), StoreError> {
        let path = self.path(name, kind)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    pub async fn clear_all(&self) -> usize {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "marker directory does not exist");
                return 0;
            }
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot read marker directory");
                return 0;
            }
        };

        info!(dir = %self.dir.display(), "clearing job markers");
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %self.dir.display(), error = %err, "marker directory enumeration failed");
                    break;
                }
            };

            let path = entry.path();
            if !is_marker_path(&path) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(marker = %path.display(), error = %err, "cannot stat marker");
                    continue;
                }
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(marker = %path.display(), "marker deleted");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(marker = %path.display(), error = %err, "cannot delete marker"),
            }
        }
        removed
    }
}

fn is_marker_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MarkerKind::ALL.iter().any(|k| k.extension() == ext))
}

#[derive(Debug)]
pub struct RunningMarker {
    path: PathBuf,
    file: File,
}

impl RunningMarker {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|err| StoreError::io(&self.path, err))?;
        self.file
            .flush()
            .await
            .map_err(|err| StoreError::io(&self.path, err))
    }

    pub async fn close(mut self) -> Result<(), StoreError> {
        self.file
            .sync_all()
            .await
            .map_err(|err| StoreError::io(&self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, MarkerStore) {
        let dir = TempDir::new().expect("временный каталог");
        let store = MarkerStore::new(dir.path().join("cmd"));
        (dir, store)
    }

    #[test]
    fn job_name_validation() {
        assert!(is_valid_job_name("get_storages"));
        assert!(is_valid_job_name("ping-10.localhost"));
        assert!(!is_valid_job_name(""));
        assert!(!is_valid_job_name(".hidden"));
        assert!(!is_valid_job_name("../etc/passwd"));
        assert!(!is_valid_job_name("a/b"));
        assert!(!is_valid_job_name("with space"));
        assert!(!is_valid_job_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }

    #[tokio::test]
    async fn marker_lifecycle_running_then_done() {
        let (_tmp, store) = store();
        assert_eq!(store.state("job").await.unwrap(), JobRunState::Absent);

        let mut marker = store.create_running("job").await.unwrap();
        assert_eq!(store.state("job").await.unwrap(), JobRunState::Running);
        assert!(marker.path().ends_with("job.stdout"));

        marker.append(b"line 1\n").await.unwrap();
        assert_eq!(store.read("job").await.unwrap(), "line 1\n");
        marker.append(b"line 2\n").await.unwrap();
        marker.close().await.unwrap();

        store.seal("job").await.unwrap();
        assert_eq!(store.state("job").await.unwrap(), JobRunState::Finished);
        assert!(!store.exists("job", MarkerKind::Running).await.unwrap());
        assert_eq!(store.read("job").await.unwrap(), "line 1\nline 2\n");
    }

    #[tokio::test]
    async fn create_running_is_exclusive() {
        let (_tmp, store) = store();
        let _first = store.create_running("job").await.unwrap();
        let err = store.create_running("job").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn append_output_reopens_running_marker() {
        let (_tmp, store) = store();
        let mut marker = store.create_running("job").await.unwrap();
        marker.append(b"a").await.unwrap();
        store.append_output("job", b"b").await.unwrap();
        assert_eq!(store.read("job").await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn read_of_unknown_job_is_empty() {
        let (_tmp, store) = store();
        assert_eq!(store.read("never_started").await.unwrap(), "");
    }

    #[tokio::test]
    async fn invalid_names_never_touch_the_filesystem() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.read("../secret").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.create_running("a/b").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn remove_missing_marker_is_ok() {
        let (_tmp, store) = store();
        store.remove("job", MarkerKind::Done).await.unwrap();
    }

    #[tokio::test]
    async fn both_markers_report_stale() {
        let (_tmp, store) = store();
        let _m = store.create_running("job").await.unwrap();
        std::fs::write(store.path("job", MarkerKind::Done).unwrap(), "old").unwrap();
        assert_eq!(store.state("job").await.unwrap(), JobRunState::Stale);
    }

    #[tokio::test]
    async fn clear_all_handles_missing_and_empty_dir() {
        let (_tmp, store) = store();
        assert_eq!(store.clear_all().await, 0);
        std::fs::create_dir_all(store.dir()).unwrap();
        assert_eq!(store.clear_all().await, 0);
    }

    #[tokio::test]
    async fn clear_all_removes_only_markers_and_is_idempotent() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("a.stdout"), "x").unwrap();
        std::fs::write(store.dir().join("b.finish"), "y").unwrap();
        std::fs::write(store.dir().join("c.stdout"), "z").unwrap();
        std::fs::write(store.dir().join("c.finish"), "z").unwrap();
        std::fs::write(store.dir().join("README"), "keep").unwrap();
        std::fs::create_dir(store.dir().join("nested.finish")).unwrap();

        assert_eq!(store.clear_all().await, 4);
        assert_eq!(store.clear_all().await, 0);

        for name in ["a", "b", "c"] {
            assert_eq!(store.state(name).await.unwrap(), JobRunState::Absent);
        }
        assert!(store.dir().join("README").exists());
        assert!(store.dir().join("nested.finish").is_dir());
    }
}

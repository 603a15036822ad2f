//! Persistence of index generations
//!
//! A generation is the pair (vector index, chunk store). The pair is always
//! replaced as a unit: [`FileStorage::save`] stages both artifacts next to
//! their targets, records a commit journal, then renames both into place
//! while holding an exclusive lock. Readers take a shared lock for the
//! duration of a load, so they see the old pair or the new pair, never a mix.
//! A journal left behind by a crash is rolled forward on the next access.
//!
//! Independently of locking, every load checks that the row counts match and
//! that the index carries the digest of the chunk ids it was built with.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::store::ChunkStore;

/// One mutually consistent (vector index, chunk store) pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    index: VectorIndex,
    store: ChunkStore,
}

impl Generation {
    /// Pair an index with its chunk store, binding the index to the store digest
    pub fn new(mut index: VectorIndex, store: ChunkStore) -> Result<Self> {
        if index.len() != store.len() {
            return Err(RagError::PersistenceCorrupt(format!(
                "Index has {} vectors but chunk store has {} records",
                index.len(),
                store.len()
            )));
        }
        index.set_metadata_digest(store.digest());
        Ok(Self { index, store })
    }

    /// Check that a loaded pair belongs together
    fn verify(index: VectorIndex, store: ChunkStore) -> Result<Self> {
        if index.len() != store.len() {
            return Err(RagError::PersistenceCorrupt(format!(
                "Index has {} vectors but metadata has {} records",
                index.len(),
                store.len()
            )));
        }
        if index.metadata_digest() != store.digest() {
            return Err(RagError::PersistenceCorrupt(
                "Vector index and metadata come from different generations".into(),
            ));
        }
        Ok(Self { index, store })
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn into_parts(self) -> (VectorIndex, ChunkStore) {
        (self.index, self.store)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Builds the next generation from the current one
pub type UpdateFn<'a> = Box<dyn FnOnce(Option<Generation>) -> Result<Generation> + 'a>;

/// Storage backend for generations
pub trait Storage: Send + Sync {
    /// Current generation, or `None` when nothing has been persisted
    fn load(&self) -> Result<Option<Generation>>;

    /// Replace the current generation
    fn save(&self, generation: &Generation) -> Result<()>;

    /// Read-modify-write under one exclusive hold of the target.
    ///
    /// `f` receives the current generation and returns its replacement, which
    /// is committed before any other writer can load or save. Returns the
    /// committed generation.
    fn update(&self, f: UpdateFn<'_>) -> Result<Generation>;

    /// Whether a generation is present
    fn exists(&self) -> bool;

    /// Remove the current generation
    fn clear(&self) -> Result<()>;

    /// Location for logs and status output
    fn describe(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitJournal {
    generation: String,
    staged_metadata: PathBuf,
    staged_index: PathBuf,
}

/// Generation stored as a vector blob plus a JSON metadata file
#[derive(Debug, Clone)]
pub struct FileStorage {
    index_path: PathBuf,
    metadata_path: PathBuf,
    chunks_text_path: Option<PathBuf>,
}

impl FileStorage {
    pub fn new(index_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            metadata_path: metadata_path.into(),
            chunks_text_path: None,
        }
    }

    /// Also write a human-readable chunk dump after every save
    pub fn with_text_dump(mut self, path: Option<PathBuf>) -> Self {
        self.chunks_text_path = path;
        self
    }

    pub fn from_config(config: &crate::config::RagConfig) -> Self {
        Self::new(&config.index_path, &config.metadata_path)
            .with_text_dump(config.chunks_text_path.clone())
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    fn lock_path(&self) -> PathBuf {
        suffixed(&self.index_path, "lock")
    }

    fn journal_path(&self) -> PathBuf {
        suffixed(&self.index_path, "commit")
    }

    fn ensure_dirs(&self) -> Result<()> {
        for path in [&self.index_path, &self.metadata_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File> {
        self.ensure_dirs()?;
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?)
    }

    fn lock_exclusive(&self) -> Result<LockGuard> {
        let file = self.open_lock_file()?;
        FileExt::lock_exclusive(&file)?;
        Ok(LockGuard(file))
    }

    fn lock_shared(&self) -> Result<LockGuard> {
        let file = self.open_lock_file()?;
        FileExt::lock_shared(&file)?;
        Ok(LockGuard(file))
    }

    /// Finish or discard an interrupted commit. Caller holds the exclusive lock.
    fn recover_locked(&self) -> Result<()> {
        let journal_path = self.journal_path();
        if journal_path.exists() {
            let journal: CommitJournal = serde_json::from_str(&fs::read_to_string(&journal_path)?)
                .map_err(|e| RagError::PersistenceCorrupt(format!("Unreadable commit journal: {e}")))?;

            tracing::warn!(
                "Rolling forward interrupted commit of generation {}",
                journal.generation
            );
            if journal.staged_metadata.exists() {
                fs::rename(&journal.staged_metadata, &self.metadata_path)?;
            }
            if journal.staged_index.exists() {
                fs::rename(&journal.staged_index, &self.index_path)?;
            }
            sync_parent(&self.index_path);
            fs::remove_file(&journal_path)?;
        }

        self.remove_stale_staging();
        Ok(())
    }

    /// Delete staged files from commits that never reached the journal
    fn remove_stale_staging(&self) {
        for target in [&self.index_path, &self.metadata_path] {
            let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
                continue;
            };
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            let prefix = format!(".{}.", name.to_string_lossy());
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with(&prefix) && file_name.ends_with(".tmp") {
                    tracing::debug!("Removing stale staged file {}", file_name);
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    fn write_journal(&self, journal: &CommitJournal) -> Result<()> {
        let path = self.journal_path();
        let tmp = suffixed(&path, "tmp");
        let file = File::create(&tmp)?;
        serde_json::to_writer(&file, journal)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        sync_parent(&path);
        Ok(())
    }

    /// Read the pair as it is on disk. Caller holds a lock.
    fn read_locked(&self) -> Result<Option<Generation>> {
        match (self.index_path.exists(), self.metadata_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) | (false, true) => {
                return Err(RagError::PersistenceCorrupt(format!(
                    "Only one of {} and {} is present",
                    self.index_path.display(),
                    self.metadata_path.display()
                )))
            }
            (true, true) => {}
        }

        let index = VectorIndex::load(&self.index_path)?;
        let store = ChunkStore::load_json(&self.metadata_path)?;
        let generation = Generation::verify(index, store)?;

        tracing::info!(
            "Loaded generation from {:?}: {} vectors, {} chunks",
            self.index_path,
            generation.index.len(),
            generation.store.len()
        );
        Ok(Some(generation))
    }

    /// Stage, journal and rename both files into place. Caller holds the exclusive lock.
    fn commit_locked(&self, generation: &Generation) -> Result<()> {
        let id = Uuid::new_v4().simple().to_string();
        let journal = CommitJournal {
            staged_index: staged_path(&self.index_path, &id),
            staged_metadata: staged_path(&self.metadata_path, &id),
            generation: id,
        };

        if let Err(e) = self.stage(generation, &journal) {
            let _ = fs::remove_file(&journal.staged_index);
            let _ = fs::remove_file(&journal.staged_metadata);
            return Err(e);
        }

        // From here on the commit completes, now or during recovery
        self.write_journal(&journal)?;
        fs::rename(&journal.staged_metadata, &self.metadata_path)?;
        fs::rename(&journal.staged_index, &self.index_path)?;
        sync_parent(&self.index_path);
        fs::remove_file(self.journal_path())?;

        tracing::info!(
            "Committed generation {} ({} chunks, dim {}) to {:?}",
            journal.generation,
            generation.len(),
            generation.index.dim(),
            self.index_path
        );

        if let Some(path) = &self.chunks_text_path {
            if let Err(e) = generation.store.write_text_dump(path) {
                tracing::warn!("Failed to write chunk dump {:?}: {}", path, e);
            }
        }

        Ok(())
    }

    fn stage(&self, generation: &Generation, journal: &CommitJournal) -> Result<()> {
        generation.index.persist(&journal.staged_index)?;
        generation.store.save_json(&journal.staged_metadata)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Option<Generation>> {
        if self.journal_path().exists() {
            let _lock = self.lock_exclusive()?;
            self.recover_locked()?;
        }

        let _lock = self.lock_shared()?;
        self.read_locked()
    }

    fn save(&self, generation: &Generation) -> Result<()> {
        self.ensure_dirs()?;
        let _lock = self.lock_exclusive()?;
        self.recover_locked()?;
        self.commit_locked(generation)
    }

    fn update(&self, f: UpdateFn<'_>) -> Result<Generation> {
        self.ensure_dirs()?;
        let _lock = self.lock_exclusive()?;
        self.recover_locked()?;
        let next = f(self.read_locked()?)?;
        self.commit_locked(&next)?;
        Ok(next)
    }

    fn exists(&self) -> bool {
        self.index_path.exists() && self.metadata_path.exists()
    }

    fn clear(&self) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        self.recover_locked()?;
        for path in [Some(&self.index_path), Some(&self.metadata_path), self.chunks_text_path.as_ref()]
            .into_iter()
            .flatten()
        {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Cleared generation at {:?}", self.index_path);
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} + {}",
            self.index_path.display(),
            self.metadata_path.display()
        )
    }
}

struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// `path` with `.suffix` appended to the file name
fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Hidden staging file next to `target`: `.<name>.<id>.tmp`
fn staged_path(target: &Path, id: &str) -> PathBuf {
    let name = target.file_name().unwrap_or_default().to_string_lossy();
    target.with_file_name(format!(".{name}.{id}.tmp"))
}

/// Flush directory entries so renames survive a crash
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// In-process storage, for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStorage {
    current: RwLock<Option<Generation>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<Generation>> {
        let guard = self
            .current
            .read()
            .map_err(|_| RagError::PersistenceCorrupt("storage lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, generation: &Generation) -> Result<()> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| RagError::PersistenceCorrupt("storage lock poisoned".into()))?;
        *guard = Some(generation.clone());
        Ok(())
    }

    fn update(&self, f: UpdateFn<'_>) -> Result<Generation> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| RagError::PersistenceCorrupt("storage lock poisoned".into()))?;
        let next = f(guard.clone())?;
        *guard = Some(next.clone());
        Ok(next)
    }

    fn exists(&self) -> bool {
        self.current.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| RagError::PersistenceCorrupt("storage lock poisoned".into()))?;
        *guard = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

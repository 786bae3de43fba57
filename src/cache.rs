//! The shared content cache.
//!
//! Entries live under `$CACHE_ROOT/assets/<canonical-identity-hash>/` with a
//! four-directory staging area: `fetch` (raw downloads, persists across
//! runs), `tmp` (scratch), `stage` (extracted/built sources) and `install`
//! (the finished asset). A [`EntryLock`] owns an entry exclusively for the
//! duration of a recipe's work; promotion at completion writes a `result`
//! marker holding the recipe's result hash, and anything short of promotion
//! purges the work areas on release.
//!
//! Cross-process exclusion uses fs2 advisory locks on
//! `$CACHE_ROOT/locks/<hash>.lock`; same-process contenders serialise on an
//! in-process held-set so acquisition blocks instead of failing.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use fs2::FileExt;

use crate::error::CacheError;
use crate::key::RecipeKey;
use crate::util::fs as fsutil;

/// Name of the promotion marker inside an entry.
const RESULT_MARKER: &str = "result";

#[derive(Debug)]
struct CacheInner {
    root: PathBuf,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Handle to the user-wide cache. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Open (creating if needed) a cache under `root`.
    pub fn open(root: impl AsRef<Path>) -> std::io::Result<Cache> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("assets"))?;
        std::fs::create_dir_all(root.join("locks"))?;
        std::fs::create_dir_all(root.join("recipes"))?;
        Ok(Cache {
            inner: Arc::new(CacheInner {
                root,
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
            }),
        })
    }

    /// The default user-wide cache root (`~/.cache/envy`).
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("envy")
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Where recipe script files are cached.
    pub fn recipes_dir(&self) -> PathBuf {
        self.inner.root.join("recipes")
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.inner.root.join("assets").join(hash)
    }

    /// The install directory an entry would promote to, without locking.
    pub fn install_dir_of(&self, key: &RecipeKey) -> PathBuf {
        self.entry_dir(&key.hash()).join("install")
    }

    /// Acquire exclusive ownership of `key`'s entry, blocking until any
    /// current holder releases it. Resets tmp and stage; fetch and install
    /// survive from previous runs.
    pub fn lock_entry(&self, key: &RecipeKey) -> Result<EntryLock, CacheError> {
        let identity = key.canonical();
        let hash = key.hash();
        let prepare = |source| CacheError::Prepare {
            identity: identity.clone(),
            source,
        };

        {
            let mut held = self.inner.held.lock().expect("cache held-set poisoned");
            while held.contains(&hash) {
                held = self
                    .inner
                    .released
                    .wait(held)
                    .expect("cache held-set poisoned");
            }
            held.insert(hash.clone());
        }

        // Past this point, release_held must run on every failure path; a
        // constructed EntryLock handles it through Drop.
        let acquire = || -> Result<EntryLock, CacheError> {
            let lock_path = self.inner.root.join("locks").join(format!("{hash}.lock"));
            let lock_file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(prepare)?;
            lock_file.lock_exclusive().map_err(|_| CacheError::LockHeld {
                identity: identity.clone(),
                lock_path: lock_path.clone(),
            })?;

            let entry_dir = self.entry_dir(&hash);
            for sub in ["fetch", "install"] {
                std::fs::create_dir_all(entry_dir.join(sub)).map_err(prepare)?;
            }
            for sub in ["tmp", "stage"] {
                fsutil::reset_dir(&entry_dir.join(sub)).map_err(prepare)?;
            }

            Ok(EntryLock {
                cache: Arc::clone(&self.inner),
                identity: identity.clone(),
                hash: hash.clone(),
                entry_dir,
                lock_file: Some(lock_file),
                promoted: false,
                ephemeral: false,
            })
        };

        match acquire() {
            Ok(lock) => Ok(lock),
            Err(e) => {
                self.inner.release_held(&hash);
                Err(e)
            }
        }
    }
}

impl CacheInner {
    fn release_held(&self, hash: &str) {
        let mut held = self.held.lock().expect("cache held-set poisoned");
        held.remove(hash);
        self.released.notify_all();
    }
}

/// Exclusive, RAII ownership of one cache entry.
#[derive(Debug)]
pub struct EntryLock {
    cache: Arc<CacheInner>,
    identity: String,
    hash: String,
    entry_dir: PathBuf,
    lock_file: Option<File>,
    promoted: bool,
    ephemeral: bool,
}

impl EntryLock {
    pub fn fetch_dir(&self) -> PathBuf {
        self.entry_dir.join("fetch")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.entry_dir.join("tmp")
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.entry_dir.join("stage")
    }

    pub fn install_dir(&self) -> PathBuf {
        self.entry_dir.join("install")
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Mark this workspace ephemeral: the whole entry is purged on release,
    /// success or not. Used for user-managed recipes.
    pub fn set_ephemeral(&mut self) {
        self.ephemeral = true;
    }

    /// The result hash of a previously promoted run, if any.
    pub fn installed_result(&self) -> Option<String> {
        let text = std::fs::read_to_string(self.entry_dir.join(RESULT_MARKER)).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Drop the promotion marker. The install phase calls this before it
    /// rewrites install_dir, so a failure mid-install never leaves a marker
    /// pointing at partial artifacts.
    pub fn clear_marker(&self) -> Result<(), CacheError> {
        fsutil::remove_path(&self.entry_dir.join(RESULT_MARKER)).map_err(|source| {
            CacheError::Prepare {
                identity: self.identity.clone(),
                source,
            }
        })
    }

    /// Promote the entry: record `result_hash`, purge the work areas, keep
    /// install. Fails if a previous run left a different result hash.
    pub fn promote(&mut self, result_hash: &str) -> Result<(), CacheError> {
        if let Some(existing) = self.installed_result() {
            if existing != result_hash {
                return Err(CacheError::ResultHashMismatch {
                    identity: self.identity.clone(),
                    existing,
                    computed: result_hash.to_string(),
                });
            }
        }
        let write = |source| CacheError::Prepare {
            identity: self.identity.clone(),
            source,
        };
        std::fs::write(self.entry_dir.join(RESULT_MARKER), result_hash).map_err(write)?;
        fsutil::remove_path(&self.tmp_dir()).map_err(write)?;
        fsutil::remove_path(&self.stage_dir()).map_err(write)?;
        self.promoted = true;
        Ok(())
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if self.ephemeral {
            let _ = fsutil::remove_path(&self.entry_dir);
        } else if !self.promoted {
            let _ = fsutil::remove_path(&self.tmp_dir());
            let _ = fsutil::remove_path(&self.stage_dir());
            // A marker from an earlier successful run keeps its install tree.
            if !self.entry_dir.join(RESULT_MARKER).exists() {
                let _ = fsutil::remove_path(&self.install_dir());
            }
        }
        // File drop releases the advisory lock; the lock file stays on disk.
        self.lock_file.take();
        self.cache.release_held(&self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn key(s: &str) -> RecipeKey {
        RecipeKey::parse(s).unwrap()
    }

    #[test]
    fn lock_exposes_staging_dirs() {
        let (_dir, cache) = test_cache();
        let lock = cache.lock_entry(&key("local.a@v1")).unwrap();
        for dir in [lock.fetch_dir(), lock.tmp_dir(), lock.stage_dir(), lock.install_dir()] {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }
    }

    #[test]
    fn second_acquire_blocks_until_release() {
        let (_dir, cache) = test_cache();
        let k = key("local.a@v1");
        let lock = cache.lock_entry(&k).unwrap();

        let cache2 = cache.clone();
        let k2 = k.clone();
        let handle = std::thread::spawn(move || {
            let _lock = cache2.lock_entry(&k2).unwrap();
        });

        // The second acquire must still be waiting while we hold the lock.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        drop(lock);
        handle.join().unwrap();
    }

    #[test]
    fn unpromoted_release_purges_work_areas() {
        let (_dir, cache) = test_cache();
        let k = key("local.a@v1");
        let lock = cache.lock_entry(&k).unwrap();
        std::fs::write(lock.fetch_dir().join("src.tar"), "raw").unwrap();
        std::fs::write(lock.stage_dir().join("half"), "partial").unwrap();
        std::fs::write(lock.install_dir().join("broken"), "partial").unwrap();
        drop(lock);

        let lock = cache.lock_entry(&k).unwrap();
        assert!(lock.fetch_dir().join("src.tar").is_file(), "fetch cache survives");
        assert!(!lock.stage_dir().join("half").exists());
        assert!(!lock.install_dir().join("broken").exists());
        assert!(lock.installed_result().is_none());
    }

    #[test]
    fn promotion_keeps_install_and_records_result() {
        let (_dir, cache) = test_cache();
        let k = key("local.a@v1");
        let mut lock = cache.lock_entry(&k).unwrap();
        std::fs::write(lock.install_dir().join("bin"), "asset").unwrap();
        lock.promote("abc123").unwrap();
        drop(lock);

        let lock = cache.lock_entry(&k).unwrap();
        assert_eq!(lock.installed_result().as_deref(), Some("abc123"));
        assert!(lock.install_dir().join("bin").is_file());
    }

    #[test]
    fn promotion_over_mismatching_result_fails() {
        let (_dir, cache) = test_cache();
        let k = key("local.a@v1");
        let mut lock = cache.lock_entry(&k).unwrap();
        lock.promote("first").unwrap();
        drop(lock);

        let mut lock = cache.lock_entry(&k).unwrap();
        let err = lock.promote("second").unwrap_err();
        assert!(err.to_string().contains("result hash"));

        lock.clear_marker().unwrap();
        lock.promote("second").unwrap();
    }

    #[test]
    fn ephemeral_release_purges_everything() {
        let (_dir, cache) = test_cache();
        let k = key("local.user@v1");
        let mut lock = cache.lock_entry(&k).unwrap();
        lock.set_ephemeral();
        std::fs::write(lock.fetch_dir().join("raw"), "x").unwrap();
        let entry = lock.install_dir().parent().unwrap().to_path_buf();
        drop(lock);
        assert!(!entry.exists());
    }

    #[test]
    fn distinct_options_get_distinct_entries() {
        let (_dir, cache) = test_cache();
        let a = cache.lock_entry(&key("local.a@v1{variant=x}")).unwrap();
        let b = cache.lock_entry(&key("local.a@v1{variant=y}")).unwrap();
        assert_ne!(a.install_dir(), b.install_dir());
    }
}

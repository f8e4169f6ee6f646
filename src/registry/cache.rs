use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::properties;
use crate::{
    common::{address::EndpointAddress, scheduler::Scheduler},
    config::RegistryConfig,
    error::{Error, Result},
};

const HEADER: &str = "dendrite registry cache";

/// Service key to provider address strings, mirrored to one file per
/// registry backend.
///
/// The file is read once on construction. Mutations mark the cache dirty and
/// are written on the blocking pool, either right away (`sync_save`) or by a
/// task that runs after the flush delay and picks up every mutation made in
/// the meantime. A
/// failed write is logged and retried on the next mutation and on
/// [`LocalCache::flush`].
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    entries: Mutex<HashMap<String, BTreeSet<String>>>,
    version: AtomicU64,
    written: AtomicU64,
    flush_pending: AtomicBool,
    // serializes writers inside this process; the file lock covers others
    write_lock: Mutex<()>,
    config: RegistryConfig,
    scheduler: Arc<Scheduler>,
}

impl LocalCache {
    /// `{cache_dir}/registry-{host}-{port}.cache` for a registry backend.
    pub fn file_for(cache_dir: &Path, registry: &EndpointAddress) -> PathBuf {
        let host = registry.host().unwrap_or("local").replace(['/', '\\'], "_");
        cache_dir.join(format!("registry-{host}-{}.cache", registry.port()))
    }

    /// Opens the cache at `path`. A missing or unreadable file yields an
    /// empty cache.
    pub fn open(
        path: impl Into<PathBuf>,
        config: RegistryConfig,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let path = path.into();
        let entries = load(&path);
        debug!(
            path = %path.display(),
            keys = entries.len(),
            "registry cache loaded"
        );
        Self {
            inner: Arc::new(Inner {
                path,
                entries: Mutex::new(entries),
                version: AtomicU64::new(0),
                written: AtomicU64::new(0),
                flush_pending: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                config,
                scheduler,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// The raw address strings stored under `key`.
    pub fn get(&self, key: &str) -> Option<BTreeSet<String>> {
        self.inner.entries.lock().get(key).cloned()
    }

    /// The addresses stored under `key`. Entries that no longer parse are
    /// skipped.
    pub fn addresses(&self, key: &str) -> Option<Vec<EndpointAddress>> {
        let raw = self.get(key)?;
        Some(
            raw.iter()
                .filter_map(|text| match EndpointAddress::parse(text) {
                    Ok(address) => Some(address),
                    Err(e) => {
                        warn!(%key, %e, "skipping unreadable cache entry");
                        None
                    }
                })
                .collect(),
        )
    }

    pub fn insert(&self, key: &str, address: &EndpointAddress) -> bool {
        let changed = self
            .inner
            .entries
            .lock()
            .entry_ref(key)
            .or_default()
            .insert(address.to_string());
        self.mutated(changed)
    }

    pub fn remove(&self, key: &str, address: &EndpointAddress) -> bool {
        let text = address.to_string();
        self.remove_where(key, |entry| *entry == text)
    }

    /// Removes the entries under `key` that match `predicate`, and the key
    /// itself once it is empty.
    pub fn remove_where(
        &self,
        key: &str,
        predicate: impl Fn(&String) -> bool,
    ) -> bool {
        let changed = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(key) {
                Some(set) => {
                    let before = set.len();
                    set.retain(|entry| !predicate(entry));
                    let changed = set.len() != before;
                    if set.is_empty() {
                        entries.remove(key);
                    }
                    changed
                }
                None => false,
            }
        };
        self.mutated(changed)
    }

    /// Replaces everything under `key`. An empty set keeps the key so that a
    /// lookup of a service without providers is still answered locally.
    pub fn replace<'a, I>(&self, key: &str, addresses: I) -> bool
    where
        I: IntoIterator<Item = &'a EndpointAddress>,
    {
        let fresh: BTreeSet<String> =
            addresses.into_iter().map(ToString::to_string).collect();
        let changed = {
            let mut entries = self.inner.entries.lock();
            let slot = entries.entry_ref(key).or_default();
            if *slot == fresh {
                false
            } else {
                *slot = fresh;
                true
            }
        };
        self.mutated(changed)
    }

    /// Writes the cache now if anything changed since the last write.
    pub fn flush(&self) -> Result<()> {
        self.inner.write()
    }

    /// [`LocalCache::flush`] on the blocking pool.
    pub async fn flush_async(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.write())
            .await
            .map_err(|e| Error::Registry(format!("cache flush task: {e}")))?
    }

    /// With `sync_save`, waits until every mutation made so far is on disk.
    pub async fn saved(&self) -> Result<()> {
        if self.inner.config.sync_save {
            self.flush_async().await
        } else {
            Ok(())
        }
    }

    fn mutated(&self, changed: bool) -> bool {
        if !changed {
            return false;
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        if self.inner.config.sync_save {
            let inner = self.inner.clone();
            self.inner.scheduler.handle().spawn_blocking(move || {
                if let Err(e) = inner.write() {
                    warn!(
                        path = %inner.path.display(),
                        %e,
                        "registry cache write failed"
                    );
                }
            });
        } else {
            self.schedule_flush();
        }
        true
    }

    fn schedule_flush(&self) {
        if self.inner.flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let spawned = self.inner.scheduler.spawn_after(
            self.inner.config.flush_delay,
            async move {
                // clear first so mutations during the write schedule again
                inner.flush_pending.store(false, Ordering::Release);
                let writer = inner.clone();
                match tokio::task::spawn_blocking(move || writer.write()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        path = %inner.path.display(),
                        %e,
                        "registry cache write failed"
                    ),
                    Err(e) => warn!(%e, "registry cache write task failed"),
                }
            },
        );
        if spawned.is_none() {
            self.inner.flush_pending.store(false, Ordering::Release);
        }
    }
}

impl Inner {
    fn write(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let version = self.version.load(Ordering::Acquire);
        if version == self.written.load(Ordering::Acquire) {
            return Ok(());
        }
        let text = {
            let entries = self.entries.lock();
            let mut keys: Vec<_> = entries.keys().collect();
            keys.sort();
            let joined: Vec<(&str, String)> = keys
                .into_iter()
                .map(|key| {
                    let values: Vec<&str> =
                        entries[key].iter().map(String::as_str).collect();
                    (key.as_str(), values.join(" "))
                })
                .collect();
            properties::render(
                HEADER,
                joined.iter().map(|(k, v)| (*k, v.as_str())),
            )
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(sibling(&self.path, "lock"))?;
        lock.lock_exclusive()?;
        let result = replace_file(&self.path, text.as_bytes());
        let _ = lock.unlock();
        result?;

        self.written.store(version, Ordering::Release);
        debug!(path = %self.path.display(), version, "registry cache written");
        Ok(())
    }
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = sibling(path, &format!("{}.tmp", std::process::id()));
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn load(path: &Path) -> HashMap<String, BTreeSet<String>> {
    let text = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return HashMap::new()
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                %e,
                "registry cache unreadable, starting empty"
            );
            return HashMap::new();
        }
    };
    properties::parse(&text)
        .into_iter()
        .map(|(key, value)| {
            let set = value.split_whitespace().map(str::to_owned).collect();
            (key, set)
        })
        .collect()
}

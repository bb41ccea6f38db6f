//! Desired-state sources: the fetch boundary and a directory-backed
//! implementation.
//!
//! A source is content-addressed by revision: fetching the same revision
//! twice is side-effect-free and served from cache. `DirSource` treats a
//! manifest tree on disk as the repository, with a sha256 over the tree
//! as the revision — enough to exercise the full engine without a real
//! VCS behind it.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use walkdir::WalkDir;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};

use crate::error::{ConvergeError, Result};
use crate::resource::{Manifest, ManifestSet};

/// Provider of desired-state manifest sets.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Renders the manifest set for a revision of `path` within the
    /// repository. `HEAD` resolves to the latest revision.
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ManifestSet>;

    /// Resolves the latest revision of the repository.
    async fn latest_revision(&self, repo_url: &str) -> Result<String>;
}

/// Directory-backed manifest source.
pub struct DirSource {
    repo_url: String,
    root: PathBuf,
    /// Rendered (pre-override) manifests keyed by revision.
    cache: moka::sync::Cache<String, Vec<Manifest>>,
}

impl DirSource {
    pub fn new(repo_url: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            root: root.into(),
            cache: moka::sync::Cache::new(64),
        }
    }

    fn check_repo(&self, repo_url: &str) -> Result<()> {
        if repo_url != self.repo_url {
            return Err(ConvergeError::SourceUnavailable {
                repo: repo_url.to_string(),
                message: format!("this source serves '{}'", self.repo_url),
            });
        }
        Ok(())
    }

    /// Hashes the manifest tree: sorted relative paths plus contents.
    fn tree_revision(&self) -> Result<String> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| ConvergeError::SourceUnavailable {
                repo: self.repo_url.clone(),
                message: e.to_string(),
            })?;
            if entry.file_type().is_file() && is_manifest_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }

        let mut hasher = Sha256::new();
        for file in files {
            let relative = file.strip_prefix(&self.root).unwrap_or(&file);
            hasher.update(relative.to_string_lossy().as_bytes());
            let contents = std::fs::read(&file).map_err(|e| ConvergeError::ReadFile {
                path: file.clone(),
                source: e,
            })?;
            hasher.update(&contents);
        }

        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    fn render(&self, path: &str) -> Result<Vec<Manifest>> {
        let dir = if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        };
        if !dir.is_dir() {
            return Err(ConvergeError::Render {
                path: path.to_string(),
                message: format!("'{}' is not a directory", dir.display()),
            });
        }

        let mut manifests = Vec::new();
        let mut files: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_manifest_file(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        for file in files {
            let contents =
                std::fs::read_to_string(&file).map_err(|e| ConvergeError::ReadFile {
                    path: file.clone(),
                    source: e,
                })?;
            for document in parse_documents(&file, &contents)? {
                manifests.push(document);
            }
        }
        Ok(manifests)
    }
}

#[async_trait]
impl ManifestSource for DirSource {
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ManifestSet> {
        self.check_repo(repo_url)?;

        let current = self.tree_revision()?;
        let resolved: &str = if revision == "HEAD" {
            current.as_str()
        } else {
            revision
        };

        let manifests = if let Some(cached) = self.cache.get(resolved) {
            cached
        } else if resolved == current {
            let rendered = self.render(path)?;
            self.cache.insert(current.clone(), rendered.clone());
            rendered
        } else {
            return Err(ConvergeError::SourceUnavailable {
                repo: repo_url.to_string(),
                message: format!("revision '{revision}' is not available"),
            });
        };

        let manifests = apply_overrides(manifests, overrides)?;
        ManifestSet::new(resolved, manifests)
    }

    async fn latest_revision(&self, repo_url: &str) -> Result<String> {
        self.check_repo(repo_url)?;
        self.tree_revision()
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn parse_documents(path: &Path, contents: &str) -> Result<Vec<Manifest>> {
    use serde::Deserialize;

    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            ConvergeError::ParseYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest =
            serde_yaml::from_value(value).map_err(|e| ConvergeError::Render {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Applies value overrides keyed as `<kind>/<name>:<dotted.path>` onto
/// the matching manifest's spec.
fn apply_overrides(
    mut manifests: Vec<Manifest>,
    overrides: &BTreeMap<String, Value>,
) -> Result<Vec<Manifest>> {
    for (key, value) in overrides {
        let (target, dotted) = key.split_once(':').ok_or_else(|| {
            ConvergeError::Config(format!(
                "invalid override key '{key}', expected '<kind>/<name>:<dotted.path>'"
            ))
        })?;
        let (kind, name) = target.split_once('/').ok_or_else(|| {
            ConvergeError::Config(format!(
                "invalid override target '{target}', expected '<kind>/<name>'"
            ))
        })?;

        let mut matched = false;
        for manifest in &mut manifests {
            if manifest.kind == kind && manifest.metadata.name == name {
                set_dotted_path(&mut manifest.spec, dotted, value.clone());
                matched = true;
            }
        }
        if !matched {
            log::warn!("Override '{key}' matched no manifest");
        }
    }
    Ok(manifests)
}

fn set_dotted_path(target: &mut Value, dotted: &str, value: Value) {
    let mut current = target;
    let mut segments = dotted.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("coerced to object");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Event emitted when a manifest file in a watched source tree changes.
#[derive(Debug, Clone)]
pub struct SourceChangeEvent {
    /// Path relative to the source root.
    pub path: String,
}

/// Watches a directory-backed source for manifest changes and broadcasts
/// them, providing the "new revision detected" trigger.
pub struct SourceWatcher {
    root: PathBuf,
    sender: broadcast::Sender<SourceChangeEvent>,
    shutdown: Arc<AtomicBool>,
}

impl SourceWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            root: root.into(),
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a receiver for source change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceChangeEvent> {
        self.sender.subscribe()
    }

    /// Starts watching the source tree.
    ///
    /// Blocks until [`SourceWatcher::stop`] is called; run it on a
    /// dedicated thread.
    pub fn watch(&self) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(Duration::from_millis(500), tx)
                .map_err(|e| ConvergeError::Watch(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| ConvergeError::Watch(e.to_string()))?;

        log::info!("Started watching source tree: {}", self.root.display());

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if let Some(change) = self.process_event(event) {
                            let _ = self.sender.send(change);
                        }
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Source watch error: {}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Stopped watching source tree");
        Ok(())
    }

    fn process_event(&self, event: DebouncedEvent) -> Option<SourceChangeEvent> {
        if !is_manifest_file(&event.path) {
            return None;
        }
        let relative = event
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&event.path)
            .to_string_lossy()
            .to_string();
        Some(SourceChangeEvent { path: relative })
    }

    /// Signals the watcher to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

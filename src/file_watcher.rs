//! Hot reload of user extensions
//!
//! Watches the user/custom block manifest roots and the user template
//! directory. Events are debounced per path (500 ms by default) before
//! triggering a full registry rediscovery. Disabled with
//! `DATAGENFLOW_HOT_RELOAD=false`.

use crate::blocks::registry::BlockRegistry;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::templates::TemplateRegistry;
use notify::{recommended_watcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Watches extension directories and reloads the registries on change
pub struct ExtensionFileWatcher {
    block_registry: Arc<BlockRegistry>,
    template_registry: Arc<TemplateRegistry>,
    block_roots: Vec<PathBuf>,
    template_root: PathBuf,
    hot_reload: bool,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl ExtensionFileWatcher {
    pub fn new(
        block_registry: Arc<BlockRegistry>,
        template_registry: Arc<TemplateRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            block_registry,
            template_registry,
            block_roots: vec![
                settings.blocks_path.clone(),
                settings.custom_blocks_path.clone(),
            ],
            template_root: settings.templates_path.clone(),
            hot_reload: settings.hot_reload,
            debounce: Duration::from_millis(settings.hot_reload_debounce_ms),
            watcher: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching. Returns false without starting when hot reload is
    /// disabled or no watched directory exists.
    pub fn start(&mut self) -> EngineResult<bool> {
        if !self.hot_reload {
            tracing::info!("hot reload disabled");
            return Ok(false);
        }
        if self.watcher.is_some() {
            return Ok(true);
        }

        let (tx, rx) = mpsc::channel::<PathBuf>();
        let mut watcher = recommended_watcher(move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        })
        .map_err(|e| EngineError::Watcher(e.to_string()))?;

        let mut watching_any = false;
        for root in self.block_roots.iter().chain([&self.template_root]) {
            if root.exists() {
                watcher
                    .watch(root, RecursiveMode::NonRecursive)
                    .map_err(|e| EngineError::Watcher(e.to_string()))?;
                tracing::info!("watching {} for extension changes", root.display());
                watching_any = true;
            }
        }
        if !watching_any {
            tracing::info!("no extension directories to watch");
            return Ok(false);
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let shutdown = self.shutdown.clone();
        let debounce = self.debounce;
        let block_registry = self.block_registry.clone();
        let template_registry = self.template_registry.clone();
        let block_roots: Vec<PathBuf> = self
            .block_roots
            .iter()
            .filter(|p| p.exists())
            .filter_map(|p| p.canonicalize().ok())
            .collect();
        let template_root = self.template_root.canonicalize().ok();

        let worker = std::thread::Builder::new()
            .name("extension-watcher".to_string())
            .spawn(move || {
                debounce_loop(
                    rx,
                    shutdown,
                    debounce,
                    block_roots,
                    template_root,
                    block_registry,
                    template_registry,
                )
            })?;

        self.watcher = Some(watcher);
        self.worker = Some(worker);
        tracing::info!("extension file watcher started");
        Ok(true)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.watcher = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        tracing::info!("extension file watcher stopped");
    }
}

impl Drop for ExtensionFileWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Collect events until a path stays quiet for the debounce window,
/// then fire one reload per settled path
#[allow(clippy::too_many_arguments)]
fn debounce_loop(
    rx: mpsc::Receiver<PathBuf>,
    shutdown: Arc<AtomicBool>,
    debounce: Duration,
    block_roots: Vec<PathBuf>,
    template_root: Option<PathBuf>,
    block_registry: Arc<BlockRegistry>,
    template_registry: Arc<TemplateRegistry>,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(path) => {
                if is_manifest(&path) {
                    pending.insert(path, Instant::now() + debounce);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            pending.remove(&path);
            dispatch(
                &path,
                &block_roots,
                template_root.as_deref(),
                &block_registry,
                &template_registry,
            );
        }
    }
}

fn dispatch(
    path: &Path,
    block_roots: &[PathBuf],
    template_root: Option<&Path>,
    block_registry: &BlockRegistry,
    template_registry: &TemplateRegistry,
) {
    let parent = path.parent().and_then(|p| p.canonicalize().ok());
    let Some(parent) = parent else {
        // the file may have been deleted; reload both registries
        tracing::info!("extension change at {}, reloading registries", path.display());
        block_registry.reload();
        template_registry.reload();
        return;
    };

    if block_roots.iter().any(|root| parent.starts_with(root)) {
        tracing::info!("block manifest changed: {}", path.display());
        block_registry.reload();
    } else if template_root.is_some_and(|root| parent.starts_with(root)) {
        tracing::info!("template changed: {}", path.display());
        template_registry.reload();
    }
}

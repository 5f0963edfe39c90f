//! Block registry: discovery, availability tracking and hot reload
//!
//! Builtin blocks are registered from code. The custom and user roots
//! hold YAML block manifests: a manifest derives a new block type from a
//! compiled base implementation, overlaying config defaults and
//! metadata. A manifest that fails to load is still registered, marked
//! unavailable with its error retained, so callers can surface it.
//! Declared dependencies are checked at registration; a block with
//! missing packages is likewise registered unavailable, with the missing
//! requirements in its error.

use super::builtin::builtin_blocks;
use super::{Block, BlockFactory, BlockInfo, BlockSource, BlockSpec, BlocksStatus};
use crate::dependency::DependencyManager;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{BlockDefinition, StateMap};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One registered block
#[derive(Clone)]
pub struct BlockEntry {
    pub spec: BlockSpec,
    pub source: BlockSource,
    pub available: bool,
    pub error: Option<String>,
    factory: Option<BlockFactory>,
}

/// Block manifest loaded from a custom/user root
#[derive(Debug, Deserialize)]
struct BlockManifest {
    /// New block type name
    #[serde(rename = "type")]
    type_name: String,
    /// Compiled implementation the manifest derives from
    base: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    /// Config defaults overlaid under pipeline-supplied config
    #[serde(default)]
    config: serde_yaml::Mapping,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Registry of block types, keyed by type name
pub struct BlockRegistry {
    entries: RwLock<HashMap<String, BlockEntry>>,
    custom_root: Option<PathBuf>,
    user_root: Option<PathBuf>,
    dependency_manager: DependencyManager,
}

impl BlockRegistry {
    /// Registry holding only the builtin set
    pub fn new() -> Self {
        Self::with_roots(None, None)
    }

    /// Registry discovering manifests from the custom and user roots
    pub fn with_roots(custom_root: Option<PathBuf>, user_root: Option<PathBuf>) -> Self {
        Self::with_dependency_manager(custom_root, user_root, DependencyManager::new())
    }

    /// Registry with an explicit dependency manager (tests point the
    /// installer at a stand-in program)
    pub fn with_dependency_manager(
        custom_root: Option<PathBuf>,
        user_root: Option<PathBuf>,
        dependency_manager: DependencyManager,
    ) -> Self {
        let registry = Self {
            entries: RwLock::new(HashMap::new()),
            custom_root,
            user_root,
            dependency_manager,
        };
        registry.reload();
        registry
    }

    /// Dependency check performed at registration: a block whose
    /// declared requirements are not installed stays listed but is
    /// marked unavailable with the missing requirements in its error
    fn check_dependencies(&self, entry: &mut BlockEntry) {
        if !entry.available || entry.spec.dependencies.is_empty() {
            return;
        }
        let missing = self.dependency_manager.check_missing(&entry.spec.dependencies);
        if !missing.is_empty() {
            tracing::warn!(
                "block '{}' unavailable, missing dependencies: {}",
                entry.spec.type_name,
                missing.join(", ")
            );
            entry.available = false;
            entry.error = Some(format!("missing dependencies: {}", missing.join(", ")));
        }
    }

    /// Full rediscovery: rebuild the builtin set, rescan manifest roots,
    /// then swap the map in one shot so readers never see a partial view
    pub fn reload(&self) {
        let mut entries = HashMap::new();

        for (spec, factory) in builtin_blocks() {
            let mut entry = BlockEntry {
                spec,
                source: BlockSource::Builtin,
                available: true,
                error: None,
                factory: Some(factory),
            };
            self.check_dependencies(&mut entry);
            entries.insert(entry.spec.type_name.clone(), entry);
        }

        let roots = [
            (self.custom_root.clone(), BlockSource::Custom),
            (self.user_root.clone(), BlockSource::User),
        ];
        for (root, source) in roots {
            let Some(root) = root else { continue };
            if !root.exists() {
                continue;
            }
            self.scan_manifest_root(&root, source, &mut entries);
        }

        *self.entries.write() = entries;
    }

    fn scan_manifest_root(
        &self,
        root: &Path,
        source: BlockSource,
        entries: &mut HashMap<String, BlockEntry>,
    ) {
        let Ok(dir) = std::fs::read_dir(root) else {
            tracing::warn!("cannot read block manifest root {}", root.display());
            return;
        };
        let mut paths: Vec<PathBuf> = dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            match self.load_manifest(&path, source, entries) {
                Ok(Some(type_name)) => {
                    tracing::debug!("registered {} block '{type_name}'", source.as_str());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("failed to load block manifest {}: {e}", path.display());
                }
            }
        }
    }

    /// Load one manifest. Collisions with an already-registered builtin
    /// identifier are skipped; a broken manifest registers unavailable.
    fn load_manifest(
        &self,
        path: &Path,
        source: BlockSource,
        entries: &mut HashMap<String, BlockEntry>,
    ) -> EngineResult<Option<String>> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: BlockManifest = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Validation(format!("invalid manifest: {e}")))?;

        if let Some(existing) = entries.get(&manifest.type_name) {
            if existing.source == BlockSource::Builtin {
                tracing::warn!(
                    "block manifest '{}' skipped: conflicts with builtin",
                    manifest.type_name
                );
                return Ok(None);
            }
        }

        let type_name = manifest.type_name.clone();
        let mut entry = match self.derive_entry(manifest, source, entries) {
            Ok(entry) => entry,
            Err(e) => {
                // keep the identifier visible, mark it unusable
                entries.insert(
                    type_name.clone(),
                    BlockEntry {
                        spec: BlockSpec {
                            type_name: type_name.clone(),
                            name: type_name.clone(),
                            description: String::new(),
                            category: "user".to_string(),
                            inputs: vec![],
                            outputs: vec![],
                            is_multiplier: false,
                            dependencies: vec![],
                            config_schema: Default::default(),
                        },
                        source,
                        available: false,
                        error: Some(e.to_string()),
                        factory: None,
                    },
                );
                return Ok(Some(type_name));
            }
        };
        self.check_dependencies(&mut entry);
        entries.insert(type_name.clone(), entry);
        Ok(Some(type_name))
    }

    fn derive_entry(
        &self,
        manifest: BlockManifest,
        source: BlockSource,
        entries: &HashMap<String, BlockEntry>,
    ) -> EngineResult<BlockEntry> {
        let base = entries.get(&manifest.base).ok_or_else(|| {
            EngineError::Validation(format!("base block '{}' not found", manifest.base))
        })?;
        let base_factory = base.factory.clone().ok_or_else(|| {
            EngineError::Validation(format!("base block '{}' is unavailable", manifest.base))
        })?;

        let defaults: StateMap =
            serde_json::from_value(serde_json::to_value(&manifest.config)?)?;

        let mut spec = base.spec.clone();
        spec.type_name = manifest.type_name.clone();
        if let Some(name) = manifest.name {
            spec.name = name;
        }
        if let Some(description) = manifest.description {
            spec.description = description;
        }
        if let Some(category) = manifest.category {
            spec.category = category;
        }
        spec.dependencies = manifest.dependencies;

        let factory: BlockFactory = Arc::new(move |config: &StateMap| {
            let mut merged = defaults.clone();
            for (key, value) in config {
                merged.insert(key.clone(), value.clone());
            }
            base_factory(&merged)
        });

        Ok(BlockEntry {
            spec,
            source,
            available: true,
            error: None,
            factory: Some(factory),
        })
    }

    /// Register a block type directly (dynamic loading, tests)
    pub fn register(
        &self,
        spec: BlockSpec,
        factory: BlockFactory,
        source: BlockSource,
        available: bool,
        error: Option<String>,
    ) {
        self.entries.write().insert(
            spec.type_name.clone(),
            BlockEntry {
                spec,
                source,
                available,
                error,
                factory: Some(factory),
            },
        );
    }

    /// Remove a block type
    pub fn unregister(&self, type_name: &str) {
        self.entries.write().remove(type_name);
    }

    /// Metadata for one block type
    pub fn get_spec(&self, type_name: &str) -> Option<BlockSpec> {
        self.entries.read().get(type_name).map(|e| e.spec.clone())
    }

    /// Registered type names
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Full listing with source, availability and error detail
    pub fn list_blocks(&self) -> Vec<BlockInfo> {
        let mut infos: Vec<BlockInfo> = self
            .entries
            .read()
            .values()
            .map(|entry| BlockInfo {
                spec: entry.spec.clone(),
                source: entry.source,
                available: entry.available,
                error: entry.error.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.spec.type_name.cmp(&b.spec.type_name));
        infos
    }

    /// Counts by source and availability
    pub fn status(&self) -> BlocksStatus {
        let entries = self.entries.read();
        let mut status = BlocksStatus {
            total: entries.len(),
            ..BlocksStatus::default()
        };
        for entry in entries.values() {
            match entry.source {
                BlockSource::Builtin => status.builtin_blocks += 1,
                BlockSource::Custom => status.custom_blocks += 1,
                BlockSource::User => status.user_blocks += 1,
            }
            if entry.available {
                status.available += 1;
            } else {
                status.unavailable += 1;
            }
        }
        status
    }

    /// Instantiate a configured block. Unknown types fail with the list
    /// of known types attached.
    pub fn instantiate(
        &self,
        type_name: &str,
        config: &StateMap,
    ) -> EngineResult<(BlockSpec, Arc<dyn Block>)> {
        let entry = {
            let entries = self.entries.read();
            entries.get(type_name).cloned()
        };
        let Some(entry) = entry else {
            return Err(EngineError::BlockNotFound {
                block_type: type_name.to_string(),
                available: self.list_types(),
            });
        };
        let factory = entry.factory.as_ref().ok_or_else(|| {
            EngineError::Validation(format!(
                "block '{type_name}' is unavailable: {}",
                entry.error.as_deref().unwrap_or("unknown error")
            ))
        })?;
        let block = factory(config)?;
        Ok((entry.spec, block))
    }

    /// Sorted unique union of all declared outputs across a block list;
    /// the review UI uses this to propose editable fields
    pub fn compute_accumulated_state_schema(&self, blocks: &[BlockDefinition]) -> Vec<String> {
        let entries = self.entries.read();
        let mut fields: Vec<String> = blocks
            .iter()
            .filter_map(|def| entries.get(&def.block_type))
            .flat_map(|entry| entry.spec.outputs.iter().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

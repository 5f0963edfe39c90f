//! Pipeline template registry
//!
//! Templates are YAML pipeline definitions used to seed new pipelines:
//! `{name, description, blocks, constraints?}` plus an optional example
//! seed file under `seeds/seed_<id>.json` or `.md`. Builtin templates
//! ship with the engine; user templates load from a mounted directory
//! and never shadow a builtin id.

use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Template listing entry with source metadata
#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_seed: Option<Value>,
    pub source: String,
}

/// Counts of registered templates by source
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TemplatesStatus {
    pub total: usize,
    pub builtin_templates: usize,
    pub user_templates: usize,
}

#[derive(Clone)]
struct TemplateEntry {
    data: Value,
    source: String,
}

/// Registry of pipeline templates keyed by template id (file stem)
pub struct TemplateRegistry {
    builtin_dir: PathBuf,
    user_dir: Option<PathBuf>,
    templates: RwLock<HashMap<String, TemplateEntry>>,
}

impl TemplateRegistry {
    pub fn new(builtin_dir: PathBuf, user_dir: Option<PathBuf>) -> Self {
        let registry = Self {
            builtin_dir,
            user_dir,
            templates: RwLock::new(HashMap::new()),
        };
        registry.reload();
        registry
    }

    /// Rescan both directories and swap the map atomically
    pub fn reload(&self) {
        let mut templates = HashMap::new();

        if self.builtin_dir.exists() {
            self.load_dir(&self.builtin_dir, "builtin", &mut templates);
        }
        if let Some(user_dir) = &self.user_dir {
            if user_dir.exists() {
                self.load_dir(user_dir, "user", &mut templates);
            }
        }

        *self.templates.write() = templates;
    }

    fn load_dir(&self, dir: &Path, source: &str, templates: &mut HashMap<String, TemplateEntry>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!("cannot read template directory {}", dir.display());
            return;
        };
        let mut paths: Vec<PathBuf> = entries
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
            let Some(template_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // builtin ids shadow user ids
            if source == "user" && templates.contains_key(template_id) {
                tracing::warn!("user template '{template_id}' skipped: conflicts with builtin");
                continue;
            }
            match self.load_template(&path) {
                Ok(mut data) => {
                    if let Some(seed) = self.load_example_seed(template_id) {
                        if let Value::Object(map) = &mut data {
                            map.insert("example_seed".to_string(), seed);
                        }
                    }
                    templates.insert(
                        template_id.to_string(),
                        TemplateEntry {
                            data,
                            source: source.to_string(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!("failed to load template {}: {e}", path.display());
                }
            }
        }
    }

    fn load_template(&self, path: &Path) -> EngineResult<Value> {
        let raw = std::fs::read_to_string(path)?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Validation(format!("invalid template yaml: {e}")))?;
        serde_json::to_value(yaml).map_err(EngineError::from)
    }

    /// Example seed for a template: `seeds/seed_<id>.json` parsed as-is,
    /// or `seeds/seed_<id>.md` wrapped as a single `file_content` seed
    fn load_example_seed(&self, template_id: &str) -> Option<Value> {
        let seeds_dir = self.builtin_dir.join("seeds");
        let json_path = seeds_dir.join(format!("seed_{template_id}.json"));
        if json_path.exists() {
            let raw = std::fs::read_to_string(&json_path).ok()?;
            return serde_json::from_str(&raw).ok();
        }
        let md_path = seeds_dir.join(format!("seed_{template_id}.md"));
        if md_path.exists() {
            let content = std::fs::read_to_string(&md_path).ok()?;
            return Some(serde_json::json!([
                {"repetitions": 1, "metadata": {"file_content": content}}
            ]));
        }
        None
    }

    pub fn register(&self, template_id: &str, data: Value, source: &str) {
        self.templates.write().insert(
            template_id.to_string(),
            TemplateEntry {
                data,
                source: source.to_string(),
            },
        );
    }

    pub fn unregister(&self, template_id: &str) {
        self.templates.write().remove(template_id);
    }

    pub fn get_template(&self, template_id: &str) -> Option<Value> {
        self.templates
            .read()
            .get(template_id)
            .map(|entry| entry.data.clone())
    }

    pub fn get_template_source(&self, template_id: &str) -> Option<String> {
        self.templates
            .read()
            .get(template_id)
            .map(|entry| entry.source.clone())
    }

    pub fn list_templates(&self) -> Vec<TemplateInfo> {
        let templates = self.templates.read();
        let mut infos: Vec<TemplateInfo> = templates
            .iter()
            .map(|(id, entry)| TemplateInfo {
                id: id.clone(),
                name: entry
                    .data
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(id)
                    .to_string(),
                description: entry
                    .data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                example_seed: entry.data.get("example_seed").cloned(),
                source: entry.source.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn status(&self) -> TemplatesStatus {
        let templates = self.templates.read();
        let mut status = TemplatesStatus {
            total: templates.len(),
            ..TemplatesStatus::default()
        };
        for entry in templates.values() {
            if entry.source == "builtin" {
                status.builtin_templates += 1;
            } else {
                status.user_templates += 1;
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(dir: &Path, id: &str, name: &str) {
        std::fs::write(
            dir.join(format!("{id}.yaml")),
            format!("name: {name}\ndescription: test template\nblocks: []\n"),
        )
        .unwrap();
    }

    #[test]
    fn loads_builtin_and_user_templates() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_template(builtin.path(), "qa", "QA Generation");
        write_template(user.path(), "custom", "My Template");

        let registry = TemplateRegistry::new(
            builtin.path().to_path_buf(),
            Some(user.path().to_path_buf()),
        );
        let templates = registry.list_templates();
        assert_eq!(templates.len(), 2);
        assert_eq!(registry.get_template_source("qa").unwrap(), "builtin");
        assert_eq!(registry.get_template_source("custom").unwrap(), "user");
    }

    #[test]
    fn builtin_shadows_user_id() {
        let builtin = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_template(builtin.path(), "qa", "Builtin QA");
        write_template(user.path(), "qa", "User QA");

        let registry = TemplateRegistry::new(
            builtin.path().to_path_buf(),
            Some(user.path().to_path_buf()),
        );
        let template = registry.get_template("qa").unwrap();
        assert_eq!(template.get("name").unwrap(), "Builtin QA");
    }

    #[test]
    fn markdown_example_seed_is_wrapped() {
        let builtin = tempfile::tempdir().unwrap();
        write_template(builtin.path(), "chunking", "Chunking");
        std::fs::create_dir(builtin.path().join("seeds")).unwrap();
        std::fs::write(builtin.path().join("seeds/seed_chunking.md"), "# Doc").unwrap();

        let registry = TemplateRegistry::new(builtin.path().to_path_buf(), None);
        let template = registry.get_template("chunking").unwrap();
        let seed = template.get("example_seed").unwrap();
        assert_eq!(seed[0]["metadata"]["file_content"], "# Doc");
    }

    #[test]
    fn register_and_unregister() {
        let builtin = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::new(builtin.path().to_path_buf(), None);
        registry.register("x", serde_json::json!({"name": "X"}), "user");
        assert!(registry.get_template("x").is_some());
        registry.unregister("x");
        assert!(registry.get_template("x").is_none());
    }
}

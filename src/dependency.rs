//! Dependency manager for block-declared package requirements
//!
//! Blocks may declare package requirement strings (e.g. `torch>=2.0.0`).
//! The manager parses them, reports installation status and shells out
//! to `uv` to install what is missing. Checks are synchronous so the
//! block registry can run them during registration; installs run on the
//! async runtime with a timeout.

use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::time::Duration;

/// Default install timeout
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-requirement status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyInfo {
    pub requirement: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    /// "ok" or "not_installed"
    pub status: String,
}

/// Extract the package name from a requirement string: everything up to
/// the first version operator or extras bracket
pub fn parse_package_name(requirement: &str) -> String {
    const SEPARATORS: [&str; 8] = [">=", "<=", "==", "!=", "~=", ">", "<", "["];
    let cut = SEPARATORS
        .iter()
        .filter_map(|sep| requirement.find(sep))
        .min()
        .unwrap_or(requirement.len());
    requirement[..cut].trim().to_string()
}

/// Checks and installs block dependencies through an injectable
/// installer program (`uv` by default)
#[derive(Debug, Clone)]
pub struct DependencyManager {
    installer: String,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self {
            installer: "uv".to_string(),
        }
    }
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different installer program (tests point this at a
    /// nonexistent binary to exercise the failure path)
    pub fn with_installer(installer: impl Into<String>) -> Self {
        Self {
            installer: installer.into(),
        }
    }

    fn installed_version(&self, name: &str) -> Option<String> {
        let output = std::process::Command::new(&self.installer)
            .args(["pip", "show", name])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find_map(|line| line.strip_prefix("Version:"))
            .map(|version| version.trim().to_string())
    }

    /// Filter requirements down to those not installed
    pub fn check_missing(&self, requirements: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        for requirement in requirements {
            let name = parse_package_name(requirement);
            if self.installed_version(&name).is_none() {
                missing.push(requirement.clone());
            }
        }
        missing
    }

    /// Per-requirement status with installed versions
    pub fn get_dependency_info(&self, requirements: &[String]) -> Vec<DependencyInfo> {
        let mut infos = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let name = parse_package_name(requirement);
            match self.installed_version(&name) {
                Some(version) => infos.push(DependencyInfo {
                    requirement: requirement.clone(),
                    name,
                    installed_version: Some(version),
                    status: "ok".to_string(),
                }),
                None => infos.push(DependencyInfo {
                    requirement: requirement.clone(),
                    name,
                    installed_version: None,
                    status: "not_installed".to_string(),
                }),
            }
        }
        infos
    }

    /// Install requirements. Fails with [`EngineError::Dependency`] on a
    /// missing installer, non-zero exit or timeout.
    pub async fn install(&self, requirements: &[String]) -> EngineResult<Vec<String>> {
        self.install_with_timeout(requirements, INSTALL_TIMEOUT).await
    }

    pub async fn install_with_timeout(
        &self,
        requirements: &[String],
        timeout: Duration,
    ) -> EngineResult<Vec<String>> {
        if requirements.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!("installing dependencies: {requirements:?}");
        let mut command = tokio::process::Command::new(&self.installer);
        command.args(["pip", "install", "--quiet"]).args(requirements);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::Dependency(format!(
                    "{} not found",
                    self.installer
                )))
            }
            Ok(Err(e)) => return Err(EngineError::Dependency(e.to_string())),
            Err(_) => {
                return Err(EngineError::Dependency(format!(
                    "installation timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            return Err(EngineError::Dependency(format!(
                "{} pip install failed: {}",
                self.installer,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        tracing::info!("successfully installed: {requirements:?}");
        Ok(requirements.to_vec())
    }
}

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use records_kernel_core::{Role, RoleCapabilityGate};
use records_kernel_versions::VersioningSettings;
use serde::{Deserialize, Serialize};

fn default_file_plan_site() -> String {
    VersioningSettings::default().default_file_plan_site
}

fn default_auto_version_description() -> String {
    VersioningSettings::default().auto_version_description
}

fn default_final_version_label() -> String {
    VersioningSettings::default().final_version_label
}

fn default_final_version_description() -> String {
    VersioningSettings::default().final_version_description
}

/// Kernel configuration, usually loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(default = "default_file_plan_site")]
    pub default_file_plan_site: String,
    #[serde(default)]
    pub auto_version_on_record_creation: bool,
    #[serde(default = "default_auto_version_description")]
    pub auto_version_description: String,
    #[serde(default = "default_final_version_label")]
    pub final_version_label: String,
    #[serde(default = "default_final_version_description")]
    pub final_version_description: String,
    /// `tracing` filter directive used when `RK_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub role_assignments: BTreeMap<String, Role>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let settings = VersioningSettings::default();
        Self {
            default_file_plan_site: settings.default_file_plan_site,
            auto_version_on_record_creation: settings.auto_version_on_record_creation,
            auto_version_description: settings.auto_version_description,
            final_version_label: settings.final_version_label,
            final_version_description: settings.final_version_description,
            log_filter: None,
            role_assignments: BTreeMap::new(),
        }
    }
}

impl KernelConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or does not hold a valid configuration.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error for malformed YAML, unknown keys or blank settings.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse config yaml")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default_file_plan_site.trim().is_empty() {
            return Err(anyhow!("default_file_plan_site cannot be empty"));
        }
        if self.final_version_label.trim().is_empty() {
            return Err(anyhow!("final_version_label cannot be empty"));
        }
        if let Some(principal) = self.role_assignments.keys().find(|name| name.trim().is_empty()) {
            return Err(anyhow!("role_assignments contains a blank principal {principal:?}"));
        }
        Ok(())
    }

    #[must_use]
    pub fn versioning_settings(&self) -> VersioningSettings {
        VersioningSettings {
            default_file_plan_site: self.default_file_plan_site.clone(),
            auto_version_on_record_creation: self.auto_version_on_record_creation,
            auto_version_description: self.auto_version_description.clone(),
            final_version_label: self.final_version_label.clone(),
            final_version_description: self.final_version_description.clone(),
        }
    }

    #[must_use]
    pub fn capability_gate(&self) -> RoleCapabilityGate {
        RoleCapabilityGate::new(self.role_assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() -> Result<()> {
        let config = KernelConfig::parse("{}")?;
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.versioning_settings(), VersioningSettings::default());
        Ok(())
    }

    #[test]
    fn settings_and_roles_are_loaded() -> Result<()> {
        let config = KernelConfig::parse(
            "default_file_plan_site: archive\n\
             auto_version_on_record_creation: true\n\
             log_filter: records_kernel_versions=debug\n\
             role_assignments:\n  carol: records_manager\n  dave: user\n",
        )?;
        assert_eq!(config.default_file_plan_site, "archive");
        assert!(config.versioning_settings().auto_version_on_record_creation);
        assert_eq!(config.log_filter.as_deref(), Some("records_kernel_versions=debug"));
        let gate = config.capability_gate();
        assert_eq!(gate.role_of("carol"), Some(Role::RecordsManager));
        assert_eq!(gate.role_of("dave"), Some(Role::User));
        Ok(())
    }

    #[test]
    fn unknown_keys_and_blank_values_are_rejected() {
        assert!(KernelConfig::parse("file_plan_site: rm\n").is_err());
        assert!(KernelConfig::parse("default_file_plan_site: \"  \"\n").is_err());
        assert!(KernelConfig::parse("role_assignments:\n  carol: janitor\n").is_err());
    }
}

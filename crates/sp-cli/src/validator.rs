//! Configuration validation for soar-packs.
//!
//! Every enabled instance is built from its parameters so that malformed
//! parameters surface before a command is run.

use crate::config::AppConfig;
use colored::Colorize;
use serde::Serialize;
use sp_connectors::build_integration;
use std::path::Path;

/// Result of configuration validation.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// Problems that make an instance unusable.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Instances that built successfully.
    pub valid_instances: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        for name in &self.valid_instances {
            println!("  {} {}", "✓".green(), name);
        }

        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates the CLI configuration.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig, state_dir: &Path) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_instances(config, &mut result);
        Self::validate_state_dir(state_dir, &mut result);

        result
    }

    fn validate_instances(config: &AppConfig, result: &mut ValidationResult) {
        if config.instances.is_empty() {
            result.add_warning("No instances configured. Add entries under 'instances'.");
            return;
        }

        for (name, instance) in &config.instances {
            if !instance.enabled {
                result.add_warning(format!("Instance '{}' is disabled", name));
                continue;
            }
            if !instance.params.is_object() {
                result.add_error(format!(
                    "Instance '{}': params must be a mapping",
                    name
                ));
                continue;
            }
            match build_integration(instance.integration, instance.params.clone()) {
                Ok(_) => result.valid_instances.push(name.clone()),
                Err(e) => result.add_error(format!("Instance '{}': {}", name, e)),
            }
        }
    }

    fn validate_state_dir(state_dir: &Path, result: &mut ValidationResult) {
        if state_dir.exists() && !state_dir.is_dir() {
            result.add_error(format!(
                "State directory '{}' exists but is not a directory",
                state_dir.display()
            ));
        } else if !state_dir.exists() {
            result.add_warning(format!(
                "State directory '{}' does not exist yet; it will be created on first use",
                state_dir.display()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_warns() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigValidator::validate(&AppConfig::default(), dir.path());
        assert!(!result.has_errors());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_reports_bad_params_and_disabled() {
        let config = AppConfig::parse(
            r#"
instances:
  good:
    integration: armis
    params:
      server_url: https://armis.example.com
      api_key: key
  bad:
    integration: tenable_io
    params:
      url: https://cloud.tenable.com
  off:
    integration: fireeye_etp
    enabled: false
"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigValidator::validate(&config, dir.path());

        assert_eq!(result.valid_instances, vec!["good".to_string()]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Instance 'bad': "));
        assert!(result.warnings.iter().any(|w| w.contains("'off' is disabled")));
    }

    #[test]
    fn test_state_dir_is_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = ConfigValidator::validate(&AppConfig::default(), file.path());
        assert!(result.has_errors());
    }
}

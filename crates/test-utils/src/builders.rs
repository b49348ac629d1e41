#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use builddag::config::{
    ConfigFile, OrchestratorSection, RawConfigFile, RegistrySection, RemediationSection,
    StagesSection, SuiteSection, UnitConfig,
};
use builddag::dag::UnitSpec;
use builddag::types::{BackoffPolicy, RegistryKind};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                orchestrator: OrchestratorSection::default(),
                registry: RegistrySection::default(),
                stages: StagesSection::default(),
                remediation: RemediationSection::default(),
                suite: SuiteSection::default(),
                unit: BTreeMap::new(),
            },
        }
    }

    pub fn with_unit(mut self, id: &str, unit: UnitConfig) -> Self {
        self.config.unit.insert(id.to_string(), unit);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.orchestrator.concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.orchestrator.max_retries = n;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy, base: &str, max: &str) -> Self {
        self.config.orchestrator.backoff = policy;
        self.config.orchestrator.backoff_base = base.to_string();
        self.config.orchestrator.backoff_max = max.to_string();
        self
    }

    pub fn file_registry(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.registry.kind = RegistryKind::File;
        self.config.registry.path = Some(path.into());
        self
    }

    pub fn stage_commands(mut self, build: &str, test: &str, quality: &str, publish: &str) -> Self {
        self.config.stages.build = Some(build.to_string());
        self.config.stages.test = Some(test.to_string());
        self.config.stages.quality = Some(quality.to_string());
        self.config.stages.publish = Some(publish.to_string());
        self
    }

    pub fn stage_timeout(mut self, timeout: &str) -> Self {
        self.config.stages.timeout = Some(timeout.to_string());
        self
    }

    pub fn category_rule(mut self, category: &str, pattern: &str) -> Self {
        self.config
            .stages
            .categories
            .insert(category.to_string(), pattern.to_string());
        self
    }

    pub fn remediation(mut self, cmd: &str, max_attempts: u32) -> Self {
        self.config.remediation.cmd = Some(cmd.to_string());
        self.config.remediation.max_attempts = max_attempts;
        self
    }

    pub fn suite_publish(mut self, cmd: &str) -> Self {
        self.config.suite.publish_cmd = Some(cmd.to_string());
        self
    }

    /// The raw model, for tests that exercise validation errors.
    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `UnitConfig`.
#[derive(Default)]
pub struct UnitConfigBuilder {
    unit: UnitConfig,
}

impl UnitConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.unit.after.push(dep.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.unit.path = Some(PathBuf::from(path));
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.unit.category = Some(category.to_string());
        self
    }

    pub fn plan(mut self, plan: &str) -> Self {
        self.unit.plan = Some(plan.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.unit.priority = priority;
        self
    }

    pub fn build_cmd(mut self, cmd: &str) -> Self {
        self.unit.build = Some(cmd.to_string());
        self
    }

    pub fn quality_cmd(mut self, cmd: &str) -> Self {
        self.unit.quality = Some(cmd.to_string());
        self
    }

    pub fn build(self) -> UnitConfig {
        self.unit
    }
}

/// Shorthand for a unit with the given dependencies.
pub fn unit(id: &str, deps: &[&str]) -> UnitSpec {
    UnitSpec::new(id).with_dependencies(deps.iter().copied())
}

//! Module catalog: rule descriptors loaded once per run, plus profile-based selection.

mod descriptor;
pub mod selection;

pub use descriptor::parse_module;
pub use selection::{ModuleSelection, check_os};

use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::InputKind;
use crate::error::ConfigError;

/// Where a rule looks for its input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PathPattern {
    /// No path constraint; only the name pattern applies.
    Any,
    /// `r"..."`: regex searched anywhere in the event path.
    Regex(String),
    /// `{case_path}` optionally followed by a relative suffix: that exact path only.
    CaseRoot(String),
    /// `.../*`: immediate children of a directory ending with the prefix.
    Wildcard(String),
    /// Literal suffix of the event path.
    Suffix(String),
}

impl PathPattern {
    pub const CASE_PATH_PLACEHOLDER: &'static str = "{case_path}";

    /// Classify the `input.path` value of a descriptor.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return PathPattern::Any;
        };
        for quote in ['"', '\''] {
            if let Some(inner) = raw
                .strip_prefix('r')
                .and_then(|s| s.strip_prefix(quote))
                .and_then(|s| s.strip_suffix(quote))
            {
                return PathPattern::Regex(inner.to_string());
            }
        }

        let raw = raw.replace('\\', "/");
        if let Some(rest) = raw.strip_prefix(Self::CASE_PATH_PLACEHOLDER) {
            return PathPattern::CaseRoot(rest.trim_matches('/').to_string());
        }
        if let Some(prefix) = raw.strip_suffix('*') {
            return PathPattern::Wildcard(prefix.trim_end_matches('/').to_string());
        }
        let literal = raw.trim_end_matches('/');
        if literal.is_empty() {
            return PathPattern::Any;
        }
        PathPattern::Suffix(literal.to_string())
    }
}

/// Which queue a module's tasks go to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionConstraints {
    pub os_class: String,
    pub multithreaded: bool,
    pub disk_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// In-process handler resolved by module name.
    Internal,
    /// External tool spawned from the `[tool]` section.
    External,
}

/// External tool invocation. `cmd` is a template; see [`crate::naming`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub path: String,
    pub cmd: String,
    pub env: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Output naming templates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputNaming {
    pub output_file: String,
    pub output_dir: String,
    pub output_prefix: String,
}

/// One processing rule. Immutable after load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRule {
    pub name: String,
    pub input_kind: InputKind,
    /// Regex searched in the basename of file inputs; empty means any name.
    pub name_pattern: String,
    pub path_pattern: PathPattern,
    pub constraints: ExecutionConstraints,
    pub executor: ExecutorKind,
    pub tool: Option<ToolSpec>,
    pub output: OutputNaming,
    /// Target OS of the module itself (`all` when unrestricted).
    pub os: String,
    pub version: String,
    pub author: String,
    pub description: String,
}

impl ModuleRule {
    /// Directory under the case root where this module writes. Never an input to the module.
    pub fn output_root(&self, case_root: &Path) -> PathBuf {
        case_root.join(&self.name)
    }
}

/// A directory of `<module>.toml` descriptors, searched recursively, with
/// `profiles/<name>.toml` module lists next to them.
#[derive(Clone, Debug)]
pub struct Catalog {
    dir: PathBuf,
}

/// `audit.toml` and `audit` both name the module `audit`.
pub fn normalize_module_name(name: &str) -> &str {
    let name = name.trim();
    [".toml", ".yml", ".yaml"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
}

#[derive(Deserialize)]
struct ProfileFile {
    #[serde(default)]
    modules: Vec<String>,
}

impl Catalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn profiles_dir(&self) -> PathBuf {
        self.dir.join("profiles")
    }

    /// Path of the descriptor for `name`: `<dir>/<name>.toml` first, then anywhere below.
    pub fn find_module(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let name = normalize_module_name(name);
        let not_found = || ConfigError::ModuleNotFound {
            name: name.to_string(),
            dir: self.dir.clone(),
        };
        let file_name = format!("{}.toml", name);
        let direct = self.dir.join(&file_name);
        if direct.is_file() {
            return Ok(direct);
        }
        let profiles = self.profiles_dir();
        walkdir::WalkDir::new(&self.dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.path() != profiles)
            .filter_map(|r| r.ok())
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == file_name)
            .map(|e| e.into_path())
            .ok_or_else(not_found)
    }

    pub fn load_module(&self, name: &str) -> Result<ModuleRule, ConfigError> {
        let path = self.find_module(name)?;
        let rule = descriptor::read_descriptor(&path)?.into_rule(normalize_module_name(name))?;
        debug!("loaded module {} from {}", rule.name, path.display());
        Ok(rule)
    }

    /// Load each named module once, keeping first-seen order.
    pub fn load_modules(&self, names: &[String]) -> Result<Vec<ModuleRule>, ConfigError> {
        let mut rules: Vec<ModuleRule> = Vec::with_capacity(names.len());
        for name in names {
            let rule = self.load_module(name)?;
            if rules.iter().any(|r| r.name == rule.name) {
                continue;
            }
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Module list of `profiles/<name>.toml`.
    pub fn load_profile(&self, name: &str) -> Result<Vec<String>, ConfigError> {
        let dir = self.profiles_dir();
        let path = dir.join(format!("{}.toml", normalize_module_name(name)));
        if !path.is_file() {
            return Err(ConfigError::ProfileNotFound {
                name: name.to_string(),
                dir,
            });
        }
        let s = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let profile: ProfileFile =
            toml::from_str(&s).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(profile
            .modules
            .iter()
            .map(|m| normalize_module_name(m).to_string())
            .collect())
    }
}

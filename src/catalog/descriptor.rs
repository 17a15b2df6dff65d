//! On-disk module descriptor (`<module>.toml`) and its conversion into a [`ModuleRule`].

use regex::Regex;
use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::store::{is_reserved_table, is_valid_identifier};
use crate::InputKind;

use super::{
    ExecutionConstraints, ExecutorKind, ModuleRule, OutputNaming, PathPattern, ToolSpec,
};

#[derive(Debug, Deserialize)]
pub(crate) struct ModuleDescriptor {
    module: Option<String>,
    version: Option<String>,
    author: Option<String>,
    description: Option<String>,
    os: Option<String>,
    #[serde(default)]
    disk_only: bool,
    #[serde(default)]
    no_multithread: bool,
    #[serde(default)]
    processor_type: Vec<String>,
    processor_os: Option<String>,
    input: Option<InputSection>,
    #[serde(default)]
    output: OutputSection,
    tool: Option<ToolSection>,
}

#[derive(Debug, Deserialize)]
struct InputSection {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    name: String,
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputSection {
    #[serde(default)]
    output_file: String,
    #[serde(default)]
    output_dir: String,
    #[serde(default)]
    output_prefix: String,
}

#[derive(Debug, Deserialize)]
struct ToolSection {
    #[serde(default)]
    path: String,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    env: Vec<String>,
    timeout: Option<u64>,
}

/// Read and parse the descriptor at `path`.
pub(crate) fn read_descriptor(path: &Path) -> Result<ModuleDescriptor, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(module: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidModule {
        module: module.to_string(),
        reason: reason.into(),
    }
}

/// OS classes end up in queue names.
fn is_valid_os_class(os: &str) -> bool {
    !os.is_empty()
        && os
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn check_regex(module: &str, pattern: &str) -> Result<(), ConfigError> {
    Regex::new(pattern).map(|_| ()).map_err(|source| ConfigError::Regex {
        module: module.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

impl ModuleDescriptor {
    /// Validate and convert. `fallback_name` is used when the descriptor has no `module` key.
    pub(crate) fn into_rule(self, fallback_name: &str) -> Result<ModuleRule, ConfigError> {
        let name = self.module.unwrap_or_else(|| fallback_name.to_string());
        if !is_valid_identifier(&name) {
            return Err(invalid(
                &name,
                "module name must be letters, digits and '_' and not start with a digit",
            ));
        }
        if is_reserved_table(&name) {
            return Err(invalid(&name, "module name collides with a store table"));
        }

        let input = self
            .input
            .ok_or_else(|| invalid(&name, "[input] section is missing"))?;
        let input_kind = match input.kind.as_deref() {
            Some("file") => InputKind::File,
            Some("dir") => InputKind::Dir,
            Some(other) => {
                return Err(invalid(&name, format!("unknown input.type {:?}", other)));
            }
            None => return Err(invalid(&name, "input.type is missing")),
        };

        if !input.name.is_empty() {
            check_regex(&name, &input.name)?;
        }
        let path_pattern = PathPattern::parse(input.path.as_deref());
        if let PathPattern::Regex(re) = &path_pattern {
            check_regex(&name, re)?;
        }
        match (input_kind, &path_pattern) {
            (InputKind::Dir, PathPattern::Any) => {
                return Err(invalid(&name, "dir modules need input.path"));
            }
            (InputKind::File, PathPattern::Any) if input.name.is_empty() => {
                return Err(invalid(&name, "file modules need input.name or input.path"));
            }
            _ => {}
        }

        let executor = if self.processor_type.iter().any(|t| t == "internal") {
            ExecutorKind::Internal
        } else if self.processor_type.iter().any(|t| t == "external") {
            ExecutorKind::External
        } else {
            return Err(invalid(
                &name,
                "processor_type must list \"internal\" or \"external\"",
            ));
        };

        let os_class = self
            .processor_os
            .unwrap_or_else(|| "unix".to_string())
            .to_lowercase();
        if !is_valid_os_class(&os_class) {
            return Err(invalid(&name, format!("invalid processor_os {:?}", os_class)));
        }

        let tool = self.tool.map(|t| ToolSpec {
            path: t.path,
            cmd: t.cmd,
            env: t.env,
            timeout_secs: t.timeout,
        });
        if executor == ExecutorKind::External
            && tool.as_ref().is_none_or(|t| t.path.is_empty())
        {
            return Err(invalid(&name, "external modules need [tool] with a path"));
        }
        if let Some(bad) = tool
            .as_ref()
            .and_then(|t| t.env.iter().find(|kv| !kv.contains('=')))
        {
            return Err(invalid(&name, format!("tool.env entry {:?} is not KEY=VALUE", bad)));
        }
        if let Some(t) = tool.as_ref().filter(|t| shlex::split(&t.cmd).is_none()) {
            return Err(invalid(&name, format!("tool.cmd {:?} has unbalanced quotes", t.cmd)));
        }

        Ok(ModuleRule {
            name,
            input_kind,
            name_pattern: input.name,
            path_pattern,
            constraints: ExecutionConstraints {
                os_class,
                multithreaded: !self.no_multithread,
                disk_only: self.disk_only,
            },
            executor,
            tool,
            output: OutputNaming {
                output_file: self.output.output_file,
                output_dir: self.output.output_dir,
                output_prefix: self.output.output_prefix,
            },
            os: self.os.unwrap_or_else(|| "all".to_string()).to_lowercase(),
            version: self.version.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
        })
    }
}

/// Parse descriptor text directly (used by tests and by callers that embed descriptors).
pub fn parse_module(text: &str, fallback_name: &str) -> Result<ModuleRule, ConfigError> {
    let desc: ModuleDescriptor = toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: Path::new(fallback_name).to_path_buf(),
        source,
    })?;
    desc.into_rule(fallback_name)
}

//! Event → module routing.

use log::{debug, warn};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{ModuleRule, PathPattern};
use crate::engine::tools::{
    basename, ends_with_ci, normalize_lexically, parent_match_string, path_to_match_string,
};
use crate::error::ConfigError;
use crate::{EntryKind, InputKind};

/// Whether the entry appeared while watching or was already there at the first scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    Created,
    Existing,
}

#[derive(Clone, Debug)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub origin: EventOrigin,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EntryKind, origin: EventOrigin) -> Self {
        Self {
            path: path.into(),
            kind,
            origin,
        }
    }
}

/// A module accepted an event.
#[derive(Clone, Debug)]
pub struct Trigger {
    pub rule: Arc<ModuleRule>,
    pub path: PathBuf,
}

struct CompiledRule {
    rule: Arc<ModuleRule>,
    name_re: Option<Regex>,
    path_re: Option<Regex>,
    output_root: PathBuf,
    /// Exact target of a `{case_path}` rule.
    case_target: Option<PathBuf>,
}

fn compile(module: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Regex {
        module: module.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

impl CompiledRule {
    fn new(case_root: &Path, rule: &ModuleRule) -> Result<Self, ConfigError> {
        let name_re = match rule.name_pattern.is_empty() {
            true => None,
            false => Some(compile(&rule.name, &rule.name_pattern)?),
        };
        let path_re = match &rule.path_pattern {
            PathPattern::Regex(re) => Some(compile(&rule.name, re)?),
            _ => None,
        };
        let case_target = match &rule.path_pattern {
            PathPattern::CaseRoot(rest) if rest.is_empty() => Some(normalize_lexically(case_root)),
            PathPattern::CaseRoot(rest) => Some(normalize_lexically(&case_root.join(rest))),
            _ => None,
        };
        Ok(Self {
            rule: Arc::new(rule.clone()),
            name_re,
            path_re,
            output_root: normalize_lexically(&rule.output_root(case_root)),
            case_target,
        })
    }

    fn path_matches(&self, path: &Path) -> bool {
        let is_file_rule = self.rule.input_kind == InputKind::File;
        match &self.rule.path_pattern {
            PathPattern::Any => self.name_re.is_some(),
            PathPattern::Regex(_) => self
                .path_re
                .as_ref()
                .is_some_and(|re| re.is_match(&path_to_match_string(path))),
            PathPattern::CaseRoot(_) => self
                .case_target
                .as_ref()
                .is_some_and(|t| normalize_lexically(path) == *t),
            PathPattern::Wildcard(prefix) => ends_with_ci(&parent_match_string(path), prefix),
            // A named file under a literal directory: the directory is the suffix.
            PathPattern::Suffix(lit) if is_file_rule && self.name_re.is_some() => {
                ends_with_ci(&parent_match_string(path), lit)
            }
            PathPattern::Suffix(lit) => ends_with_ci(&path_to_match_string(path), lit),
        }
    }

    fn name_matches(&self, path: &Path) -> bool {
        match (&self.name_re, self.rule.input_kind) {
            (Some(re), InputKind::File) => re.is_match(&basename(path)),
            _ => true,
        }
    }
}

/// Routes filesystem events of one case to the modules they trigger.
///
/// Holds the in-run set of `(path, module)` pairs already triggered by file rules, so a file
/// seen twice in one run is dispatched once.
pub struct RuleMatcher {
    case_root: PathBuf,
    rules: Vec<CompiledRule>,
    processed: HashSet<(PathBuf, String)>,
}

impl RuleMatcher {
    pub fn new(case_root: impl Into<PathBuf>, rules: &[ModuleRule]) -> Result<Self, ConfigError> {
        let case_root = case_root.into();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.path_pattern == PathPattern::Any && rule.name_pattern.is_empty() {
                warn!("module {} has neither a path nor a name pattern and will never match", rule.name);
            }
            compiled.push(CompiledRule::new(&case_root, rule)?);
        }
        Ok(Self {
            case_root,
            rules: compiled,
            processed: HashSet::new(),
        })
    }

    pub fn case_root(&self) -> &Path {
        &self.case_root
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<ModuleRule>> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// Every `(rule, path)` the event triggers. One event may trigger several modules.
    pub fn match_event(&mut self, event: &FsEvent) -> Vec<Trigger> {
        let mut out = Vec::new();
        let normalized = normalize_lexically(&event.path);
        for c in &self.rules {
            if !c.rule.input_kind.accepts(event.kind) {
                continue;
            }
            if normalized.starts_with(&c.output_root) {
                continue;
            }
            if !c.path_matches(&event.path) || !c.name_matches(&event.path) {
                continue;
            }
            if c.rule.input_kind == InputKind::File
                && !self
                    .processed
                    .insert((event.path.clone(), c.rule.name.clone()))
            {
                debug!("{} already triggered {}", event.path.display(), c.rule.name);
                continue;
            }
            debug!(
                "{:?} {} {} -> {}",
                event.origin,
                event.kind.as_str(),
                event.path.display(),
                c.rule.name
            );
            out.push(Trigger {
                rule: Arc::clone(&c.rule),
                path: event.path.clone(),
            });
        }
        out
    }

    /// Allow `(path, module)` to trigger again in this run.
    pub fn forget(&mut self, path: &Path, module: &str) {
        self.processed
            .remove(&(path.to_path_buf(), module.to_string()));
    }
}

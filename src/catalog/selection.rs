//! Which modules a case runs: profile list, explicit override, then add/remove.

use std::collections::BTreeSet;

use super::{Catalog, ModuleRule, normalize_module_name};
use crate::error::ConfigError;

/// Module selection as given on the command line.
#[derive(Clone, Debug, Default)]
pub struct ModuleSelection {
    pub profile: Option<String>,
    pub modules: Vec<String>,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

fn push_unique(out: &mut Vec<String>, name: &str) {
    let name = normalize_module_name(name);
    if !name.is_empty() && !out.iter().any(|m| m == name) {
        out.push(name.to_string());
    }
}

impl ModuleSelection {
    /// Resolve to an ordered, de-duplicated list of module names.
    ///
    /// An explicit module list replaces the profile's list. `add` / `remove` edit the
    /// result and require a profile.
    pub fn resolve(&self, catalog: &Catalog) -> Result<Vec<String>, ConfigError> {
        if self.profile.is_none() && (!self.add.is_empty() || !self.remove.is_empty()) {
            return Err(ConfigError::Invalid(
                "--module-add / --module-remove need --profile".to_string(),
            ));
        }

        let base = match (&self.profile, self.modules.is_empty()) {
            (_, false) => self.modules.clone(),
            (Some(profile), true) => catalog.load_profile(profile)?,
            (None, true) => Vec::new(),
        };

        let mut out = Vec::with_capacity(base.len() + self.add.len());
        for m in base.iter().chain(self.add.iter()) {
            push_unique(&mut out, m);
        }
        let removed: BTreeSet<&str> = self.remove.iter().map(|m| normalize_module_name(m)).collect();
        out.retain(|m| !removed.contains(m.as_str()));

        if out.is_empty() {
            return Err(ConfigError::Invalid("no modules selected".to_string()));
        }
        Ok(out)
    }
}

/// All selected modules must target one OS, unless one of them is `all`.
pub fn check_os(rules: &[ModuleRule]) -> Result<(), ConfigError> {
    let os: BTreeSet<&str> = rules.iter().map(|r| r.os.as_str()).collect();
    if os.len() <= 1 || os.contains("all") {
        return Ok(());
    }
    Err(ConfigError::MixedOs(
        os.into_iter().collect::<Vec<_>>().join(", "),
    ))
}

//! Output names and tool command lines rendered from module templates.
//!
//! Output templates know `{endpoint_name}`, `{module}`, `{input_file}` and
//! `{input_path_hash}`. Command templates additionally know `{input}`, `{case_path}`,
//! `{output_dir}`, `{output_file}` and `{output_prefix}`.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::TaskInput;
use crate::catalog::{ModuleRule, ToolSpec};
use crate::engine::tools::{basename, path_relative_to, truncate_on_char_boundary};
use crate::utils::config::{INPUT_FILE_NAME_MAX, INPUT_PATH_HASH_LEN};

/// Output locations of one task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedOutput {
    /// Always inside `<case>/<module>`.
    pub output_dir: PathBuf,
    pub output_file: String,
    pub output_prefix: String,
}

/// First path component of `input` below `case_root` ("" when `input` is the root or outside it).
pub fn endpoint_name(case_root: &Path, input: &Path) -> String {
    path_relative_to(input, case_root)
        .and_then(|rel| {
            rel.components().find_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

/// Hex blake3 of the path string, cut to [`INPUT_PATH_HASH_LEN`] chars.
pub fn input_path_hash(path: &Path) -> String {
    let hex = blake3::hash(path.to_string_lossy().as_bytes()).to_hex();
    hex.as_str()[..INPUT_PATH_HASH_LEN].to_string()
}

/// Replace `{key}` placeholders in one pass; substituted values are never rescanned.
fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = vars.iter().find(|(key, _)| {
            tail.strip_prefix(key).is_some_and(|after| after.starts_with('}'))
        });
        match hit {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render the `[output]` templates of `rule` for `input`.
pub fn render_output(rule: &ModuleRule, case_root: &Path, input: &TaskInput) -> RenderedOutput {
    let endpoint = endpoint_name(case_root, input.path());
    let file_name = basename(input.path());
    let input_file = truncate_on_char_boundary(&file_name, INPUT_FILE_NAME_MAX);
    let hash = input_path_hash(input.path());
    let vars = [
        ("endpoint_name", endpoint.as_str()),
        ("module", rule.name.as_str()),
        ("input_file", input_file),
        ("input_path_hash", hash.as_str()),
    ];

    let sub_dir = substitute(&rule.output.output_dir, &vars);
    let mut output_dir = rule.output_root(case_root);
    // Only plain components: the directory may not escape the module output root.
    for comp in Path::new(&sub_dir).components() {
        if let Component::Normal(s) = comp {
            output_dir.push(s);
        }
    }

    RenderedOutput {
        output_dir,
        output_file: substitute(&rule.output.output_file, &vars),
        output_prefix: substitute(&rule.output.output_prefix, &vars),
    }
}

/// Render `tool.cmd` for one task as an argument vector. The tool path is not part of it.
///
/// The template is split shell-style first and placeholders are filled per argument, so a
/// path with spaces or shell syntax stays one literal argument. `None` when the template
/// has unbalanced quotes.
pub fn render_command(
    tool: &ToolSpec,
    rule: &ModuleRule,
    case_root: &Path,
    input: &TaskInput,
    output: &RenderedOutput,
) -> Option<Vec<String>> {
    let endpoint = endpoint_name(case_root, input.path());
    let file_name = basename(input.path());
    let hash = input_path_hash(input.path());
    let input_path = input.path().to_string_lossy();
    let case_path = case_root.to_string_lossy();
    let output_dir = output.output_dir.to_string_lossy();
    let output_file = match output.output_file.is_empty() {
        true => String::new(),
        false => output
            .output_dir
            .join(&output.output_file)
            .to_string_lossy()
            .into_owned(),
    };
    let vars = [
        ("input", &*input_path),
        ("case_path", &*case_path),
        ("output_dir", &*output_dir),
        ("output_file", output_file.as_str()),
        ("output_prefix", output.output_prefix.as_str()),
        ("endpoint_name", endpoint.as_str()),
        ("module", rule.name.as_str()),
        ("input_file", truncate_on_char_boundary(&file_name, INPUT_FILE_NAME_MAX)),
        ("input_path_hash", hash.as_str()),
    ];
    let args = shlex::split(&tool.cmd)?;
    Some(args.iter().map(|a| substitute(a, &vars)).collect())
}

//! Module loading backends.
//!
//! Inputs arrive as file paths (optionally via `@list` response files) and
//! are routed to a loader by extension:
//! - `.json`: serialized IR dumps, always available.
//! - `.bc` / `.ll`: real LLVM bitcode/assembly through the `llvm-ir` crate,
//!   behind the `llvm-loader` feature (it needs an installed LLVM).
//!
//! A module that fails to load is warned about and skipped; only the
//! frontend decides what is fatal.

pub mod json;
#[cfg(feature = "llvm-loader")]
pub mod llvm;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::ir::{ModuleId, Program};

/// Error type for module loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error loading file: '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error loading file: '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    /// No loader is compiled in for this input format.
    #[error("error loading file: '{path}': no loader for this input format")]
    UnsupportedFormat { path: PathBuf },
}

/// Convenience result type for loader operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Expand positional inputs: a plain argument is a path, `@file` names a
/// list with one path per line (blank lines and `#` comments ignored).
pub fn expand_inputs(inputs: &[String]) -> LoadResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for raw in inputs {
        let Some(list) = raw.strip_prefix('@') else {
            out.push(PathBuf::from(raw));
            continue;
        };
        let text = std::fs::read_to_string(list)
            .map_err(|source| LoadError::Io { path: PathBuf::from(list), source })?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            out.push(PathBuf::from(line));
        }
    }
    Ok(out)
}

/// Load one input file into the program.
pub fn load_module(prog: &mut Program, path: &Path) -> LoadResult<Vec<ModuleId>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "json" => json::load(prog, path),
        #[cfg(feature = "llvm-loader")]
        "bc" | "ll" => llvm::load(prog, path),
        _ => Err(LoadError::UnsupportedFormat { path: path.to_path_buf() }),
    }
}

/// Load every input, warning about (and skipping) the ones that fail, and
/// about modules that carry no debug info.
pub fn load_modules(prog: &mut Program, paths: &[PathBuf]) -> Vec<ModuleId> {
    let mut loaded = Vec::new();
    for path in paths {
        match load_module(prog, path) {
            Ok(ids) => {
                for &m in &ids {
                    if !prog.module(m).has_debug_info {
                        warn!("Debug info missing: '{}'", prog.module(m).name);
                    }
                }
                loaded.extend(ids);
            }
            Err(e) => warn!("{e}"),
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_files_expand_to_their_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = dir.path().join("inputs.txt");
        std::fs::write(&list, "a.json\n\n# comment\nb.json\n").expect("write list");

        let inputs =
            vec![format!("@{}", list.display()), "direct.json".to_string()];
        let expanded = expand_inputs(&inputs).expect("expand");
        assert_eq!(
            expanded,
            vec![PathBuf::from("a.json"), PathBuf::from("b.json"), PathBuf::from("direct.json")]
        );
    }

    #[test]
    fn unknown_formats_are_skipped_with_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bogus = dir.path().join("input.xyz");
        std::fs::write(&bogus, b"not ir").expect("write");
        let mut prog = Program::new();
        let loaded = load_modules(&mut prog, &[bogus, dir.path().join("missing.json")]);
        assert!(loaded.is_empty());
        assert!(prog.modules.is_empty());
    }
}

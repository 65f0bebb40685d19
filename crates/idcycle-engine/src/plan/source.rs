use std::path::{Path, PathBuf};

use serde_json::Value;

use idcycle_core::error::{IdcycleError, Result};

/// Yields a parsed, not yet validated, workflow document.
pub trait WorkflowSource {
    fn load(&self) -> Result<Value>;

    /// Short label used in validation errors.
    fn describe(&self) -> String;
}

impl WorkflowSource for Value {
    fn load(&self) -> Result<Value> {
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        "inline workflow".into()
    }
}

/// A workflow document on disk, JSON or TOML by extension.
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    path: PathBuf,
}

impl WorkflowFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkflowSource for WorkflowFile {
    fn load(&self) -> Result<Value> {
        read_document(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Read a JSON or TOML data document (`.toml` selects TOML, anything else JSON).
pub fn read_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        let doc: toml::Value = toml::from_str(&content)?;
        Ok(serde_json::to_value(doc)?)
    } else {
        // Tolerate a leading byte-order mark on input.
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
        serde_json::from_str(content).map_err(|e| {
            IdcycleError::validation(format!("{}: invalid JSON: {}", path.display(), e))
        })
    }
}

//! Prompt Renderer (C4): loads named Markdown templates and substitutes
//! `{{var}}` placeholders.

use crate::error::{AuditError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static PLACEHOLDER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").unwrap());

pub struct PromptRenderer {
    roots: Vec<PathBuf>,
}

impl PromptRenderer {
    /// Two well-known relative roots: `./prompts` and
    /// `<exe_dir>/prompts`, so templates resolve the same whether run from
    /// a source checkout or an installed binary.
    pub fn new() -> Self {
        let mut roots = vec![PathBuf::from("prompts")];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                roots.push(dir.join("prompts"));
            }
        }
        Self { roots }
    }

    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Load `prompts/<name>.md`. `name` must match `^[A-Za-z0-9_-]+$`.
    pub fn load(&self, name: &str) -> Result<String> {
        if !NAME_PATTERN.is_match(name) {
            return Err(AuditError::InvalidPath(PathBuf::from(name)));
        }

        for root in &self.roots {
            let candidate = root.join(format!("{name}.md"));
            if candidate.exists() {
                return std::fs::read_to_string(&candidate).map_err(AuditError::Io);
            }
        }

        Err(AuditError::NotFound(format!("prompt template: {name}")))
    }

    /// Global, literal substitution of `{{key}}` placeholders; missing keys
    /// are left as literal text.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        PLACEHOLDER_PATTERN
            .replace_all(template, |caps: &regex::Captures| {
                let key = &caps[1];
                vars.get(key).cloned().unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn load_and_render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load(name)?;
        Ok(Self::render(&template, vars))
    }
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn local_dir() -> &'static Path {
    Path::new("prompts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_keys() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "widget-api".to_string());
        let out = PromptRenderer::render("Project: {{name}}", &vars);
        assert_eq!(out, "Project: widget-api");
    }

    #[test]
    fn render_leaves_unknown_keys_literal() {
        let vars = HashMap::new();
        let out = PromptRenderer::render("Hello {{missing}}", &vars);
        assert_eq!(out, "Hello {{missing}}");
    }

    #[test]
    fn load_rejects_traversal_names() {
        let renderer = PromptRenderer::with_roots(vec![PathBuf::from("prompts")]);
        let result = renderer.load("../../etc/passwd");
        assert!(matches!(result, Err(AuditError::InvalidPath(_))));
    }

    #[test]
    fn load_finds_template_in_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("classify.md"), "Category: {{category}}").unwrap();
        let renderer = PromptRenderer::with_roots(vec![tmp.path().to_path_buf()]);
        let template = renderer.load("classify").unwrap();
        assert_eq!(template, "Category: {{category}}");
    }
}

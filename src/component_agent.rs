//! Component Agent (C7): a bounded tool-using loop that explores a
//! project's repositories and produces components + dependencies with
//! security profiles.

use crate::db::components as components_db;
use crate::error::{AuditError, Result};
use crate::llm_gateway::{ContentBlock, LlmGateway};
use crate::models::{Component, ComponentRole, Dependency};
use crate::prompts::PromptRenderer;
use crate::repo_store::RepoStore;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_TURNS: u32 = 40;
const MAX_CONSECUTIVE_TOOL_ERRORS: u32 = 5;
const MAX_READ_FILE_LINES: usize = 500;
const MAX_SEARCH_RESULTS: usize = 100;
const PROGRESS_PERSIST_EVERY_N_TURNS: u32 = 3;

const SKIP_DIRS: &[&str] = &["node_modules", ".git", "vendor", "dist", "build", "target"];

#[derive(Debug, Deserialize)]
struct AgentOutputComponent {
    name: String,
    role: String,
    repo: String,
    description: String,
    file_patterns: Vec<String>,
    languages: Vec<String>,
    security_profile: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AgentOutputDependency {
    name: String,
    version: Option<String>,
    ecosystem: String,
    repo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentOutput {
    components: Vec<AgentOutputComponent>,
    #[serde(default)]
    dependencies: Vec<AgentOutputDependency>,
}

pub struct AgentProgress {
    pub turns_used: u32,
    pub tokens_used: i64,
    pub running_cost_usd: f64,
}

pub struct ComponentAgent<'a> {
    gateway: &'a LlmGateway,
    renderer: &'a PromptRenderer,
    repo_store: &'a RepoStore,
    pool: &'a PgPool,
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "list_directory",
            "description": "List entries in a directory of a repository. Directories end with '/'.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "repo_name": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["repo_name", "path"]
            }
        }),
        json!({
            "name": "read_file",
            "description": "Read a file's content. Content over 500 lines is truncated.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "repo_name": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["repo_name", "path"]
            }
        }),
        json!({
            "name": "search_files",
            "description": "Search the scanned file list by glob pattern. Capped at 100 results.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "repo_name": {"type": "string"},
                    "pattern": {"type": "string"}
                },
                "required": ["repo_name", "pattern"]
            }
        }),
    ]
}

impl<'a> ComponentAgent<'a> {
    pub fn new(
        gateway: &'a LlmGateway,
        renderer: &'a PromptRenderer,
        repo_store: &'a RepoStore,
        pool: &'a PgPool,
    ) -> Self {
        Self {
            gateway,
            renderer,
            repo_store,
            pool,
        }
    }

    /// Run the loop for a project. `repo_roots` maps repo_name -> local
    /// checkout path, and `scanned_files` maps repo_name -> (relative path,
    /// rough token count) pairs already discovered by the repo store.
    pub async fn run(
        &self,
        api_key: &str,
        project_id: Uuid,
        project_name: &str,
        repo_roots: &HashMap<String, std::path::PathBuf>,
        repo_ids: &HashMap<String, Uuid>,
        scanned_files: &HashMap<String, Vec<(String, i64)>>,
    ) -> Result<AgentProgress> {
        let mut vars = HashMap::new();
        vars.insert("project_name".to_string(), project_name.to_string());
        vars.insert(
            "repo_names".to_string(),
            repo_roots.keys().cloned().collect::<Vec<_>>().join(", "),
        );
        let system_prompt = self.renderer.load_and_render("component_agent", &vars)?;

        let mut messages: Vec<Value> = vec![json!({"role": "user", "content": "Begin."})];
        let tools = tool_definitions();

        let mut turns_used = 0u32;
        let mut tokens_used: i64 = 0;
        let mut consecutive_errors = 0u32;

        loop {
            if turns_used >= MAX_TURNS {
                return Err(AuditError::other(format!(
                    "component agent exceeded {MAX_TURNS} turns without finishing"
                )));
            }

            let response = self
                .gateway
                .call_with_tools(api_key, &system_prompt, &messages, &tools, None, None)
                .await?;
            turns_used += 1;
            tokens_used += response.input_tokens + response.output_tokens;

            match response.stop_reason.as_str() {
                "end_turn" => {
                    let text = response.text();
                    let output: AgentOutput = crate::llm_gateway::parse_json(&text)?;
                    self.store(project_id, repo_ids, scanned_files, output).await?;
                    return Ok(AgentProgress {
                        turns_used,
                        tokens_used,
                        running_cost_usd: 0.0,
                    });
                }
                "tool_use" => {
                    let assistant_blocks: Vec<Value> = response
                        .blocks
                        .iter()
                        .map(|b| match b {
                            ContentBlock::Text(t) => json!({"type": "text", "text": t}),
                            ContentBlock::ToolUse { id, name, input } => {
                                json!({"type": "tool_use", "id": id, "name": name, "input": input})
                            }
                        })
                        .collect();
                    messages.push(json!({"role": "assistant", "content": assistant_blocks}));

                    let mut tool_results = Vec::new();
                    let mut turn_had_error = false;

                    for block in &response.blocks {
                        if let ContentBlock::ToolUse { id, name, input } = block {
                            let result = self.execute_tool(name, input, repo_roots, scanned_files);
                            match result {
                                Ok(content) => {
                                    tool_results.push(json!({
                                        "type": "tool_result",
                                        "tool_use_id": id,
                                        "content": content,
                                    }));
                                }
                                Err(e) => {
                                    turn_had_error = true;
                                    tool_results.push(json!({
                                        "type": "tool_result",
                                        "tool_use_id": id,
                                        "content": e.to_string(),
                                        "is_error": true,
                                    }));
                                }
                            }
                        }
                    }

                    if turn_had_error {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_TOOL_ERRORS {
                            return Err(AuditError::other(
                                "component agent aborted after 5 consecutive tool errors",
                            ));
                        }
                    } else {
                        consecutive_errors = 0;
                    }

                    messages.push(json!({"role": "user", "content": tool_results}));
                }
                other => {
                    warn!("component agent stopped with unexpected reason: {other}");
                    return Err(AuditError::other(format!(
                        "component agent hit max-turns-equivalent stop reason: {other}"
                    )));
                }
            }

            if turns_used % PROGRESS_PERSIST_EVERY_N_TURNS == 0 {
                info!(
                    "component agent progress: turns={turns_used} tokens={tokens_used}"
                );
            }
        }
    }

    fn execute_tool(
        &self,
        name: &str,
        input: &Value,
        repo_roots: &HashMap<String, std::path::PathBuf>,
        scanned_files: &HashMap<String, Vec<(String, i64)>>,
    ) -> Result<String> {
        match name {
            "list_directory" => self.list_directory(input, repo_roots),
            "read_file" => self.read_file(input, repo_roots),
            "search_files" => self.search_files(input, scanned_files),
            other => Err(AuditError::other(format!("unknown tool: {other}"))),
        }
    }

    fn list_directory(
        &self,
        input: &Value,
        repo_roots: &HashMap<String, std::path::PathBuf>,
    ) -> Result<String> {
        let repo_name = input["repo_name"].as_str().unwrap_or_default();
        let path = input["path"].as_str().unwrap_or(".");
        let root = repo_roots
            .get(repo_name)
            .ok_or_else(|| AuditError::NotFound(format!("repo: {repo_name}")))?;

        let target = root.join(path);
        let entries = std::fs::read_dir(&target).map_err(AuditError::Io)?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(AuditError::Io)?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if SKIP_DIRS.contains(&file_name.as_str()) {
                continue;
            }
            let file_type = entry.file_type().map_err(AuditError::Io)?;
            if file_type.is_dir() {
                names.push(format!("{file_name}/"));
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                names.push(format!("{file_name} ({size} bytes)"));
            }
        }
        names.sort();
        Ok(names.join("\n"))
    }

    fn read_file(
        &self,
        input: &Value,
        repo_roots: &HashMap<String, std::path::PathBuf>,
    ) -> Result<String> {
        let repo_name = input["repo_name"].as_str().unwrap_or_default();
        let path = input["path"].as_str().unwrap_or_default();
        let root = repo_roots
            .get(repo_name)
            .ok_or_else(|| AuditError::NotFound(format!("repo: {repo_name}")))?;

        let content = self.repo_store.read_file_content(root, path)?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() > MAX_READ_FILE_LINES {
            let truncated = lines[..MAX_READ_FILE_LINES].join("\n");
            Ok(format!(
                "{truncated}\n\n[truncated: file has {} lines, showing first {MAX_READ_FILE_LINES}]",
                lines.len()
            ))
        } else {
            Ok(content)
        }
    }

    fn search_files(
        &self,
        input: &Value,
        scanned_files: &HashMap<String, Vec<(String, i64)>>,
    ) -> Result<String> {
        let repo_name = input["repo_name"].as_str().unwrap_or_default();
        let pattern_str = input["pattern"].as_str().unwrap_or_default();
        let files = scanned_files
            .get(repo_name)
            .ok_or_else(|| AuditError::NotFound(format!("repo: {repo_name}")))?;

        let pattern = glob::Pattern::new(pattern_str)
            .map_err(|e| AuditError::other(format!("invalid glob pattern: {e}")))?;

        let matches: Vec<&str> = files
            .iter()
            .map(|(path, _)| path.as_str())
            .filter(|f| pattern.matches(f))
            .take(MAX_SEARCH_RESULTS)
            .collect();

        Ok(matches.join("\n"))
    }

    /// Persist the agent's output: match file patterns against the owning
    /// repo's scanned files to compute estimated files/tokens, then replace
    /// the project's components and dependencies in a single transaction.
    async fn store(
        &self,
        project_id: Uuid,
        repo_ids: &HashMap<String, Uuid>,
        scanned_files: &HashMap<String, Vec<(String, i64)>>,
        output: AgentOutput,
    ) -> Result<()> {
        let mut new_components = Vec::with_capacity(output.components.len());

        for c in output.components {
            let repo_id = match repo_ids.get(&c.repo) {
                Some(id) => *id,
                None => {
                    warn!("component {} references unknown repo {}, skipping", c.name, c.repo);
                    continue;
                }
            };
            let role = parse_role(&c.role);
            let files = scanned_files.get(&c.repo).cloned().unwrap_or_default();
            let (estimated_files, estimated_tokens) =
                estimate_component_size(&c.file_patterns, &files);

            new_components.push(Component {
                id: Uuid::new_v4(),
                project_id,
                repo_id,
                name: c.name,
                description: c.description,
                role,
                file_patterns: c.file_patterns,
                languages: c.languages,
                security_profile: c.security_profile,
                estimated_files,
                estimated_tokens,
            });
        }

        let new_dependencies: Vec<Dependency> = output
            .dependencies
            .into_iter()
            .map(|d| Dependency {
                id: Uuid::new_v4(),
                project_id,
                repo_id: None,
                name: d.name,
                version: d.version,
                ecosystem: d.ecosystem,
                source_repo_url: None,
                linked_project_id: None,
            })
            .collect();

        components_db::replace_components_and_dependencies(
            self.pool,
            project_id,
            new_components,
            new_dependencies,
        )
        .await?;
        Ok(())
    }
}

fn parse_role(role: &str) -> ComponentRole {
    match role {
        "server" => ComponentRole::Server,
        "client" => ComponentRole::Client,
        "library" => ComponentRole::Library,
        "cli" => ComponentRole::Cli,
        "worker" => ComponentRole::Worker,
        "shared" => ComponentRole::Shared,
        "config" => ComponentRole::Config,
        _ => ComponentRole::Test,
    }
}

fn estimate_component_size(patterns: &[String], files: &[(String, i64)]) -> (i64, i64) {
    let compiled: Vec<glob::Pattern> = patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let matched: Vec<&(String, i64)> = files
        .iter()
        .filter(|(f, _)| compiled.iter().any(|p| p.matches(f)))
        .collect();

    let estimated_tokens: i64 = matched.iter().map(|(_, tokens)| *tokens).sum();
    (matched.len() as i64, estimated_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_component_size_matches_glob_patterns() {
        let files = vec![
            ("src/server/main.rs".to_string(), 1200),
            ("src/client/app.tsx".to_string(), 800),
            ("README.md".to_string(), 50),
        ];
        let (count, tokens) = estimate_component_size(&["src/server/**".to_string()], &files);
        assert_eq!(count, 1);
        assert_eq!(tokens, 1200);
    }

    #[test]
    fn estimate_component_size_sums_real_tokens_across_matches() {
        let files = vec![
            ("src/server/a.rs".to_string(), 300),
            ("src/server/b.rs".to_string(), 700),
            ("src/client/app.tsx".to_string(), 800),
        ];
        let (count, tokens) = estimate_component_size(&["src/server/**".to_string()], &files);
        assert_eq!(count, 2);
        assert_eq!(tokens, 1000);
    }

    #[test]
    fn parse_role_defaults_to_test_for_unknown() {
        assert!(matches!(parse_role("bogus"), ComponentRole::Test));
        assert!(matches!(parse_role("worker"), ComponentRole::Worker));
    }
}

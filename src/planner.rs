//! Planner (C6): local security grep, LLM priority ranking with batching
//! and recursive halving on parse failure, and budgeted file selection.

use crate::error::{AuditError, Result};
use crate::llm_gateway::{parse_json, LlmGateway};
use crate::models::AuditLevel;
use crate::prompts::PromptRenderer;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const BATCH_SIZE: usize = 100;
const MIN_BATCH_SIZE: usize = 25;

struct GrepPattern {
    category: &'static str,
    regex: Regex,
}

static GREP_PATTERNS: Lazy<Vec<GrepPattern>> = Lazy::new(build_grep_patterns);

fn build_grep_patterns() -> Vec<GrepPattern> {
    let specs: &[(&str, &str)] = &[
        // injection
        ("injection", r"eval\s*\("),
        ("injection", r"exec\s*\("),
        ("injection", r"new Function\s*\("),
        ("injection", r"child_process"),
        ("injection", r"os\.system\s*\("),
        ("injection", r"subprocess\.(call|run|Popen)"),
        // sql
        ("sql", r"(?i)select .* from .* where"),
        ("sql", r#"["']\s*\+\s*\w+\s*\+\s*["']"#),
        ("sql", r"execute\s*\(\s*[\"'].*%s"),
        ("sql", r"raw\s*\(\s*[f]?[\"']"),
        ("sql", r"query\s*\(\s*`"),
        // auth
        ("auth", r"(?i)password\s*=\s*[\"']"),
        ("auth", r"(?i)api[_-]?key\s*=\s*[\"']"),
        ("auth", r"(?i)secret\s*=\s*[\"']"),
        ("auth", r"jwt\.decode\("),
        ("auth", r"(?i)basic\s+auth"),
        ("auth", r"(?i)bypass.*auth"),
        // crypto
        ("crypto", r"(?i)md5\("),
        ("crypto", r"(?i)sha1\("),
        ("crypto", r"(?i)des\("),
        ("crypto", r"Math\.random\("),
        ("crypto", r"(?i)ecb"),
        // network
        ("network", r"(?i)verify\s*=\s*false"),
        ("network", r"rejectUnauthorized\s*:\s*false"),
        ("network", r"(?i)insecure"),
        ("network", r"http://"),
        ("network", r"(?i)cors.*\*"),
        // file_io
        ("file_io", r"\.\./"),
        ("file_io", r"(?i)path\.join\([^)]*req\."),
        ("file_io", r"os\.path\.join\([^)]*request\."),
    ];

    specs
        .iter()
        .map(|(category, pattern)| GrepPattern {
            category,
            regex: Regex::new(pattern).expect("static grep pattern compiles"),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct GrepMatch {
    pub category: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct GrepResult {
    pub file: String,
    pub hit_count: usize,
    pub samples: Vec<GrepMatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankedFile {
    pub file: String,
    pub priority: u8,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub relative_path: String,
    pub rough_tokens: i64,
}

pub struct Planner<'a> {
    gateway: &'a LlmGateway,
    renderer: &'a PromptRenderer,
}

impl<'a> Planner<'a> {
    pub fn new(gateway: &'a LlmGateway, renderer: &'a PromptRenderer) -> Self {
        Self { gateway, renderer }
    }

    /// Local security grep: scan a file's content line by line against the
    /// curated pattern set. Up to 3 sample matches are kept, each trimmed to
    /// 120 chars.
    pub fn grep_file(relative_path: &str, content: &str) -> GrepResult {
        let mut hit_count = 0usize;
        let mut samples = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            for pattern in GREP_PATTERNS.iter() {
                if pattern.regex.is_match(line) {
                    hit_count += 1;
                    if samples.len() < 3 {
                        let trimmed: String = line.trim().chars().take(120).collect();
                        samples.push(GrepMatch {
                            category: pattern.category.to_string(),
                            line: idx + 1,
                            text: trimmed,
                        });
                    }
                }
            }
        }

        GrepResult {
            file: relative_path.to_string(),
            hit_count,
            samples,
        }
    }

    /// Run the grep phase across every readable file, sorted by hit count
    /// descending.
    pub fn grep_phase(&self, repo_root: &Path, files: &[CandidateFile]) -> Vec<GrepResult> {
        let mut results: Vec<GrepResult> = files
            .iter()
            .filter_map(|f| {
                let candidate = repo_root.join(&f.relative_path);
                let resolved = candidate.canonicalize().ok()?;
                let root_resolved = repo_root.canonicalize().ok()?;
                if !resolved.starts_with(&root_resolved) {
                    return None;
                }
                let content = std::fs::read_to_string(&resolved).ok()?;
                Some(Self::grep_file(&f.relative_path, &content))
            })
            .collect();

        results.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        results
    }

    /// LLM priority ranking: batch files into groups of 100, calling the
    /// LLM for each, with recursive halving on JSON parse failure down to a
    /// floor of 25.
    #[allow(clippy::too_many_arguments)]
    pub async fn rank_files(
        &self,
        api_key: &str,
        category: &str,
        description: &str,
        threat_model: &str,
        component_profiles: &str,
        grep_output: &[GrepResult],
        files: &[CandidateFile],
    ) -> Result<Vec<RankedFile>> {
        let grep_block = render_grep_block(grep_output);
        let mut ranked = Vec::new();

        for batch in files.chunks(BATCH_SIZE) {
            let mut batch_ranked = self
                .rank_batch(
                    api_key,
                    category,
                    description,
                    threat_model,
                    component_profiles,
                    &grep_block,
                    batch,
                )
                .await?;
            ranked.append(&mut batch_ranked);
        }

        Ok(ranked)
    }

    #[allow(clippy::too_many_arguments)]
    async fn rank_batch(
        &self,
        api_key: &str,
        category: &str,
        description: &str,
        threat_model: &str,
        component_profiles: &str,
        grep_block: &str,
        batch: &[CandidateFile],
    ) -> Result<Vec<RankedFile>> {
        let file_list = render_file_list(batch);
        let mut vars = HashMap::new();
        vars.insert("category".to_string(), category.to_string());
        vars.insert("description".to_string(), description.to_string());
        vars.insert("threat_model".to_string(), threat_model.to_string());
        vars.insert("component_profiles".to_string(), component_profiles.to_string());
        vars.insert("grep_output".to_string(), grep_block.to_string());
        vars.insert("file_list".to_string(), file_list);

        let prompt = self.renderer.load_and_render("plan_rank", &vars)?;

        let response = self
            .gateway
            .call(
                api_key,
                "security audit planner; return JSON only",
                &prompt,
                None,
                None,
            )
            .await?;

        match parse_json::<Vec<RankedFile>>(&response.content) {
            Ok(ranked) => Ok(ranked),
            Err(AuditError::LlmParse { .. }) if batch.len() > MIN_BATCH_SIZE => {
                let mid = batch.len() / 2;
                let (left, right) = batch.split_at(mid);
                let mut left_ranked = Box::pin(self.rank_batch(
                    api_key,
                    category,
                    description,
                    threat_model,
                    component_profiles,
                    grep_block,
                    left,
                ))
                .await?;
                let mut right_ranked = Box::pin(self.rank_batch(
                    api_key,
                    category,
                    description,
                    threat_model,
                    component_profiles,
                    grep_block,
                    right,
                ))
                .await?;
                left_ranked.append(&mut right_ranked);
                Ok(left_ranked)
            }
            Err(e) => Err(e),
        }
    }

    /// Budgeted selection: sort by priority descending, greedily accumulate
    /// until the budget is exhausted. `full` includes everything. If
    /// nothing fits, include the first (highest-priority) file anyway.
    pub fn select_within_budget(
        level: AuditLevel,
        ranked: &[RankedFile],
        tokens_by_file: &HashMap<String, i64>,
        total_tokens: i64,
    ) -> Vec<String> {
        if matches!(level, AuditLevel::Full) {
            return ranked.iter().map(|r| r.file.clone()).collect();
        }

        let mut sorted: Vec<&RankedFile> = ranked.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let budget = (total_tokens as f64 * level.budget_pct()).round() as i64;
        let mut accumulated = 0i64;
        let mut selected = Vec::new();

        for r in &sorted {
            let tokens = *tokens_by_file.get(&r.file).unwrap_or(&0);
            if accumulated + tokens <= budget {
                accumulated += tokens;
                selected.push(r.file.clone());
            }
        }

        if selected.is_empty() {
            if let Some(first) = sorted.first() {
                selected.push(first.file.clone());
            }
        }

        selected
    }
}

fn render_grep_block(results: &[GrepResult]) -> String {
    results
        .iter()
        .filter(|r| r.hit_count > 0)
        .map(|r| {
            let samples = r
                .samples
                .iter()
                .map(|s| format!("  [{}:{}] {}", s.category, s.line, s.text))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{} ({} hits)\n{}", r.file, r.hit_count, samples)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_file_list(files: &[CandidateFile]) -> String {
    files
        .iter()
        .map(|f| format!("{} ({} tokens)", f.relative_path, f.rough_tokens))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grep_file_detects_hardcoded_secret() {
        let content = "let password = \"hunter2\";\nfn main() {}";
        let result = Planner::grep_file("src/main.rs", content);
        assert_eq!(result.hit_count, 1);
        assert_eq!(result.samples[0].category, "auth");
        assert_eq!(result.samples[0].line, 1);
    }

    #[test]
    fn grep_file_caps_samples_at_three() {
        let content = (0..10)
            .map(|_| "eval(userInput)")
            .collect::<Vec<_>>()
            .join("\n");
        let result = Planner::grep_file("src/evil.js", &content);
        assert_eq!(result.hit_count, 10);
        assert_eq!(result.samples.len(), 3);
    }

    #[test]
    fn select_within_budget_greedily_fills_thorough() {
        let ranked = vec![
            RankedFile { file: "a.rs".into(), priority: 9, reason: String::new() },
            RankedFile { file: "b.rs".into(), priority: 7, reason: String::new() },
            RankedFile { file: "c.rs".into(), priority: 3, reason: String::new() },
        ];
        let mut tokens = HashMap::new();
        tokens.insert("a.rs".to_string(), 10_000);
        tokens.insert("b.rs".to_string(), 10_000);
        tokens.insert("c.rs".to_string(), 10_000);

        let selected =
            Planner::select_within_budget(AuditLevel::Thorough, &ranked, &tokens, 100_000);
        assert_eq!(selected, vec!["a.rs", "b.rs", "c.rs"]);
    }

    #[test]
    fn select_within_budget_falls_back_to_top_file_when_nothing_fits() {
        let ranked = vec![
            RankedFile { file: "big.rs".into(), priority: 9, reason: String::new() },
            RankedFile { file: "small.rs".into(), priority: 5, reason: String::new() },
        ];
        let mut tokens = HashMap::new();
        tokens.insert("big.rs".to_string(), 50_000);
        tokens.insert("small.rs".to_string(), 10_000);

        let selected =
            Planner::select_within_budget(AuditLevel::Opportunistic, &ranked, &tokens, 100_000);
        assert_eq!(selected, vec!["big.rs"]);
    }

    #[test]
    fn select_within_budget_full_includes_everything() {
        let ranked = vec![
            RankedFile { file: "a.rs".into(), priority: 1, reason: String::new() },
            RankedFile { file: "b.rs".into(), priority: 1, reason: String::new() },
        ];
        let tokens = HashMap::new();
        let selected = Planner::select_within_budget(AuditLevel::Full, &ranked, &tokens, 0);
        assert_eq!(selected.len(), 2);
    }
}

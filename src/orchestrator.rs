//! Audit Orchestrator (C8): the five-phase state machine that drives a
//! single audit from `cloning` to a terminal status, plus the incremental
//! diff-and-inheritance step that runs between Clone and Classify.
//!
//! One `AuditOrchestrator::run_audit` call is one audit task (spec §5):
//! internally sequential across phases, safe to run concurrently with other
//! audit tasks since repo checkouts are shared by path (C1) and status
//! transitions are single-writer per audit id.

use crate::component_agent::ComponentAgent;
use crate::db::{audits as audits_db, components as components_db, findings as findings_db};
use crate::error::{AuditError, Result};
use crate::llm_gateway::{parse_json, LlmGateway};
use crate::models::{
    Audit, AuditLevel, AuditStatus, Component, Finding, FindingStatus, ProgressDetail,
    ReportSummary, Severity,
};
use crate::planner::{CandidateFile, Planner};
use crate::progress::{self, ProgressBus};
use crate::prompts::PromptRenderer;
use crate::repo_store::{DiffResult, RepoStore};
use crate::token_accountant::CostEstimate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Batches are packed up to this many tokens before a new one starts
/// (RULE-20); a single file larger than this forms its own batch.
const ANALYSIS_BATCH_TOKEN_CAP: i64 = 150_000;

/// Classification cost is a hardcoded placeholder (spec §4.8, §9) pending
/// wiring to the classify call's actual token usage.
const CLASSIFICATION_COST_USD: f64 = 0.05;

const FINDINGS_SUMMARY_DESC_CHARS: usize = 160;

// ---------------------------------------------------------------------------
// Pure helpers (no I/O) — the bulk of the orchestrator's decision logic,
// kept free of the database/LLM/filesystem so they can be exercised
// directly against the scenarios in spec §8.
// ---------------------------------------------------------------------------

/// `<repoName>/<relativePath>` — every file the orchestrator touches past
/// the clone phase is referred to by this namespaced form.
pub fn namespaced_path(repo_name: &str, relative_path: &str) -> String {
    format!("{repo_name}/{relative_path}")
}

/// Split a namespaced path back into `(repo_name, relative_path)`.
pub fn split_namespaced(path: &str) -> Option<(&str, &str)> {
    path.split_once('/')
}

/// Namespace every path in a repo-local diff result.
pub fn namespace_diff(repo_name: &str, diff: DiffResult) -> DiffResult {
    DiffResult {
        added: diff.added.iter().map(|f| namespaced_path(repo_name, f)).collect(),
        modified: diff.modified.iter().map(|f| namespaced_path(repo_name, f)).collect(),
        deleted: diff.deleted.iter().map(|f| namespaced_path(repo_name, f)).collect(),
        renamed: diff
            .renamed
            .iter()
            .map(|(from, to)| (namespaced_path(repo_name, from), namespaced_path(repo_name, to)))
            .collect(),
        is_fallback: diff.is_fallback,
    }
}

/// `filesToAnalyzeOverride = added ∪ modified ∪ renamed-to` (spec §4.8
/// Phase 1).
pub fn files_to_analyze_from_diff(diff: &DiffResult) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    files.extend(diff.added.iter().cloned());
    files.extend(diff.modified.iter().cloned());
    files.extend(diff.renamed.iter().map(|(_, to)| to.clone()));
    files
}

pub struct InheritOutcome {
    /// New findings to insert into the new audit, fingerprint-deduped.
    pub findings_to_insert: Vec<Finding>,
    /// Base finding ids that should have `resolved_in_audit_id` set to the
    /// new audit (their file was deleted, so they're carried forward
    /// `fixed`).
    pub base_resolutions: Vec<Uuid>,
}

/// Carry a base audit's open findings forward into the new audit per
/// RULE-33/RULE-34/RULE-14 (P3). `base_findings` must already be filtered
/// to `status = 'open'`. `existing_fingerprints` is whatever is already
/// inserted into the new audit (normally empty at this point in the
/// pipeline, but honored for idempotent re-runs).
pub fn inherit_findings(
    base_findings: &[Finding],
    diff: &DiffResult,
    new_audit_id: Uuid,
    existing_fingerprints: &HashSet<String>,
) -> InheritOutcome {
    let deleted: HashSet<&str> = diff.deleted.iter().map(|s| s.as_str()).collect();
    let renamed: HashMap<&str, &str> = diff
        .renamed
        .iter()
        .map(|(from, to)| (from.as_str(), to.as_str()))
        .collect();

    let mut seen: HashSet<String> = existing_fingerprints.clone();
    let mut findings_to_insert = Vec::new();
    let mut base_resolutions = Vec::new();

    for bf in base_findings {
        let (new_path, new_status, resolve) = if deleted.contains(bf.file_path.as_str()) {
            (bf.file_path.clone(), FindingStatus::Fixed, true)
        } else if let Some(to) = renamed.get(bf.file_path.as_str()) {
            (to.to_string(), bf.status, false)
        } else {
            (bf.file_path.clone(), bf.status, false)
        };

        let fingerprint = findings_db::fingerprint(
            &new_path,
            bf.line_start,
            bf.line_end,
            &bf.title,
            bf.code_snippet.as_deref().unwrap_or(""),
        );

        if !seen.insert(fingerprint.clone()) {
            continue;
        }

        if resolve {
            base_resolutions.push(bf.id);
        }

        findings_to_insert.push(Finding {
            id: Uuid::new_v4(),
            audit_id: new_audit_id,
            component_id: bf.component_id,
            file_path: new_path,
            line_start: bf.line_start,
            line_end: bf.line_end,
            severity: bf.severity,
            cwe_id: bf.cwe_id.clone(),
            cvss_score: bf.cvss_score,
            title: bf.title.clone(),
            description: bf.description.clone(),
            exploitation: bf.exploitation.clone(),
            recommendation: bf.recommendation.clone(),
            code_snippet: bf.code_snippet.clone(),
            status: new_status,
            fingerprint,
            resolved_in_audit_id: None,
        });
    }

    InheritOutcome {
        findings_to_insert,
        base_resolutions,
    }
}

/// Greedily pack pre-sorted (alphabetical) `(path, tokens)` pairs into
/// batches capped at `max_tokens`; a single file over the cap gets its own
/// batch (spec §4.8 Phase 4, RULE-20).
pub fn pack_batches(files: &[(String, i64)], max_tokens: i64) -> Vec<Vec<String>> {
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens: i64 = 0;

    for (path, tokens) in files {
        if *tokens > max_tokens {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            batches.push(vec![path.clone()]);
            continue;
        }

        if current_tokens + tokens > max_tokens && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        current.push(path.clone());
        current_tokens += tokens;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// A component's file patterns, namespaced with its owning repo's name and
/// pre-compiled, so attribution doesn't recompile globs per finding.
pub struct ComponentPatterns {
    pub component_id: Uuid,
    pub patterns: Vec<glob::Pattern>,
}

pub fn compile_component_patterns(
    components: &[Component],
    repo_names: &HashMap<Uuid, String>,
) -> Vec<ComponentPatterns> {
    components
        .iter()
        .map(|c| {
            let repo_name = repo_names.get(&c.repo_id).cloned().unwrap_or_default();
            let patterns = c
                .file_patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(&namespaced_path(&repo_name, p)).ok())
                .collect();
            ComponentPatterns {
                component_id: c.id,
                patterns,
            }
        })
        .collect()
}

/// First pattern match wins, in component order (spec §4.8 Phase 5).
pub fn attribute_component(file_path: &str, compiled: &[ComponentPatterns]) -> Option<Uuid> {
    compiled
        .iter()
        .find(|c| c.patterns.iter().any(|p| p.matches(file_path)))
        .map(|c| c.component_id)
}

/// Max severity over a set of findings, walking the ordering
/// `critical > high > medium > low > informational > none`.
pub fn max_severity(findings: &[Finding]) -> Option<Severity> {
    findings.iter().map(|f| f.severity).max()
}

pub fn findings_summary(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| {
            let truncated: String = f.description.chars().take(FINDINGS_SUMMARY_DESC_CHARS).collect();
            format!("[{}] {} ({}): {truncated}", f.severity.as_str(), f.title, f.file_path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short context block naming the base audit's open findings for files in
/// this batch (spec §4.8 Phase 4 step 1, incremental audits only). Empty
/// when there's no base audit or none of its findings touch this batch.
fn previous_findings_block(base_findings: &[Finding], batch: &[String]) -> String {
    let relevant: Vec<&Finding> = base_findings
        .iter()
        .filter(|f| batch.iter().any(|b| b == &f.file_path))
        .collect();
    if relevant.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = relevant
        .iter()
        .map(|f| {
            format!(
                "- {} L{}-{}: [{}] {}",
                f.file_path,
                f.line_start,
                f.line_end,
                f.severity.as_str(),
                f.title
            )
        })
        .collect();
    format!(
        "Previously reported open findings for files in this batch (do not re-report duplicates):\n{}",
        lines.join("\n")
    )
}

/// ~18 path-based security-critical regexes for the fallback heuristic used
/// when the planner returns zero files (spec §4.8 Phase 3).
static FALLBACK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let specs = [
        r"(?i)auth", r"(?i)login", r"(?i)session", r"(?i)token", r"(?i)password",
        r"(?i)secret", r"(?i)crypto", r"(?i)cipher", r"(?i)jwt", r"(?i)oauth",
        r"(?i)middleware", r"(?i)permission", r"(?i)access[_-]?control", r"(?i)admin",
        r"(?i)api[_-]?key", r"(?i)sql", r"(?i)sanitize", r"(?i)validat",
    ];
    specs.iter().map(|p| Regex::new(p).expect("static pattern compiles")).collect()
});

fn fallback_score(path: &str) -> usize {
    FALLBACK_PATTERNS.iter().filter(|r| r.is_match(path)).count()
}

/// Score every file by fallback-pattern hit count and take the top
/// `ceil(n * budget)` (spec §4.8 Phase 3 fallback).
pub fn pattern_fallback_select(files: &[String], budget_pct: f64) -> Vec<String> {
    if files.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(&String, usize)> = files.iter().map(|f| (f, fallback_score(f))).collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    let take_n = ((files.len() as f64) * budget_pct).ceil() as usize;
    scored
        .into_iter()
        .take(take_n.max(1))
        .map(|(f, _)| f.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Async orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ClassifyOutput {
    category: String,
    description: String,
    #[serde(default)]
    involved_parties: serde_json::Value,
    #[serde(default)]
    #[allow(dead_code)]
    components: Vec<ClassifyComponent>,
    threat_model: ClassifyThreatModel,
    threat_model_source: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct ClassifyComponent {
    name: String,
    role: String,
    languages: Vec<String>,
    repo: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifyThreatModel {
    #[serde(default)]
    parties: Vec<String>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnalyzeBatchFinding {
    file: String,
    line_start: i64,
    line_end: i64,
    severity: String,
    cwe_id: Option<String>,
    cvss_score: Option<f64>,
    title: String,
    description: String,
    exploitation: Option<String>,
    recommendation: Option<String>,
    code_snippet: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnalyzeBatchOutput {
    #[serde(default)]
    findings: Vec<AnalyzeBatchFinding>,
}

#[derive(Debug, Clone, Deserialize)]
struct SynthesizeOutput {
    executive_summary: String,
    security_posture: String,
    #[serde(default)]
    responsible_disclosure: Option<String>,
}

struct RepoContext {
    repo_id: Uuid,
    repo_name: String,
    local_path: PathBuf,
    head_sha: String,
    raw_files: Vec<crate::models::ScannedFile>,
}

pub struct AuditOrchestrator {
    pool: sqlx::PgPool,
    repo_store: Arc<RepoStore>,
    gateway: Arc<LlmGateway>,
    renderer: Arc<PromptRenderer>,
}

impl AuditOrchestrator {
    pub fn new(
        pool: sqlx::PgPool,
        repo_store: Arc<RepoStore>,
        gateway: Arc<LlmGateway>,
        renderer: Arc<PromptRenderer>,
    ) -> Self {
        Self {
            pool,
            repo_store,
            gateway,
            renderer,
        }
    }

    /// Run one audit end-to-end. Any unhandled error marks the audit
    /// `failed` with the accumulated cost rather than propagating, since
    /// this is expected to be spawned as a detached task per audit.
    pub async fn run_audit(&self, audit_id: Uuid, api_key: &str) {
        if let Err(e) = self.drive(audit_id, api_key).await {
            warn!("audit {audit_id} failed: {e}");
            let _ = audits_db::mark_failed(&self.pool, audit_id, &e.to_string()).await;
        }
    }

    async fn drive(&self, audit_id: Uuid, api_key: &str) -> Result<()> {
        let audit = audits_db::get_audit(&self.pool, audit_id).await?;
        let project = crate::db::projects::get_project(&self.pool, audit.project_id).await?;

        let clone_out = self.clone_phase(&audit, &project).await?;

        let mut files_to_analyze_override: Option<Vec<String>> = None;
        let mut warnings: Vec<String> = Vec::new();

        if let Some(base_audit_id) = audit.base_audit_id {
            let (override_files, inherit_warnings) =
                self.diff_and_inherit_phase(&audit, base_audit_id, &clone_out).await?;
            files_to_analyze_override = Some(override_files);
            warnings.extend(inherit_warnings);
        }

        if project.category.is_none() {
            audits_db::set_status(&self.pool, audit_id, AuditStatus::Classifying).await?;
            self.classify_phase(&audit, &project, &clone_out, api_key).await?;
        }
        let project = crate::db::projects::get_project(&self.pool, audit.project_id).await?;

        // Run the Component Agent once, right after a project first acquires
        // a classification, so later audits have component profiles to plan
        // and attribute against.
        let existing_components = components_db::list_components(&self.pool, project.id).await?;
        if existing_components.is_empty() {
            let repo_roots: HashMap<String, PathBuf> = clone_out
                .repos
                .iter()
                .map(|r| (r.repo_name.clone(), r.local_path.clone()))
                .collect();
            let repo_ids: HashMap<String, Uuid> = clone_out
                .repos
                .iter()
                .map(|r| (r.repo_name.clone(), r.repo_id))
                .collect();
            let scanned_files: HashMap<String, Vec<(String, i64)>> = clone_out
                .repos
                .iter()
                .map(|r| {
                    (
                        r.repo_name.clone(),
                        r.raw_files
                            .iter()
                            .map(|f| (f.relative_path.clone(), f.rough_tokens))
                            .collect(),
                    )
                })
                .collect();
            if let Err(e) = self
                .run_component_agent(
                    api_key,
                    project.id,
                    &project.name,
                    &repo_roots,
                    &repo_ids,
                    &scanned_files,
                )
                .await
            {
                warn!(
                    "component agent failed for project {}: {e}, continuing without components",
                    project.id
                );
            }
        }

        let components = match &audit.component_ids {
            Some(ids) if !ids.is_empty() => components_db::get_components(&self.pool, ids).await?,
            _ => components_db::list_components(&self.pool, project.id).await?,
        };

        let (selected_files, plan_warnings) = if audit.is_incremental {
            (files_to_analyze_override.unwrap_or_default(), Vec::new())
        } else {
            audits_db::set_status(&self.pool, audit_id, AuditStatus::Planning).await?;
            self.plan_phase(&audit, &project, &clone_out, &components, api_key).await?
        };
        warnings.extend(plan_warnings);

        let tokens_by_file: HashMap<String, i64> = clone_out
            .repos
            .iter()
            .flat_map(|r| {
                r.raw_files.iter().map(move |f| {
                    (namespaced_path(&r.repo_name, &f.relative_path), f.rough_tokens)
                })
            })
            .collect();
        let tokens_to_analyze: i64 = selected_files
            .iter()
            .map(|f| *tokens_by_file.get(f).unwrap_or(&0))
            .sum();
        audits_db::set_plan_totals(&self.pool, audit_id, selected_files.len() as i64, tokens_to_analyze)
            .await?;

        let mut progress = progress::init_analyzing(&selected_files);
        for w in &warnings {
            progress.warnings_mut().push(w.clone());
        }
        let bus = ProgressBus::new(&self.pool);
        bus.write(audit_id, &progress).await?;

        audits_db::set_status(&self.pool, audit_id, AuditStatus::Analyzing).await?;
        let (aborted, had_partial_failure) = self
            .analyze_phase(
                &audit,
                &project,
                &clone_out,
                &selected_files,
                &tokens_by_file,
                &mut progress,
                api_key,
                audit.base_audit_id,
            )
            .await?;

        if aborted {
            return Ok(());
        }

        if let Some(ids) = &audit.component_ids {
            if !ids.is_empty() {
                self.attribute_phase(audit_id, &components, &clone_out, &progress).await?;
            }
        }

        let done = progress::to_done(progress.clone());
        bus.write(audit_id, &done).await?;

        audits_db::set_status(&self.pool, audit_id, AuditStatus::Synthesizing).await?;
        self.synthesize_phase(&audit, &project, api_key, had_partial_failure).await?;

        Ok(())
    }

    // -- Phase 0: Clone ------------------------------------------------

    async fn clone_phase(&self, audit: &Audit, project: &crate::models::Project) -> Result<CloneOutput> {
        let repos = crate::db::projects::list_project_repos(&self.pool, project.id).await?;
        let total = repos.len();
        let mut contexts = Vec::with_capacity(total);
        let mut warnings = Vec::new();
        let bus = ProgressBus::new(&self.pool);

        let shallow_since = if audit.is_incremental {
            audit.base_audit_id
        } else {
            None
        };

        for (idx, (repo, branch)) in repos.iter().enumerate() {
            bus.write(
                audit.id,
                &ProgressDetail::Cloning {
                    current: idx as i64,
                    total: total as i64,
                    repo_name: repo.repo_name.clone(),
                    warnings: warnings.clone(),
                },
            )
            .await?;

            let since = match shallow_since {
                Some(base_audit_id) => {
                    self.resolve_shallow_since(base_audit_id, repo.id, &repo.repo_url)
                        .await
                }
                None => None,
            };
            if audit.is_incremental && since.is_none() {
                warnings.push(format!(
                    "{}: could not resolve shallow-since date, falling back to full clone",
                    repo.repo_name
                ));
            }

            let clone_result = self
                .repo_store
                .clone_or_update(&repo.repo_url, branch.as_deref(), since.as_deref())
                .await?;

            let raw_files = self.repo_store.scan_code_files(&clone_result.local_path)?;

            audits_db::upsert_commit(
                &self.pool,
                audit.id,
                repo.id,
                &clone_result.head_sha,
                branch.as_deref().unwrap_or(""),
            )
            .await?;

            contexts.push(RepoContext {
                repo_id: repo.id,
                repo_name: repo.repo_name.clone(),
                local_path: clone_result.local_path,
                head_sha: clone_result.head_sha,
                raw_files,
            });
        }

        bus.write(
            audit.id,
            &ProgressDetail::Cloning {
                current: total as i64,
                total: total as i64,
                repo_name: String::new(),
                warnings: warnings.clone(),
            },
        )
        .await?;

        let mut all_namespaced: Vec<(String, i64)> = contexts
            .iter()
            .flat_map(|c| {
                c.raw_files
                    .iter()
                    .map(move |f| (namespaced_path(&c.repo_name, &f.relative_path), f.rough_tokens))
            })
            .collect();

        if let Some(ids) = &audit.component_ids {
            if !ids.is_empty() {
                let components = components_db::get_components(&self.pool, ids).await?;
                let repo_names: HashMap<Uuid, String> =
                    contexts.iter().map(|c| (c.repo_id, c.repo_name.clone())).collect();
                let compiled = compile_component_patterns(&components, &repo_names);
                all_namespaced.retain(|(path, _)| attribute_component(path, &compiled).is_some());
            }
        }

        let total_files = all_namespaced.len() as i64;
        let total_tokens: i64 = all_namespaced.iter().map(|(_, t)| *t).sum();
        audits_db::set_totals(&self.pool, audit.id, total_files, total_tokens).await?;

        Ok(CloneOutput {
            repos: contexts,
            namespaced_files: all_namespaced,
            warnings,
        })
    }

    /// Best-effort lookup of the base audit's commit date for this repo,
    /// used as the `--shallow-since` cutoff (`--shallow-since` takes a date,
    /// not a commit SHA). Requires the repo's prior checkout to still be on
    /// disk and contain the base commit. Any failure degrades to a full
    /// clone (the caller treats `None` that way).
    async fn resolve_shallow_since(
        &self,
        base_audit_id: Uuid,
        repo_id: Uuid,
        repo_url: &str,
    ) -> Option<String> {
        let commits = audits_db::get_commits(&self.pool, base_audit_id).await.ok()?;
        let commit = commits.into_iter().find(|c| c.repo_id == repo_id)?;
        let local_path = self.repo_store.local_path_for(repo_url).ok()?;
        self.repo_store
            .commit_date(&local_path, &commit.commit_sha)
            .await
            .ok()
    }

    // -- Phase 1: Incremental diff & inheritance ------------------------

    async fn diff_and_inherit_phase(
        &self,
        audit: &Audit,
        base_audit_id: Uuid,
        clone_out: &CloneOutput,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let base_commits = audits_db::get_commits(&self.pool, base_audit_id).await?;
        let base_findings = findings_db::list_open_findings(&self.pool, base_audit_id).await?;

        let mut override_files = Vec::new();
        let mut warnings = Vec::new();
        let mut combined_diff = DiffResult::default();

        for repo in &clone_out.repos {
            let base_commit = base_commits.iter().find(|c| c.repo_id == repo.repo_id);
            let diff = match base_commit {
                Some(commit) => {
                    let d = self
                        .repo_store
                        .diff_between_commits(&repo.local_path, &commit.commit_sha, &repo.head_sha)
                        .await;
                    if d.is_fallback {
                        warnings.push(format!(
                            "{}: diff unavailable, treating all files as added",
                            repo.repo_name
                        ));
                    }
                    namespace_diff(&repo.repo_name, d)
                }
                // A repo new to this audit is treated as wholly added.
                None => all_as_added(&repo.repo_name, &repo.raw_files),
            };

            audits_db::set_diff_counts(
                &self.pool,
                audit.id,
                diff.added.len() as i64,
                diff.modified.len() as i64,
                diff.deleted.len() as i64,
            )
            .await?;

            override_files.extend(files_to_analyze_from_diff(&diff));
            combined_diff.added.extend(diff.added);
            combined_diff.modified.extend(diff.modified);
            combined_diff.deleted.extend(diff.deleted);
            combined_diff.renamed.extend(diff.renamed);
        }

        let existing = findings_db::existing_fingerprints(&self.pool, audit.id).await?;
        let outcome = inherit_findings(&base_findings, &combined_diff, audit.id, &existing);

        for base_id in &outcome.base_resolutions {
            findings_db::set_resolved_in(&self.pool, *base_id, audit.id).await?;
        }
        findings_db::insert_findings(&self.pool, audit.id, outcome.findings_to_insert).await?;

        Ok((override_files, warnings))
    }

    // -- Phase 2: Classify ----------------------------------------------

    async fn classify_phase(
        &self,
        audit: &Audit,
        project: &crate::models::Project,
        clone_out: &CloneOutput,
        api_key: &str,
    ) -> Result<()> {
        let repo_context = clone_out
            .repos
            .iter()
            .map(|r| {
                format!(
                    "# {}\n{}",
                    r.repo_name,
                    r.raw_files.iter().map(|f| f.relative_path.clone()).collect::<Vec<_>>().join("\n")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut vars = HashMap::new();
        vars.insert("project_name".to_string(), project.name.clone());
        vars.insert("github_org".to_string(), project.github_org.clone());
        vars.insert("repo_context".to_string(), repo_context);

        let prompt = self.renderer.load_and_render("classify", &vars)?;
        let response = self
            .gateway
            .call(api_key, "security audit classifier; return JSON only", &prompt, None, None)
            .await?;

        let parsed: ClassifyOutput = parse_json(&response.content)?;
        let source = if parsed.threat_model_source == "generated" {
            crate::models::ThreatModelSource::Generated
        } else {
            crate::models::ThreatModelSource::Repo
        };

        let threat_model_json = serde_json::json!({
            "parties": parsed.threat_model.parties,
            "summary": parsed.threat_model.summary,
        });
        let threat_model_files: Vec<String> = clone_out.repos.iter().map(|r| r.repo_name.clone()).collect();

        crate::db::projects::set_classification(
            &self.pool,
            project.id,
            &parsed.category,
            &parsed.description,
            &parsed.involved_parties,
            &threat_model_json,
            source,
            &threat_model_files,
            audit.id,
        )
        .await?;

        audits_db::add_cost(&self.pool, audit.id, CLASSIFICATION_COST_USD).await?;
        Ok(())
    }

    // -- Phase 3: Plan ----------------------------------------------------

    async fn plan_phase(
        &self,
        audit: &Audit,
        project: &crate::models::Project,
        clone_out: &CloneOutput,
        components: &[Component],
        api_key: &str,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let planner = Planner::new(&self.gateway, &self.renderer);

        let mut grep_results = Vec::new();
        let mut candidates = Vec::new();

        for repo in &clone_out.repos {
            let repo_candidates: Vec<CandidateFile> = repo
                .raw_files
                .iter()
                .map(|f| CandidateFile {
                    relative_path: f.relative_path.clone(),
                    rough_tokens: f.rough_tokens,
                })
                .collect();

            let repo_grep = planner.grep_phase(&repo.local_path, &repo_candidates);
            for mut g in repo_grep {
                g.file = namespaced_path(&repo.repo_name, &g.file);
                grep_results.push(g);
            }

            for f in &repo.raw_files {
                candidates.push(CandidateFile {
                    relative_path: namespaced_path(&repo.repo_name, &f.relative_path),
                    rough_tokens: f.rough_tokens,
                });
            }
        }
        grep_results.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));

        let component_profiles = components
            .iter()
            .map(|c| format!("{} ({}): {}", c.name, c.role.as_str(), c.description))
            .collect::<Vec<_>>()
            .join("\n");

        let category = project.category.clone().unwrap_or_default();
        let description = project.description.clone().unwrap_or_default();
        let threat_model = project
            .threat_model
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();

        let ranked = planner
            .rank_files(
                api_key,
                &category,
                &description,
                &threat_model,
                &component_profiles,
                &grep_results,
                &candidates,
            )
            .await?;

        let tokens_by_file: HashMap<String, i64> = candidates
            .iter()
            .map(|c| (c.relative_path.clone(), c.rough_tokens))
            .collect();
        let total_tokens: i64 = candidates.iter().map(|c| c.rough_tokens).sum();

        let mut warnings = Vec::new();
        let selected = if ranked.is_empty() {
            warnings.push("planner returned zero ranked files; used pattern-based fallback selection".to_string());
            let all_paths: Vec<String> = candidates.iter().map(|c| c.relative_path.clone()).collect();
            pattern_fallback_select(&all_paths, audit.level.budget_pct())
        } else {
            Planner::select_within_budget(audit.level, &ranked, &tokens_by_file, total_tokens)
        };

        Ok((selected, warnings))
    }

    // -- Phase 4: Batch & analyze -----------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn analyze_phase(
        &self,
        audit: &Audit,
        project: &crate::models::Project,
        clone_out: &CloneOutput,
        selected_files: &[String],
        tokens_by_file: &HashMap<String, i64>,
        progress: &mut ProgressDetail,
        api_key: &str,
        base_audit_id: Option<Uuid>,
    ) -> Result<(bool, bool)> {
        let mut had_partial_failure = false;
        let base_findings = match base_audit_id {
            Some(id) => findings_db::list_open_findings(&self.pool, id).await?,
            None => Vec::new(),
        };
        let mut sorted = selected_files.to_vec();
        sorted.sort();
        let pairs: Vec<(String, i64)> = sorted
            .iter()
            .map(|f| (f.clone(), *tokens_by_file.get(f).unwrap_or(&0)))
            .collect();
        let batches = pack_batches(&pairs, ANALYSIS_BATCH_TOKEN_CAP);

        let local_paths: HashMap<String, PathBuf> = clone_out
            .repos
            .iter()
            .map(|r| (r.repo_name.clone(), r.local_path.clone()))
            .collect();

        let level_prompt_name = match audit.level {
            AuditLevel::Full => "level_full",
            AuditLevel::Thorough => "level_thorough",
            AuditLevel::Opportunistic => "level_opportunistic",
        };
        let level_prompt = self.renderer.load(level_prompt_name)?;

        let mut vars = HashMap::new();
        vars.insert("category".to_string(), project.category.clone().unwrap_or_default());
        vars.insert("description".to_string(), project.description.clone().unwrap_or_default());
        let classify_prompt = self.renderer.load_and_render("classify", &vars);
        let system_prompt = match classify_prompt {
            Ok(p) => format!("{p}\n\n{level_prompt}"),
            Err(_) => level_prompt,
        };

        let existing_fingerprints = findings_db::existing_fingerprints(&self.pool, audit.id).await?;
        let mut seen_fingerprints = existing_fingerprints;
        let bus = ProgressBus::new(&self.pool);
        let mut files_analyzed: i64 = 0;

        for (batch_idx, batch) in batches.iter().enumerate() {
            let files_block = batch
                .iter()
                .filter_map(|f| {
                    let (repo_name, rel) = split_namespaced(f)?;
                    let root = local_paths.get(repo_name)?;
                    let content = self.repo_store.read_file_content(root, rel).ok()?;
                    Some(format!("--- {f} ---\n{content}"))
                })
                .collect::<Vec<_>>()
                .join("\n\n");

            let mut analyze_vars = HashMap::new();
            analyze_vars.insert("description".to_string(), project.description.clone().unwrap_or_default());
            analyze_vars.insert("category".to_string(), project.category.clone().unwrap_or_default());
            analyze_vars.insert("files_block".to_string(), files_block);
            analyze_vars.insert(
                "previous_findings".to_string(),
                previous_findings_block(&base_findings, batch),
            );
            let user_prompt = self.renderer.load_and_render("analyze_batch", &analyze_vars)?;

            let response = self
                .gateway
                .call(api_key, &system_prompt, &user_prompt, None, None)
                .await;
            let result = match response {
                Ok(r) => {
                    let cost = self.estimate_call_cost(r.input_tokens, r.output_tokens).await;
                    parse_json::<AnalyzeBatchOutput>(&r.content).map(|o| (o, cost))
                }
                Err(e) => Err(e),
            };

            match result {
                Ok((output, cost)) => {
                    audits_db::add_cost(&self.pool, audit.id, cost.cost_usd).await?;

                    let mut to_insert = Vec::new();
                    for f in output.findings {
                        let severity: Severity = f.severity.parse().unwrap_or(Severity::Informational);
                        let fingerprint = findings_db::fingerprint(
                            &f.file,
                            f.line_start,
                            f.line_end,
                            &f.title,
                            f.code_snippet.as_deref().unwrap_or(""),
                        );
                        if !seen_fingerprints.insert(fingerprint.clone()) {
                            continue;
                        }
                        to_insert.push(Finding {
                            id: Uuid::new_v4(),
                            audit_id: audit.id,
                            component_id: None,
                            file_path: f.file,
                            line_start: f.line_start,
                            line_end: f.line_end,
                            severity,
                            cwe_id: f.cwe_id,
                            cvss_score: f.cvss_score,
                            title: f.title,
                            description: f.description,
                            exploitation: f.exploitation,
                            recommendation: f.recommendation,
                            code_snippet: f.code_snippet,
                            status: FindingStatus::Open,
                            fingerprint,
                            resolved_in_audit_id: None,
                        });
                    }

                    let mut counts: HashMap<String, i64> = HashMap::new();
                    for f in &to_insert {
                        *counts.entry(f.file_path.clone()).or_insert(0) += 1;
                    }
                    findings_db::insert_findings(&self.pool, audit.id, to_insert).await?;

                    if let ProgressDetail::Analyzing { files, .. } = progress {
                        for path in batch {
                            let count = counts.get(path).copied().unwrap_or(0);
                            progress::mark_file(
                                files,
                                path,
                                crate::models::FileProgressStatus::Done,
                                count,
                            );
                        }
                    }
                    files_analyzed += batch.len() as i64;
                    bus.write_with_files_analyzed(audit.id, progress, files_analyzed).await?;
                }
                Err(e) => {
                    if let ProgressDetail::Analyzing { files, .. } = progress {
                        for path in batch {
                            progress::mark_file(files, path, crate::models::FileProgressStatus::Error, 0);
                        }
                    }
                    bus.write_with_files_analyzed(audit.id, progress, files_analyzed).await?;

                    if batch_idx == 0 {
                        // RULE-13: the first batch failing aborts the whole
                        // audit; partial results from a half-analyzed audit
                        // are not trustworthy enough to report.
                        audits_db::mark_failed(
                            &self.pool,
                            audit.id,
                            &format!(
                                "first analysis batch failed, aborting for partial-results safety: {e}"
                            ),
                        )
                        .await?;
                        return Ok((true, true));
                    }
                    warn!("analysis batch {batch_idx} failed: {e}, continuing with remaining batches");
                    let msg = format!("analysis batch {batch_idx} failed and was skipped: {e}");
                    if let ProgressDetail::Analyzing { warnings, .. } = progress {
                        warnings.push(msg);
                    }
                    had_partial_failure = true;
                }
            }
        }

        Ok((false, had_partial_failure))
    }

    async fn estimate_call_cost(&self, input_tokens: i64, output_tokens: i64) -> CostEstimate {
        // Precise usage is already known from the response; skip the
        // overhead/ratio estimate formula (that's for pre-call budgeting)
        // and price the actual tokens against the model's pricing row,
        // falling back to the hardcoded rate if it has none.
        let accountant = crate::token_accountant::TokenAccountant::new(self.pool.clone());
        let pricing = accountant.pricing_for(crate::llm_gateway::DEFAULT_MODEL).await;
        let cost = input_tokens as f64 / 1_000_000.0 * pricing.input_cost_per_mtok
            + output_tokens as f64 / 1_000_000.0 * pricing.output_cost_per_mtok;
        CostEstimate {
            input_tokens,
            output_tokens,
            cost_usd: (cost * 10_000.0).round() / 10_000.0,
            is_precise: true,
        }
    }

    // -- Phase 5: Attribute to components ---------------------------------

    async fn attribute_phase(
        &self,
        audit_id: Uuid,
        components: &[Component],
        clone_out: &CloneOutput,
        progress: &ProgressDetail,
    ) -> Result<()> {
        let repo_names: HashMap<Uuid, String> =
            clone_out.repos.iter().map(|r| (r.repo_id, r.repo_name.clone())).collect();
        let compiled = compile_component_patterns(components, &repo_names);

        let findings = findings_db::list_findings(&self.pool, audit_id).await?;
        let tokens_by_file: HashMap<String, i64> = clone_out
            .namespaced_files
            .iter()
            .cloned()
            .collect();

        let analyzed_files: HashSet<&str> = match progress {
            ProgressDetail::Analyzing { files, .. } | ProgressDetail::Done { files, .. } => {
                files.iter().map(|f| f.file.as_str()).collect()
            }
            _ => HashSet::new(),
        };

        let mut component_findings: HashMap<Uuid, i64> = HashMap::new();
        for f in &findings {
            if let Some(component_id) = attribute_component(&f.file_path, &compiled) {
                *component_findings.entry(component_id).or_insert(0) += 1;
                if f.component_id != Some(component_id) {
                    findings_db::set_component(&self.pool, f.id, component_id).await?;
                }
            }
        }

        for c in &compiled {
            let tokens: i64 = analyzed_files
                .iter()
                .filter(|f| c.patterns.iter().any(|p| p.matches(f)))
                .map(|f| *tokens_by_file.get(*f).unwrap_or(&0))
                .sum();
            let count = component_findings.get(&c.component_id).copied().unwrap_or(0);
            components_db::upsert_audit_component(&self.pool, audit_id, c.component_id, tokens, count)
                .await?;
        }

        Ok(())
    }

    // -- Phase 6: Synthesize -----------------------------------------------

    async fn synthesize_phase(
        &self,
        audit: &Audit,
        project: &crate::models::Project,
        api_key: &str,
        had_partial_failure: bool,
    ) -> Result<()> {
        let findings = findings_db::list_findings(&self.pool, audit.id).await?;
        let summary_block = findings_summary(&findings);
        let severity = max_severity(&findings);

        let mut vars = HashMap::new();
        vars.insert("description".to_string(), project.description.clone().unwrap_or_default());
        vars.insert("category".to_string(), project.category.clone().unwrap_or_default());
        vars.insert("total_findings".to_string(), findings.len().to_string());
        vars.insert("findings_summary".to_string(), summary_block);

        let synth_result: Result<(SynthesizeOutput, CostEstimate)> = async {
            let prompt = self.renderer.load_and_render("synthesize", &vars)?;
            let response = self
                .gateway
                .call(api_key, "security audit report writer; return JSON only", &prompt, None, None)
                .await?;
            let cost = self.estimate_call_cost(response.input_tokens, response.output_tokens).await;
            let parsed: SynthesizeOutput = parse_json(&response.content)?;
            Ok::<_, AuditError>((parsed, cost))
        }
        .await;

        let mut severity_counts: HashMap<String, i64> = HashMap::new();
        for f in &findings {
            *severity_counts.entry(f.severity.as_str().to_string()).or_insert(0) += 1;
        }

        match synth_result {
            Ok((parsed, cost)) => {
                audits_db::add_cost(&self.pool, audit.id, cost.cost_usd).await?;
                let report = ReportSummary {
                    executive_summary: parsed.executive_summary,
                    security_posture: parsed.security_posture,
                    responsible_disclosure: parsed.responsible_disclosure,
                    severity_counts,
                };
                // A batch skipped earlier in analysis means the findings set
                // is incomplete even though synthesis itself succeeded; the
                // audit is still reportable but not a clean completion.
                let status = if had_partial_failure {
                    AuditStatus::CompletedWithWarnings
                } else {
                    AuditStatus::Completed
                };
                audits_db::mark_completed(&self.pool, audit.id, status, &report, severity)
                    .await?;
            }
            Err(e) => {
                warn!(
                    "synthesis failed for audit {}: {e}; findings are already valid, demoting to completed_with_warnings",
                    audit.id
                );
                let report = ReportSummary {
                    executive_summary: String::new(),
                    security_posture: String::new(),
                    responsible_disclosure: None,
                    severity_counts,
                };
                audits_db::mark_completed(
                    &self.pool,
                    audit.id,
                    AuditStatus::CompletedWithWarnings,
                    &report,
                    severity,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Run the Component Agent (C7) for a project, e.g. right after its
    /// first successful classification. Not itself one of the five audit
    /// phases; triggered by callers that hold a project with no components
    /// yet.
    pub async fn run_component_agent(
        &self,
        api_key: &str,
        project_id: Uuid,
        project_name: &str,
        repo_roots: &HashMap<String, PathBuf>,
        repo_ids: &HashMap<String, Uuid>,
        scanned_files: &HashMap<String, Vec<(String, i64)>>,
    ) -> Result<()> {
        let agent = ComponentAgent::new(&self.gateway, &self.renderer, &self.repo_store, &self.pool);
        agent
            .run(api_key, project_id, project_name, repo_roots, repo_ids, scanned_files)
            .await?;
        Ok(())
    }
}

fn all_as_added(repo_name: &str, files: &[crate::models::ScannedFile]) -> DiffResult {
    DiffResult {
        added: files.iter().map(|f| namespaced_path(repo_name, &f.relative_path)).collect(),
        is_fallback: true,
        ..Default::default()
    }
}

pub struct CloneOutput {
    repos: Vec<RepoContext>,
    pub namespaced_files: Vec<(String, i64)>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FindingStatus;

    fn finding(id: u128, path: &str, line: i64, title: &str) -> Finding {
        Finding {
            id: Uuid::from_u128(id),
            audit_id: Uuid::nil(),
            component_id: None,
            file_path: path.to_string(),
            line_start: line,
            line_end: line + 2,
            severity: Severity::High,
            cwe_id: None,
            cvss_score: None,
            title: title.to_string(),
            description: "d".to_string(),
            exploitation: None,
            recommendation: None,
            code_snippet: Some("snippet".to_string()),
            status: FindingStatus::Open,
            fingerprint: String::new(),
            resolved_in_audit_id: None,
        }
    }

    #[test]
    fn namespacing_round_trips() {
        let p = namespaced_path("backend", "src/main.rs");
        assert_eq!(p, "backend/src/main.rs");
        assert_eq!(split_namespaced(&p), Some(("backend", "src/main.rs")));
    }

    #[test]
    fn files_to_analyze_is_added_modified_and_renamed_to() {
        let diff = DiffResult {
            added: vec!["svc/d.ts".to_string()],
            modified: vec!["svc/a.ts".to_string()],
            deleted: vec!["svc/b.ts".to_string()],
            renamed: vec![("svc/c.ts".to_string(), "svc/c2.ts".to_string())],
            is_fallback: false,
        };
        let mut files = files_to_analyze_from_diff(&diff);
        files.sort();
        assert_eq!(files, vec!["svc/a.ts", "svc/c2.ts", "svc/d.ts"]);
    }

    #[test]
    fn inherit_marks_deleted_file_findings_fixed_and_resolved() {
        let base = vec![finding(1, "svc/b.ts", 5, "XSS")];
        let diff = DiffResult {
            deleted: vec!["svc/b.ts".to_string()],
            ..Default::default()
        };
        let new_audit_id = Uuid::from_u128(999);
        let outcome = inherit_findings(&base, &diff, new_audit_id, &HashSet::new());

        assert_eq!(outcome.findings_to_insert.len(), 1);
        assert_eq!(outcome.findings_to_insert[0].status, FindingStatus::Fixed);
        assert_eq!(outcome.findings_to_insert[0].file_path, "svc/b.ts");
        assert_eq!(outcome.base_resolutions, vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn inherit_repaths_renamed_file_findings_and_preserves_status() {
        let base = vec![finding(2, "svc/c.ts", 8, "SSRF")];
        let diff = DiffResult {
            renamed: vec![("svc/c.ts".to_string(), "svc/c2.ts".to_string())],
            ..Default::default()
        };
        let outcome = inherit_findings(&base, &diff, Uuid::from_u128(999), &HashSet::new());

        assert_eq!(outcome.findings_to_insert[0].file_path, "svc/c2.ts");
        assert_eq!(outcome.findings_to_insert[0].status, FindingStatus::Open);
        assert!(outcome.base_resolutions.is_empty());
    }

    #[test]
    fn inherit_skips_findings_whose_fingerprint_already_exists() {
        let base = vec![finding(3, "svc/a.ts", 1, "IDOR")];
        let fp = findings_db::fingerprint("svc/a.ts", 1, 3, "IDOR", "snippet");
        let mut existing = HashSet::new();
        existing.insert(fp);

        let outcome = inherit_findings(&base, &DiffResult::default(), Uuid::from_u128(1), &existing);
        assert!(outcome.findings_to_insert.is_empty());
    }

    #[test]
    fn pack_batches_respects_token_cap_and_isolates_oversized_file() {
        let files = vec![
            ("a.rs".to_string(), 60_000),
            ("b.rs".to_string(), 60_000),
            ("c.rs".to_string(), 60_000),
            ("huge.rs".to_string(), 200_000),
            ("d.rs".to_string(), 10_000),
        ];
        let batches = pack_batches(&files, 150_000);
        assert_eq!(batches[0], vec!["a.rs", "b.rs"]);
        assert_eq!(batches[1], vec!["c.rs"]);
        assert_eq!(batches[2], vec!["huge.rs"]);
        assert_eq!(batches[3], vec!["d.rs"]);
    }

    #[test]
    fn attribute_component_returns_first_matching_pattern() {
        let compiled = vec![
            ComponentPatterns {
                component_id: Uuid::from_u128(1),
                patterns: vec![glob::Pattern::new("backend/**").unwrap()],
            },
            ComponentPatterns {
                component_id: Uuid::from_u128(2),
                patterns: vec![glob::Pattern::new("*/*.ts").unwrap()],
            },
        ];
        assert_eq!(
            attribute_component("backend/src/main.rs", &compiled),
            Some(Uuid::from_u128(1))
        );
        assert_eq!(
            attribute_component("frontend/app.ts", &compiled),
            Some(Uuid::from_u128(2))
        );
        assert_eq!(attribute_component("unmatched/readme.md", &compiled), None);
    }

    #[test]
    fn max_severity_picks_the_highest() {
        let findings = vec![
            finding(1, "a", 1, "t1"),
            Finding { severity: Severity::Critical, ..finding(2, "b", 1, "t2") },
            Finding { severity: Severity::Low, ..finding(3, "c", 1, "t3") },
        ];
        assert_eq!(max_severity(&findings), Some(Severity::Critical));
        assert_eq!(max_severity(&[]), None);
    }

    #[test]
    fn previous_findings_block_includes_only_batch_files() {
        let base = vec![
            finding(1, "svc/a.ts", 10, "sql injection"),
            finding(2, "svc/b.ts", 20, "unrelated"),
        ];
        let block = previous_findings_block(&base, &["svc/a.ts".to_string()]);
        assert!(block.contains("sql injection"));
        assert!(!block.contains("unrelated"));
    }

    #[test]
    fn previous_findings_block_empty_when_no_overlap() {
        let base = vec![finding(1, "svc/a.ts", 10, "sql injection")];
        let block = previous_findings_block(&base, &["svc/other.ts".to_string()]);
        assert_eq!(block, "");
    }

    #[test]
    fn pattern_fallback_select_prioritizes_security_named_paths() {
        let files = vec![
            "src/auth/login.rs".to_string(),
            "src/utils/format.rs".to_string(),
            "src/crypto/cipher.rs".to_string(),
            "README.md".to_string(),
        ];
        let selected = pattern_fallback_select(&files, 0.5);
        assert_eq!(selected.len(), 2);
        assert!(selected.contains(&"src/auth/login.rs".to_string()));
        assert!(selected.contains(&"src/crypto/cipher.rs".to_string()));
    }
}

//! Team artifact collection.
//!
//! Snapshots every member of a team session into a fresh timestamped
//! directory: per-instance metadata, the latest pane capture, and a filtered
//! mirror of the workspace. Collection never modifies a source file and never
//! reuses a directory, so repeated invocations are always disjoint.
//!
//! ```text
//! {ARTIFACTS_DIR}/{YYYY-MM-DD_HH-MM-SS}-{team_id}/
//!   metadata.json
//!   summary.md
//!   instances/{instance_id}/
//!     metadata.json
//!     output.log            (output.log.zst when compression is on)
//!     workspace/...
//! ```

use chrono::{NaiveDateTime, Utc};
use globset::GlobSet;
use madrox_core::{Config, InstanceRecord, InstanceState, ToolError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Timestamp prefix format for artifact directory names.
const DIR_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";
/// Upper bound on collision suffixes before giving up.
const MAX_COLLISION_SUFFIX: u32 = 100;
/// zstd level for compressed pane captures.
const ZSTD_LEVEL: i32 = 3;

pub struct ArtifactCollector {
    artifacts_dir: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    include_is_empty: bool,
    compress: bool,
    retention_days: Option<u32>,
}

impl ArtifactCollector {
    pub fn new(config: &Config) -> Self {
        // Patterns were validated at startup; an empty set here only happens
        // if the env changed mid-run, and empty means match-all anyway.
        let include = config.include_set().unwrap_or_else(|_| GlobSet::empty());
        let exclude = config.exclude_set().unwrap_or_else(|_| GlobSet::empty());
        Self {
            artifacts_dir: config.artifacts_dir.clone(),
            include_is_empty: config.artifacts_include.is_empty(),
            include,
            exclude,
            compress: config.artifacts_compress,
            retention_days: config.artifacts_retention_days,
        }
    }

    /// Collect artifacts for one team session.
    ///
    /// A member whose workspace cannot be read produces a `status: "error"`
    /// entry; the rest proceed. `all_completed` in the summary reflects both
    /// collection errors and members that never reached `terminated`.
    pub fn collect(
        &self,
        team_session_id: &str,
        members: &[InstanceRecord],
        captures: &HashMap<String, String>,
    ) -> Result<Value, ToolError> {
        let team_dir = self.create_team_dir(team_session_id)?;
        let instances_dir = team_dir.join("instances");
        fs::create_dir_all(&instances_dir)
            .map_err(|e| ToolError::io(format!("cannot create instances dir: {e}")))?;

        let mut entries = Vec::with_capacity(members.len());
        let mut errors: Vec<Value> = Vec::new();
        for member in members {
            let inst_dir = instances_dir.join(&member.id);
            match self.collect_instance(member, captures.get(&member.id), &inst_dir) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("artifact collection failed for '{}': {e}", member.id);
                    errors.push(json!({"instance_id": member.id, "error": e.to_string()}));
                    entries.push(json!({
                        "instance_id": member.id,
                        "name": member.name,
                        "status": "error",
                        "error": e.to_string(),
                    }));
                }
            }
        }

        let summary = execution_summary(members, &errors);
        let metadata = json!({
            "team_session_id": team_session_id,
            "collected_at": Utc::now().to_rfc3339(),
            "instances": entries,
            "execution_summary": summary,
        });
        write_json(&team_dir.join("metadata.json"), &metadata)?;
        fs::write(
            team_dir.join("summary.md"),
            render_summary(team_session_id, members, &summary),
        )
        .map_err(|e| ToolError::io(format!("cannot write summary.md: {e}")))?;

        let swept = self.sweep_expired();

        Ok(json!({
            "status": "success",
            "team_session_id": team_session_id,
            "artifacts_path": team_dir.to_string_lossy(),
            "instances_count": members.len(),
            "execution_summary": summary,
            "retention_swept": swept,
        }))
    }

    /// Create the timestamped team directory, adding a numeric suffix on
    /// collision rather than ever reusing an existing directory.
    fn create_team_dir(&self, team_session_id: &str) -> Result<PathBuf, ToolError> {
        fs::create_dir_all(&self.artifacts_dir)
            .map_err(|e| ToolError::io(format!("cannot create artifacts root: {e}")))?;
        let stamp = Utc::now().format(DIR_TIMESTAMP);
        let base = format!("{stamp}-{team_session_id}");
        for suffix in 0..MAX_COLLISION_SUFFIX {
            let name = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}-{}", suffix + 1)
            };
            let candidate = self.artifacts_dir.join(&name);
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ToolError::io(format!(
                        "cannot create artifact dir '{name}': {e}"
                    )))
                }
            }
        }
        Err(ToolError::io(format!(
            "exhausted collision suffixes for '{base}'"
        )))
    }

    fn collect_instance(
        &self,
        member: &InstanceRecord,
        capture: Option<&String>,
        inst_dir: &Path,
    ) -> Result<Value, ToolError> {
        fs::create_dir_all(inst_dir)
            .map_err(|e| ToolError::io(format!("cannot create instance dir: {e}")))?;

        let metadata = serde_json::to_value(member)
            .map_err(|e| ToolError::internal(e.to_string()))?;
        write_json(&inst_dir.join("metadata.json"), &metadata)?;

        if let Some(pane) = capture {
            if self.compress {
                let compressed = zstd::encode_all(pane.as_bytes(), ZSTD_LEVEL)
                    .map_err(|e| ToolError::io(format!("zstd encode failed: {e}")))?;
                fs::write(inst_dir.join("output.log.zst"), compressed)
                    .map_err(|e| ToolError::io(format!("cannot write output.log.zst: {e}")))?;
            } else {
                fs::write(inst_dir.join("output.log"), pane)
                    .map_err(|e| ToolError::io(format!("cannot write output.log: {e}")))?;
            }
        }

        let copied = self.mirror_workspace(&member.workspace_path, &inst_dir.join("workspace"))?;
        Ok(json!({
            "instance_id": member.id,
            "name": member.name,
            "role": member.role.as_str(),
            "kind": member.kind.as_str(),
            "model": member.model,
            "parent_id": member.parent_id,
            "state": member.state.as_str(),
            "request_count": member.counters.request_count,
            "tokens_used": member.counters.tokens_used,
            "cost": member.counters.cost,
            "tools_executed": member.counters.tools_executed,
            "created_at": member.created_at.to_rfc3339(),
            "terminated_at": member.terminated_at.map(|t| t.to_rfc3339()),
            "files_copied": copied,
            "status": "success",
        }))
    }

    /// Read-only mirror of a workspace, honouring include/exclude globs
    /// (matched against paths relative to the workspace root).
    fn mirror_workspace(&self, source: &Path, dest: &Path) -> Result<u64, ToolError> {
        if !source.exists() {
            return Err(ToolError::io(format!(
                "workspace '{}' does not exist",
                source.display()
            )));
        }
        let mut copied = 0u64;
        for entry in walkdir::WalkDir::new(source) {
            let entry = entry.map_err(|e| ToolError::io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| ToolError::internal(e.to_string()))?;
            if self.exclude.is_match(rel) {
                debug!("excluded from artifacts: {}", rel.display());
                continue;
            }
            if !self.include_is_empty && !self.include.is_match(rel) {
                continue;
            }
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ToolError::io(format!("cannot mirror workspace: {e}")))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| ToolError::io(format!("cannot copy '{}': {e}", rel.display())))?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Delete artifact directories older than the retention horizon.
    /// Best-effort: unparseable names and delete failures are skipped.
    fn sweep_expired(&self) -> u64 {
        let Some(days) = self.retention_days else {
            return 0;
        };
        let horizon = Utc::now() - chrono::Duration::days(i64::from(days));
        let Ok(entries) = fs::read_dir(&self.artifacts_dir) else {
            return 0;
        };
        let mut swept = 0u64;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stamp) = name.get(..19) else {
                continue;
            };
            let Ok(parsed) = NaiveDateTime::parse_from_str(stamp, DIR_TIMESTAMP) else {
                continue;
            };
            if parsed.and_utc() < horizon {
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => {
                        debug!("retention sweep removed '{name}'");
                        swept += 1;
                    }
                    Err(e) => warn!("retention sweep failed for '{name}': {e}"),
                }
            }
        }
        swept
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), ToolError> {
    let pretty =
        serde_json::to_string_pretty(value).map_err(|e| ToolError::internal(e.to_string()))?;
    fs::write(path, pretty)
        .map_err(|e| ToolError::io(format!("cannot write '{}': {e}", path.display())))
}

fn execution_summary(members: &[InstanceRecord], errors: &[Value]) -> Value {
    let total_tokens: u64 = members.iter().map(|m| m.counters.tokens_used).sum();
    let total_cost: f64 = members.iter().map(|m| m.counters.cost).sum();
    let started = members.iter().map(|m| m.created_at).min();
    let ended = members
        .iter()
        .map(|m| m.terminated_at.unwrap_or_else(Utc::now))
        .max();
    let wall_clock_seconds = match (started, ended) {
        (Some(s), Some(e)) => e.signed_duration_since(s).num_seconds().max(0),
        _ => 0,
    };
    let all_terminated = members
        .iter()
        .all(|m| m.state == InstanceState::Terminated);
    json!({
        "instances": members.len(),
        "total_tokens": total_tokens,
        "total_cost": total_cost,
        "wall_clock_seconds": wall_clock_seconds,
        "all_completed": all_terminated && errors.is_empty(),
        "errors": errors,
    })
}

fn render_summary(team_session_id: &str, members: &[InstanceRecord], summary: &Value) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Team artifacts: {team_session_id}\n\n"));
    out.push_str(&format!("Collected: {}\n\n", Utc::now().to_rfc3339()));
    out.push_str("| Instance | Role | Kind | State | Requests | Tokens | Cost |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for m in members {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | ${:.4} |\n",
            m.name,
            m.role.as_str(),
            m.kind.as_str(),
            m.state.as_str(),
            m.counters.request_count,
            m.counters.tokens_used,
            m.counters.cost,
        ));
    }
    out.push_str(&format!(
        "\nTotals: {} instances, {} tokens, ${:.4}, {}s wall clock, all_completed: {}\n",
        summary["instances"],
        summary["total_tokens"],
        summary["total_cost"].as_f64().unwrap_or(0.0),
        summary["wall_clock_seconds"],
        summary["all_completed"],
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use madrox_core::{InstanceKind, Role};
    use tempfile::TempDir;

    fn member(workspace: &Path, team: &str) -> InstanceRecord {
        let mut rec =
            InstanceRecord::new("worker", Role::General, InstanceKind::Claude, workspace.into());
        rec.team_session_id = Some(team.to_string());
        rec
    }

    fn collector(tmp: &TempDir) -> ArtifactCollector {
        let mut config = Config::default();
        config.artifacts_dir = tmp.path().join("artifacts");
        ArtifactCollector::new(&config)
    }

    #[test]
    fn collects_metadata_output_and_workspace() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("hello.txt"), "hi").unwrap();

        let rec = member(&ws, "team-x");
        let mut captures = HashMap::new();
        captures.insert(rec.id.clone(), "pane output".to_string());

        let result = collector(&tmp)
            .collect("team-x", std::slice::from_ref(&rec), &captures)
            .unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["instances_count"], 1);

        let team_dir = PathBuf::from(result["artifacts_path"].as_str().unwrap());
        assert!(team_dir.join("metadata.json").exists());
        assert!(team_dir.join("summary.md").exists());
        let inst_dir = team_dir.join("instances").join(&rec.id);
        assert!(inst_dir.join("metadata.json").exists());
        assert_eq!(
            fs::read_to_string(inst_dir.join("output.log")).unwrap(),
            "pane output"
        );
        assert_eq!(
            fs::read_to_string(inst_dir.join("workspace/hello.txt")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn consecutive_collections_use_disjoint_dirs() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let rec = member(&ws, "team-x");
        let captures = HashMap::new();

        let c = collector(&tmp);
        let first = c.collect("team-x", std::slice::from_ref(&rec), &captures).unwrap();
        let second = c.collect("team-x", std::slice::from_ref(&rec), &captures).unwrap();
        let p1 = first["artifacts_path"].as_str().unwrap();
        let p2 = second["artifacts_path"].as_str().unwrap();
        assert_ne!(p1, p2);
        assert!(Path::new(p1).exists());
        assert!(Path::new(p2).exists());
    }

    #[test]
    fn unreadable_workspace_is_partial_failure() {
        let tmp = TempDir::new().unwrap();
        let good_ws = tmp.path().join("good");
        fs::create_dir_all(&good_ws).unwrap();
        fs::write(good_ws.join("a.txt"), "a").unwrap();

        let good = member(&good_ws, "team-x");
        let bad = member(&tmp.path().join("missing"), "team-x");
        let captures = HashMap::new();

        let result = collector(&tmp)
            .collect("team-x", &[good.clone(), bad.clone()], &captures)
            .unwrap();
        assert_eq!(result["status"], "success");
        let summary = &result["execution_summary"];
        assert_eq!(summary["all_completed"], false);
        assert_eq!(summary["errors"].as_array().unwrap().len(), 1);

        let team_dir = PathBuf::from(result["artifacts_path"].as_str().unwrap());
        assert!(team_dir
            .join("instances")
            .join(&good.id)
            .join("workspace/a.txt")
            .exists());
    }

    #[test]
    fn exclude_globs_filter_the_mirror() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(ws.join("target")).unwrap();
        fs::write(ws.join("keep.rs"), "k").unwrap();
        fs::write(ws.join("target/skip.o"), "s").unwrap();

        let mut config = Config::default();
        config.artifacts_dir = tmp.path().join("artifacts");
        config.artifacts_exclude = vec!["target/**".to_string()];
        let c = ArtifactCollector::new(&config);

        let rec = member(&ws, "team-x");
        let result = c
            .collect("team-x", std::slice::from_ref(&rec), &HashMap::new())
            .unwrap();
        let team_dir = PathBuf::from(result["artifacts_path"].as_str().unwrap());
        let mirrored = team_dir.join("instances").join(&rec.id).join("workspace");
        assert!(mirrored.join("keep.rs").exists());
        assert!(!mirrored.join("target/skip.o").exists());
    }

    #[test]
    fn compression_writes_zst() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();

        let mut config = Config::default();
        config.artifacts_dir = tmp.path().join("artifacts");
        config.artifacts_compress = true;
        let c = ArtifactCollector::new(&config);

        let rec = member(&ws, "team-x");
        let mut captures = HashMap::new();
        captures.insert(rec.id.clone(), "pane text".to_string());
        let result = c
            .collect("team-x", std::slice::from_ref(&rec), &captures)
            .unwrap();
        let inst_dir = PathBuf::from(result["artifacts_path"].as_str().unwrap())
            .join("instances")
            .join(&rec.id);
        assert!(inst_dir.join("output.log.zst").exists());
        assert!(!inst_dir.join("output.log").exists());
        let decoded =
            zstd::decode_all(fs::read(inst_dir.join("output.log.zst")).unwrap().as_slice())
                .unwrap();
        assert_eq!(decoded, b"pane text");
    }

    #[test]
    fn retention_sweep_removes_old_dirs_only() {
        let tmp = TempDir::new().unwrap();
        let artifacts = tmp.path().join("artifacts");
        fs::create_dir_all(artifacts.join("2001-01-01_00-00-00-old-team")).unwrap();
        fs::create_dir_all(artifacts.join("not-a-timestamped-dir")).unwrap();

        let mut config = Config::default();
        config.artifacts_dir = artifacts.clone();
        config.artifacts_retention_days = Some(30);
        let c = ArtifactCollector::new(&config);

        let ws = tmp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let rec = member(&ws, "team-x");
        let result = c
            .collect("team-x", std::slice::from_ref(&rec), &HashMap::new())
            .unwrap();
        assert_eq!(result["retention_swept"], 1);
        assert!(!artifacts.join("2001-01-01_00-00-00-old-team").exists());
        assert!(artifacts.join("not-a-timestamped-dir").exists());
        // The fresh collection survives its own sweep.
        assert!(Path::new(result["artifacts_path"].as_str().unwrap()).exists());
    }
}

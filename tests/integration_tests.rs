//! Integration tests for the stageforge CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn stageforge() -> Command {
    cargo_bin_cmd!("stageforge")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    stageforge()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn write_milestones(dir: &Path, json: &str) {
    fs::write(dir.join(".stageforge/milestones.json"), json).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        stageforge()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("cleanup"));
    }

    #[test]
    fn test_version() {
        stageforge().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        stageforge()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized stageforge project"));

        let state = dir.path().join(".stageforge");
        assert!(state.join("stageforge.toml").exists());
        assert!(state.join("milestones.json").exists());
        assert!(state.join("logs").is_dir());
        assert!(state.join("worktrees").is_dir());
        assert_eq!(fs::read_to_string(state.join(".gitignore")).unwrap(), "*\n");
    }

    #[test]
    fn test_init_twice_keeps_files() {
        let dir = create_temp_project();
        init_project(&dir);
        write_milestones(dir.path(), r#"{"milestones": []}"#);

        stageforge()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));

        let content = fs::read_to_string(dir.path().join(".stageforge/milestones.json")).unwrap();
        assert_eq!(content, r#"{"milestones": []}"#);
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        stageforge()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();
        assert!(dir.path().join(".stageforge").is_dir());
    }
}

// =============================================================================
// Milestone commands
// =============================================================================

mod milestone_commands {
    use super::*;

    #[test]
    fn test_list_without_init() {
        let dir = create_temp_project();
        stageforge()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("stageforge init"));
    }

    #[test]
    fn test_list_groups_by_stage() {
        let dir = create_temp_project();
        init_project(&dir);

        stageforge()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("Stage 1"))
            .stdout(predicate::str::contains("Stage 2"))
            .stdout(predicate::str::contains("1B"))
            .stdout(predicate::str::contains("1A,1B"))
            .stdout(predicate::str::contains("3 milestones in 2 stage(s)"));
    }

    #[test]
    fn test_list_rejects_later_stage_dependency() {
        let dir = create_temp_project();
        init_project(&dir);
        write_milestones(
            dir.path(),
            r#"{"milestones": [
                {"stage": 1, "ordinal": 1, "title": "A", "dependencies": ["2A"]},
                {"stage": 2, "ordinal": 1, "title": "B"}
            ]}"#,
        );

        stageforge()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure();
    }

    #[test]
    fn test_status_before_any_run() {
        let dir = create_temp_project();
        init_project(&dir);

        stageforge()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No run recorded yet"));
    }

    #[test]
    fn test_status_reads_checkpoint() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".stageforge/checkpoint.json"),
            r#"{
                "current_stage": 1,
                "completed": ["1A"],
                "failed": {"1B": "quality gate exhausted"},
                "merged": ["1A"],
                "reviews": {
                    "1B": {
                        "scope": {"scope": "milestone", "id": "1B"},
                        "score": 0.4,
                        "threshold": 0.8,
                        "issues": [{
                            "kind": "failed_gate",
                            "severity": "high",
                            "description": "cargo test fails",
                            "location": {"file": "src/config.rs", "line": 12}
                        }],
                        "verdict": "fail",
                        "iteration": 3,
                        "created_at": "2026-01-01T00:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();

        stageforge()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Current stage: 1"))
            .stdout(predicate::str::contains("quality gate exhausted"))
            .stdout(predicate::str::contains("last review: score 0.40"))
            .stdout(predicate::str::contains("cargo test fails (src/config.rs:12)"))
            .stdout(predicate::str::contains("2/2"))
            .stdout(predicate::str::contains("0/1"))
            .stdout(predicate::str::contains("1/3 milestones completed"))
            .stdout(predicate::str::contains("Rate limits:"));
    }

    #[test]
    fn test_reset_force_removes_state() {
        let dir = create_temp_project();
        init_project(&dir);
        let checkpoint = dir.path().join(".stageforge/checkpoint.json");
        let retry = dir.path().join(".stageforge/retry_state.json");
        fs::write(&checkpoint, "{}").unwrap();
        fs::write(&retry, "{}").unwrap();

        stageforge()
            .current_dir(dir.path())
            .args(["reset", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Progress reset"));

        assert!(!checkpoint.exists());
        assert!(!retry.exists());
        assert!(dir.path().join(".stageforge/milestones.json").exists());
    }

    #[test]
    fn test_run_requires_init() {
        let dir = create_temp_project();
        stageforge()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("stageforge init"));
    }

    #[test]
    fn test_run_with_missing_milestones_file() {
        let dir = create_temp_project();
        init_project(&dir);
        stageforge()
            .current_dir(dir.path())
            .args(["run", "--milestones", "nope.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Milestones file not found"));
    }
}

// =============================================================================
// Config commands
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        stageforge()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No stageforge.toml found"))
            .stdout(predicate::str::contains("max_parallel_tasks"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = create_temp_project();
        stageforge()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        stageforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".stageforge")).unwrap();
        fs::write(
            dir.path().join(".stageforge/stageforge.toml"),
            "[review]\nquality_threshold = 1.5\n",
        )
        .unwrap();

        stageforge()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("quality_threshold"));
    }

    #[test]
    fn test_config_show_env_override() {
        let dir = create_temp_project();
        stageforge()
            .current_dir(dir.path())
            .env("STAGEFORGE_AGENT_CMD", "/opt/fake-agent")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/opt/fake-agent"));
    }
}

// =============================================================================
// End-to-end run against a scripted agent
// =============================================================================

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use git2::{Repository, Signature};
    use std::os::unix::fs::PermissionsExt;

    const FAKE_AGENT: &str = r#"#!/bin/sh
prompt=$(cat)
case "$prompt" in
  *"OUTPUT FORMAT"*)
    echo "Looks good."
    echo "Quality Score: 0.95"
    ;;
  *)
    id=$(printf '%s' "$prompt" | sed -n 's/.*milestone \([0-9][0-9]*[A-Z][A-Z]*\).*/\1/p' | head -n 1)
    echo "work for $id" > "work-$id.txt"
    echo "Implemented milestone $id"
    ;;
esac
"#;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let repo = Repository::init(dir).unwrap();
        fs::write(dir.join("README.md"), "# demo\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }

    #[test]
    fn test_run_merges_every_milestone() {
        if !git_available() {
            return;
        }
        let dir = create_temp_project();
        init_repo(dir.path());
        init_project(&dir);

        let agent = dir.path().join("fake-agent.sh");
        fs::write(&agent, FAKE_AGENT).unwrap();
        fs::set_permissions(&agent, fs::Permissions::from_mode(0o755)).unwrap();

        fs::write(
            dir.path().join(".stageforge/stageforge.toml"),
            format!(
                "[agent]\ncommand = \"{}\"\nskip_permissions = false\n\n[monitor]\nenabled = false\n",
                agent.display()
            ),
        )
        .unwrap();
        write_milestones(
            dir.path(),
            r#"{"milestones": [
                {"stage": 1, "ordinal": 1, "title": "First", "tasks": [{"description": "one"}]},
                {"stage": 1, "ordinal": 2, "title": "Second", "tasks": [{"description": "two"}]},
                {"stage": 2, "ordinal": 1, "title": "Third", "tasks": [{"description": "three"}],
                 "dependencies": ["1A"]}
            ]}"#,
        );

        stageforge()
            .current_dir(dir.path())
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .args(["run", "--ui", "minimal"])
            .assert()
            .success()
            .stdout(predicate::str::contains("merged 1A"))
            .stdout(predicate::str::contains("merged 2A"));

        for id in ["1A", "1B", "2A"] {
            assert!(dir.path().join(format!("work-{}.txt", id)).exists(), "{} not merged", id);
        }
        let progress = fs::read_to_string(dir.path().join(".stageforge/PROGRESS.md")).unwrap();
        assert!(progress.contains("3/3"));
        assert!(progress.contains("| 1/1 |"));

        // Nothing left to do on a second run.
        stageforge()
            .current_dir(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to do"));
    }
}

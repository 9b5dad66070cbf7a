use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    /// Copy a fixture into `~/.claude/projects/<project>/<session>.jsonl`.
    fn seed_session(&self, fixture: &str, project: &str, session: &str) -> PathBuf {
        let target = self
            .home
            .join(".claude/projects")
            .join(project)
            .join(format!("{session}.jsonl"));
        fs::create_dir_all(target.parent().expect("missing session parent"))
            .expect("failed to create project directory");
        fs::copy(fixture_path(fixture), &target).expect("failed to copy fixture");
        target
    }

    fn cache_path(&self) -> PathBuf {
        self.xdg_data.join("tailscribe/offsets.db")
    }
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../tailscribe-core/tests/fixtures/claude-code")
        .join(name)
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    let mut command = Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("tailscribe")));

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute tailscribe: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "tailscribe {rendered_args} failed with status {:?}\nstdout:\n{stdout}\nstderr:\n{stderr}",
        output.status.code()
    );
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is not JSON"))
        .collect()
}

#[test]
fn dump_prints_chunks_and_offset() {
    let env = CliTestEnv::new();
    let file = fixture_path("basic.jsonl");
    let args = ["dump", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let chunks = doc["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["kind"], "user_turn");
    assert_eq!(chunks[1]["kind"], "assistant_turn");
    assert_eq!(chunks[1]["id"], "a1");
    assert_eq!(
        doc["end_offset"].as_u64().unwrap(),
        fs::metadata(&file).unwrap().len()
    );
    assert!(doc["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn dump_compact_is_one_chunk_per_line() {
    let env = CliTestEnv::new();
    let file = fixture_path("five_turns.jsonl");
    let args = ["dump", "--compact", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let ids: Vec<String> = json_lines(&output)
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["u1", "a1", "u2", "a2", "u3"]);
}

#[test]
fn dump_context_estimates_each_chunk() {
    let env = CliTestEnv::new();
    let file = fixture_path("compaction.jsonl");
    let args = ["dump", "--context", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let context = doc["context"].as_array().unwrap();
    assert_eq!(context.len(), doc["chunks"].as_array().unwrap().len());
    let phases: Vec<u64> = context.iter().map(|c| c["phase"].as_u64().unwrap()).collect();
    assert_eq!(phases, vec![1, 1, 1, 2]);
    assert_eq!(context[2]["chunk_id"], "c1");
    assert!(context[2]["estimated_freed"].is_u64());
    assert!(context[0]["tokens_by_category"]["user-message"].as_u64().unwrap() > 0);

    let args = ["dump", "--compact", "--context", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);
    let lines = json_lines(&output);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3]["chunk"]["id"], "u2");
    assert_eq!(lines[3]["context"]["phase"], 2);
}

#[test]
fn dump_reports_skipped_lines() {
    let env = CliTestEnv::new();
    let file = fixture_path("malformed.jsonl");
    let args = ["dump", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["warnings"].as_array().unwrap().len(), 2);
    assert_eq!(doc["chunks"].as_array().unwrap().len(), 3);
}

#[test]
fn dump_missing_file_fails() {
    let env = CliTestEnv::new();
    let output = run(&env, &["dump", "/definitely/not/here.jsonl"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read"));
}

#[test]
fn tail_once_prints_initial_merge() {
    let env = CliTestEnv::new();
    let file = env.seed_session("basic.jsonl", "-Users-dev-project", "sess-basic");
    let args = ["tail", "--once", file.to_str().unwrap()];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let lines = json_lines(&output);
    let merged = lines
        .iter()
        .find(|l| l["event"] == "merged")
        .expect("no merged event");
    assert_eq!(merged["session_id"], "sess-basic");
    assert_eq!(merged["revision"], 1);
    assert_eq!(merged["diff"]["appended"], serde_json::json!(["u1", "a1"]));
    assert_eq!(merged["chunks"].as_array().unwrap().len(), 2);
}

#[test]
fn tail_once_discovers_sessions_and_caches_offsets() {
    let env = CliTestEnv::new();
    env.seed_session("basic.jsonl", "-Users-dev-one", "sess-one");
    env.seed_session("compaction.jsonl", "-Users-dev-two", "sess-two");

    let args = ["tail", "--once"];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let mut sessions: Vec<String> = json_lines(&output)
        .iter()
        .filter(|l| l["event"] == "merged")
        .map(|l| l["session_id"].as_str().unwrap().to_string())
        .collect();
    sessions.sort();
    assert_eq!(sessions, vec!["sess-one", "sess-two"]);
    assert!(env.cache_path().exists());

    // Second run resumes at the cached offsets: nothing new to merge
    let output = run(&env, &args);
    assert_success(&args, &output);
    assert!(!json_lines(&output).iter().any(|l| l["event"] == "merged"));

    let output = run(&env, &["offsets"]);
    assert_success(&["offsets"], &output);
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains("sess-one"));
    assert!(listing.contains("sess-two"));
}

#[test]
fn tail_no_cache_reparses_from_start() {
    let env = CliTestEnv::new();
    let file = env.seed_session("five_turns.jsonl", "-Users-dev-project", "sess-five");
    let path = file.to_str().unwrap();

    let first = ["tail", "--once", path];
    assert_success(&first, &run(&env, &first));

    let args = ["tail", "--once", "--no-cache", path];
    let output = run(&env, &args);
    assert_success(&args, &output);
    let merged = json_lines(&output)
        .into_iter()
        .find(|l| l["event"] == "merged")
        .expect("no merged event");
    assert_eq!(merged["diff"]["appended"].as_array().unwrap().len(), 5);
}

#[test]
fn tail_without_transcripts_fails() {
    let env = CliTestEnv::new();
    let output = run(&env, &["tail", "--once"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no transcripts found"));
}

#[test]
fn offsets_forget_removes_entry() {
    let env = CliTestEnv::new();
    let file = env.seed_session("basic.jsonl", "-Users-dev-project", "sess-forget");
    let tail = ["tail", "--once", file.to_str().unwrap()];
    assert_success(&tail, &run(&env, &tail));

    let forget = ["offsets", "--forget", "sess-forget"];
    let output = run(&env, &forget);
    assert_success(&forget, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Forgot offset for sess-forget"));

    let output = run(&env, &["offsets"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("No cached offsets"));
}

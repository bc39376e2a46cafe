use kiosync_core::{Database, EndpointKind};
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
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("kiosync/store.db")
    }

    fn write_config(&self, content: &str) {
        let path = self.xdg_config.join("kiosync/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config dir");
        fs::write(path, content).expect("failed to write config");
    }

    /// Remotes point at a closed local port so nothing leaves the machine
    fn write_unreachable_config(&self) {
        self.write_config(
            r#"
[remote]
document_store_url = "http://127.0.0.1:1"

[connectivity]
probe_host = "127.0.0.1:1"
probe_timeout_ms = 200

[sync]
item_pause_ms = 0
"#,
        );
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("kiosync"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute kiosync: {e}"))
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
        "kiosync {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_creates_migrated_store() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["init"]);
    assert!(stdout.contains("Schema version: 2"), "got:\n{stdout}");

    let db_path = env.db_path();
    assert!(db_path.exists(), "store should exist at {}", db_path.display());
    let db = Database::open(&db_path, None).expect("failed to open store");
    assert!(db.is_initialized());
}

#[test]
fn enqueue_fans_out_by_brand_and_status_reports_it() {
    let env = CliTestEnv::new();

    let stdout = run_ok(
        &env,
        &[
            "enqueue",
            "--parent-id",
            "evt-1",
            "--brand",
            "co_branded",
            "--data",
            r#"{"q1":"yes"}"#,
        ],
    );
    assert!(stdout.contains("(3 item(s))"), "got:\n{stdout}");

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Pending items:   3"), "got:\n{status}");
    assert!(status.contains("primary_store"));

    let db = Database::open(&env.db_path(), None).expect("failed to open store");
    assert_eq!(
        db.list_queue_items(Some(EndpointKind::BrandB))
            .expect("failed to list queue")
            .len(),
        1
    );
}

#[test]
fn enqueue_rejects_non_object_answers() {
    let env = CliTestEnv::new();

    let output = run_bin(
        &env,
        &[
            "enqueue",
            "--parent-id",
            "evt-1",
            "--brand",
            "other",
            "--data",
            r#""just text""#,
        ],
    );
    assert!(!output.status.success());

    let db = Database::open(&env.db_path(), None).expect("failed to open store");
    assert_eq!(db.count_queue_items().expect("failed to count"), 0);
}

#[test]
fn sync_requires_document_store_url() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["sync"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("document_store_url"), "got:\n{stderr}");
}

#[test]
fn sync_while_offline_leaves_queue_intact() {
    let env = CliTestEnv::new();
    env.write_unreachable_config();

    run_ok(
        &env,
        &[
            "enqueue",
            "--parent-id",
            "evt-1",
            "--brand",
            "other",
            "--data",
            "{}",
        ],
    );

    let stdout = run_ok(&env, &["sync"]);
    assert!(
        stdout.contains("Offline: 1 item(s) left queued"),
        "got:\n{stdout}"
    );

    let db = Database::open(&env.db_path(), None).expect("failed to open store");
    let items = db.list_queue_items(None).expect("failed to list queue");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].retry_count, 0);
}

#[test]
fn clear_queue_removes_items() {
    let env = CliTestEnv::new();

    run_ok(
        &env,
        &[
            "enqueue",
            "--parent-id",
            "evt-1",
            "--brand",
            "brand_a",
            "--data",
            "{}",
            "--event-id",
            "A-77",
        ],
    );

    let stdout = run_ok(&env, &["clear-queue"]);
    assert!(stdout.contains("Removed 2 queued item(s)"), "got:\n{stdout}");

    let status = run_ok(&env, &["status"]);
    assert!(status.contains("Pending items:   0"));
}

#[test]
fn cached_definitions_are_listed_by_category() {
    let env = CliTestEnv::new();
    let file = env.home.join("expo.json");
    fs::write(
        &file,
        r#"{"name":"Spring Expo","startDate":"2026-04-01T09:00:00Z"}"#,
    )
    .expect("failed to write definition");
    let file_arg = file.to_string_lossy().into_owned();

    let stdout = run_ok(
        &env,
        &[
            "cache-definition",
            "--id",
            "evt-expo",
            "--category",
            "brand_a",
            "--file",
            &file_arg,
        ],
    );
    assert!(stdout.contains("Cached definition evt-expo"));

    let listed = run_ok(&env, &["definitions"]);
    assert!(listed.contains("evt-expo"), "got:\n{listed}");
    assert!(listed.contains("Spring Expo"));
    assert!(!listed.contains("Cache is stale"));

    let filtered = run_ok(&env, &["definitions", "--category", "brand_b"]);
    assert!(filtered.contains("No cached definitions"), "got:\n{filtered}");
}

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn orderhist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("orderhist");
    path
}

const SITE: &str = r#"{
  "years": ["2023"],
  "buckets": {
    "2023": {
      "count_widget": 3,
      "pages": [
        { "cards": [
          { "status": "active", "order_no": "249-1", "date": "2023年5月2日" },
          { "status": "active", "order_no": "249-2", "date": "2023年4月9日" },
          { "status": "cancelled", "order_no": "249-3" }
        ] }
      ]
    }
  },
  "orders": {
    "249-1": { "date": "2023年5月2日", "items": [
      { "name": "Kettle", "url": "https://shop.example/dp/B0KETTLE", "price": "￥3,980",
        "seller": "Shop", "condition": "New", "thumbnail": "https://img.example/kettle.jpg" }
    ] },
    "249-2": { "date": "2023年4月9日", "fail_times": 1, "items": [
      { "name": "Paper", "url": "https://shop.example/gp/product/B0PAPER", "price": "￥450", "quantity": 2 }
    ] }
  },
  "categories": {
    "https://shop.example/dp/B0KETTLE": { "path": ["Home", "Kitchen"] }
  }
}"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(root.join("site.json"), SITE).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/orderhist.sqlite"

[data]
thumb_dir = "{root}/data/thumb"
debug_dir = "{root}/data/debug"
captcha_file = "{root}/data/captcha.png"

[crawl]
page_delay_ms = 0
order_delay_ms = 0
retry_delay_ms = 0
retry_pass_delay_ms = 0

[browser]
fixture = "{root}/site.json"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("orderhist.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_orderhist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = orderhist_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run orderhist binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, success) = run_orderhist(&config, &["init"]);
    assert!(success);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/orderhist.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_orderhist(&config, &["init"]);
    let (_, _, second) = run_orderhist(&config, &["init"]);
    assert!(first);
    assert!(second);
}

#[test]
fn test_crawl_collects_items_and_records_failures() {
    let (tmp, config) = setup_test_env();
    let (_, stderr, success) = run_orderhist(&config, &["crawl"]);
    assert!(success, "crawl failed: {}", stderr);
    assert!(tmp.path().join("data/thumb/B0KETTLE.png").exists());

    let (stdout, _, success) = run_orderhist(&config, &["errors"]);
    assert!(success);
    assert!(stdout.contains("fetch_error"));
    assert!(stdout.contains("249-2"));

    let (stdout, _, success) = run_orderhist(&config, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Items:       1"));
    assert!(stdout.contains("2023"));
    assert!(stdout.contains("pending"));
}

#[test]
fn test_retry_repairs_failed_order() {
    let (_tmp, config) = setup_test_env();
    run_orderhist(&config, &["crawl"]);

    let (stdout, stderr, success) = run_orderhist(&config, &["retry"]);
    assert!(success, "retry failed: {}", stderr);
    assert!(stdout.contains("1 succeeded, 0 failed"));

    let (stdout, _, _) = run_orderhist(&config, &["errors"]);
    assert!(stdout.contains("No errors recorded."));

    let (stdout, _, _) = run_orderhist(&config, &["errors", "--all"]);
    assert!(stdout.contains("resolved"));
}

#[test]
fn test_export_is_date_sorted_json() {
    let (tmp, config) = setup_test_env();
    run_orderhist(&config, &["crawl"]);
    run_orderhist(&config, &["retry"]);

    let (stdout, _, success) = run_orderhist(&config, &["export"]);
    assert!(success);
    let data: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(data["item_count"], 2);
    let items = data["items"].as_array().unwrap();
    assert_eq!(items[0]["name"], "Paper");
    assert_eq!(items[0]["quantity"], 2);
    assert_eq!(items[0]["thumbnail"], serde_json::Value::Null);
    assert_eq!(items[1]["name"], "Kettle");
    assert_eq!(items[1]["price"], 3980);
    assert!(items[1]["thumbnail"].as_str().unwrap().ends_with("B0KETTLE.png"));

    let out = tmp.path().join("out/items.json");
    let (_, stderr, success) =
        run_orderhist(&config, &["export", "--output", out.to_str().unwrap()]);
    assert!(success);
    assert!(stderr.contains("Exported 2 items"));
    assert!(out.exists());
}

#[test]
fn test_retry_unknown_id_fails() {
    let (_tmp, config) = setup_test_env();
    run_orderhist(&config, &["init"]);
    let (_, stderr, success) = run_orderhist(&config, &["retry", "--id", "999"]);
    assert!(!success);
    assert!(stderr.contains("999"));
}

#[test]
fn test_prune_errors_keeps_unresolved() {
    let (_tmp, config) = setup_test_env();
    run_orderhist(&config, &["crawl"]);
    let (stdout, _, success) = run_orderhist(&config, &["prune-errors", "--days", "0"]);
    assert!(success);
    assert!(stdout.contains("Removed 0"));

    let (stdout, _, _) = run_orderhist(&config, &["errors"]);
    assert!(stdout.contains("249-2"));
}

#[test]
fn test_crawl_without_driver_fails() {
    let (tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config).unwrap();
    let content = content.replace(
        &format!("fixture = \"{}/site.json\"", tmp.path().display()),
        "",
    );
    fs::write(&config, content).unwrap();

    let (_, stderr, success) = run_orderhist(&config, &["crawl"]);
    assert!(!success);
    assert!(stderr.contains("no browser driver configured"));
}

#[test]
fn test_invalid_progress_mode_rejected() {
    let (_tmp, config) = setup_test_env();
    let output = Command::new(orderhist_binary())
        .arg("--config")
        .arg(config.to_str().unwrap())
        .args(["--progress", "loud", "stats"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_orderhist(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to load configuration"));
}

//! End-to-end bridge scenarios against stub analyzer processes.
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tandem_core::config::AnalysisConfig;
use tandem_core::error::AnalysisError;
use tandem_core::{AnalysisBridge, DiagnosticSource, Priority, Severity};

fn temp_dir(prefix: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{stamp}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Checker stub: two fixed diagnostics per analyze request.
const CHECKER_TWO_FINDINGS: &str = r#"while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *'"health"'*) printf '{"type":"result"}\n' ;;
    *) printf '{"type":"result","diagnostics":[{"line":1,"column":1,"message":"type mismatch","severity":"error"},{"line":4,"column":2,"message":"unused symbol","severity":"warning"}]}\n' ;;
  esac
done"#;

/// Linter stub: one fixed finding, exit code 1 (findings present).
const LINTER_ONE_FINDING: &str = r#"cat > /dev/null
printf '[{"message":"prefer const","severity":"warn","ruleId":"prefer-const","start":{"line":9,"column":3}}]'
exit 1"#;

fn bridge_config(dir: &Path, checker_body: &str, linter_body: &str) -> AnalysisConfig {
    let checker = write_script(dir, "stub-checker.sh", checker_body);
    let linter = write_script(dir, "stub-linter.sh", linter_body);
    let mut config = AnalysisConfig::default();
    config.checker.binary_path = Some(checker);
    config.checker.pool_size = 1;
    config.checker.file_timeout_ms = 5_000;
    config.linter.binary_path = Some(linter);
    config.linter.file_timeout_ms = 5_000;
    config
}

#[tokio::test]
async fn analysis_merges_both_pools_and_caches_the_result() {
    let dir = temp_dir("tandem-e2e-merge");
    let bridge = AnalysisBridge::new(bridge_config(&dir, CHECKER_TWO_FINDINGS, LINTER_ONE_FINDING));
    bridge.start().await.expect("start bridge");

    let first = bridge
        .analyze("file:///src/app.ts", "let x: number = 'y';", false, Priority::Active)
        .await
        .expect("first analysis");
    assert!(!first.from_cache);
    assert_eq!(first.diagnostics.len(), 3);
    assert_eq!(
        first
            .diagnostics
            .iter()
            .filter(|d| d.source == DiagnosticSource::Checker)
            .count(),
        2
    );
    assert_eq!(
        first
            .diagnostics
            .iter()
            .filter(|d| d.source == DiagnosticSource::Linter)
            .count(),
        1
    );

    let second = bridge
        .analyze("file:///src/app.ts", "let x: number = 'y';", false, Priority::Active)
        .await
        .expect("second analysis");
    assert!(second.from_cache);
    assert_eq!(second.diagnostics, first.diagnostics);

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn changed_content_recomputes_and_replaces_the_cache_entry() {
    let dir = temp_dir("tandem-e2e-change");
    let bridge = AnalysisBridge::new(bridge_config(&dir, CHECKER_TWO_FINDINGS, LINTER_ONE_FINDING));
    bridge.start().await.expect("start bridge");

    bridge
        .analyze("file:///src/app.ts", "v1", false, Priority::Open)
        .await
        .expect("warm");
    let changed = bridge
        .analyze("file:///src/app.ts", "v2", false, Priority::Open)
        .await
        .expect("changed");
    assert!(!changed.from_cache);

    // Only the newer content is cached now.
    let old_again = bridge
        .analyze("file:///src/app.ts", "v1", false, Priority::Open)
        .await
        .expect("old content again");
    assert!(!old_again.from_cache);

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn duplicate_checker_finding_is_deduplicated_checker_wins() {
    let dir = temp_dir("tandem-e2e-dedup");
    let checker = r#"while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *) printf '{"type":"result","diagnostics":[{"line":3,"column":1,"message":"duplicate finding","severity":"error"}]}\n' ;;
  esac
done"#;
    let linter = r#"cat > /dev/null
printf '[{"message":"duplicate finding","severity":"warn","start":{"line":3,"column":1}},{"message":"only from linter","severity":"info","start":{"line":8,"column":1}}]'
exit 1"#;
    let bridge = AnalysisBridge::new(bridge_config(&dir, checker, linter));
    bridge.start().await.expect("start bridge");

    let result = bridge
        .analyze("file:///src/app.ts", "x", false, Priority::Open)
        .await
        .expect("analysis");
    assert_eq!(result.diagnostics.len(), 2);
    let duplicate = result
        .diagnostics
        .iter()
        .find(|d| d.message == "duplicate finding")
        .expect("deduplicated finding");
    assert_eq!(duplicate.source, DiagnosticSource::Checker);
    assert_eq!(duplicate.severity, Severity::Error);

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn queued_request_is_superseded_by_newer_content() {
    let dir = temp_dir("tandem-e2e-supersede");
    // Slow checker keeps the single dispatch slot busy long enough for the
    // queue to fill behind it.
    let slow_checker = r#"while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *) sleep 0.5; printf '{"type":"result","diagnostics":[]}\n' ;;
  esac
done"#;
    let linter = "cat > /dev/null\nprintf '[]'";
    let mut config = bridge_config(&dir, slow_checker, linter);
    config.max_concurrent = tandem_core::config::MaxConcurrent(1);
    let bridge = AnalysisBridge::new(config);
    bridge.start().await.expect("start bridge");

    let blocker_bridge = bridge.clone();
    let blocker = tokio::spawn(async move {
        blocker_bridge
            .analyze("file:///blocker.ts", "anything", false, Priority::Active)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stale_bridge = bridge.clone();
    let stale = tokio::spawn(async move {
        stale_bridge
            .analyze("file:///edited.ts", "old content", false, Priority::Open)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fresh = bridge
        .analyze("file:///edited.ts", "new content", false, Priority::Active)
        .await
        .expect("fresh analysis");
    assert!(!fresh.from_cache);

    let superseded = stale.await.expect("join stale");
    assert!(matches!(superseded, Err(AnalysisError::Superseded(_))));
    assert!(blocker.await.expect("join blocker").is_ok());

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn checker_crash_degrades_to_linter_findings_and_recovers() {
    let dir = temp_dir("tandem-e2e-crash");
    let state = dir.join("crashed-once");
    // Dies on the first request; behaves on every later spawn.
    let crash_once = format!(
        r#"if [ ! -f "{state}" ]; then
  : > "{state}"
  IFS= read -r line
  exit 3
fi
{responder}"#,
        state = state.display(),
        responder = CHECKER_TWO_FINDINGS,
    );
    let bridge = AnalysisBridge::new(bridge_config(&dir, &crash_once, LINTER_ONE_FINDING));
    bridge.start().await.expect("start bridge");

    // The crash surfaces as a failed checker; the linter still contributes.
    let degraded = bridge
        .analyze("file:///src/app.ts", "v-crash", false, Priority::Active)
        .await
        .expect("analysis despite crash");
    assert!(!degraded.from_cache);
    assert_eq!(degraded.diagnostics.len(), 1);
    assert_eq!(degraded.diagnostics[0].source, DiagnosticSource::Linter);

    // A replacement worker comes up and the next analysis is whole again.
    let mut recovered = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if bridge.workers().is_empty() {
            continue;
        }
        let result = bridge
            .analyze("file:///src/app.ts", "v-recovered", true, Priority::Active)
            .await
            .expect("post-respawn analysis");
        if result.diagnostics.len() == 3 {
            recovered = Some(result);
            break;
        }
    }
    let recovered = recovered.expect("checker never recovered");
    assert_eq!(
        recovered
            .diagnostics
            .iter()
            .filter(|d| d.source == DiagnosticSource::Checker)
            .count(),
        2
    );

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn linter_nonzero_exit_with_findings_is_not_an_error() {
    let dir = temp_dir("tandem-e2e-exit1");
    let linter = r#"cat > /dev/null
printf '[{"message":"first","severity":"warn","start":{"line":1,"column":1}},{"message":"second","severity":"deny","start":{"line":2,"column":1}}]'
exit 1"#;
    let mut config = bridge_config(&dir, CHECKER_TWO_FINDINGS, linter);
    config.checker.enabled = false;
    let bridge = AnalysisBridge::new(config);
    bridge.start().await.expect("start bridge");

    let result = bridge
        .analyze("file:///src/app.ts", "x", false, Priority::Open)
        .await
        .expect("lint-only analysis");
    assert_eq!(result.diagnostics.len(), 2);
    assert!(result
        .diagnostics
        .iter()
        .all(|d| d.source == DiagnosticSource::Linter));
    assert_eq!(result.diagnostics[1].severity, Severity::Error);

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn type_info_is_guarded_and_cached() {
    let dir = temp_dir("tandem-e2e-typeinfo");
    let checker = r#"while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *'"typeInfo"'*) printf '{"type":"result","typeInfo":{"display":"Tree<Tree<Tree<Tree<Tree<Leaf>>>>>"}}\n' ;;
    *) printf '{"type":"result"}\n' ;;
  esac
done"#;
    let mut config = bridge_config(&dir, checker, "cat > /dev/null\nprintf '[]'");
    config.checker.max_type_depth = 3;
    let bridge = AnalysisBridge::new(config);
    bridge.start().await.expect("start bridge");

    let info = bridge
        .type_info("file:///src/app.ts", "tree", 1, 5)
        .await
        .expect("type info")
        .expect("some type info");
    assert!(info.display.contains('…'));
    assert!(!info.display.contains("Leaf"));

    // Cached per content hash and position.
    let again = bridge
        .type_info("file:///src/app.ts", "tree", 1, 5)
        .await
        .expect("cached type info")
        .expect("some type info");
    assert_eq!(again, info);

    bridge.shutdown().await;
    fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn shutdown_fails_queued_requests() {
    let dir = temp_dir("tandem-e2e-shutdown");
    let slow_checker = r#"while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *) sleep 2; printf '{"type":"result","diagnostics":[]}\n' ;;
  esac
done"#;
    let mut config = bridge_config(&dir, slow_checker, "cat > /dev/null\nprintf '[]'");
    config.max_concurrent = tandem_core::config::MaxConcurrent(1);
    let bridge = AnalysisBridge::new(config);
    bridge.start().await.expect("start bridge");

    let blocker_bridge = bridge.clone();
    let blocker = tokio::spawn(async move {
        blocker_bridge
            .analyze("file:///blocker.ts", "x", false, Priority::Active)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued_bridge = bridge.clone();
    let queued = tokio::spawn(async move {
        queued_bridge
            .analyze("file:///queued.ts", "y", false, Priority::Open)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.shutdown().await;

    let queued_result = queued.await.expect("join queued");
    assert!(matches!(queued_result, Err(AnalysisError::ShuttingDown)));
    // The in-flight analysis still resolves to a result object.
    assert!(blocker.await.expect("join blocker").is_ok());

    fs::remove_dir_all(dir).ok();
}

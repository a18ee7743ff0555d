mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use common::{TestPipeline, Toolchain};
use playforge_pipeline::spawn_cleanup_task;

/// Push a session's last activity `hours` into the past on disk.
fn backdate_session(root: &Path, id: &str, hours: i64) {
    let path = root.join("sessions").join(id).join("session.json");
    let mut meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let then = chrono::Utc::now() - chrono::Duration::hours(hours);
    meta["last_modified"] = serde_json::json!(then);
    std::fs::write(&path, serde_json::to_vec(&meta).unwrap()).unwrap();
}

fn age_file(path: &Path, hours: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(hours * 3600))
        .unwrap();
}

#[tokio::test]
async fn inactive_sessions_are_removed_with_their_exports() {
    let mut t = TestPipeline::new(Toolchain::Succeeds).await;
    let stale = t.session("Old Game").await.id.to_string();
    let fresh = t.session("New Game").await.id.to_string();
    let export = t.pipeline.export(&stale, None).await.unwrap();
    assert!(export.zip_path.is_file());

    backdate_session(t.root(), &stale, 100);
    t.reopen().await;

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.sessions_cleaned, 1);
    assert!(report.bytes_freed > 0);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    assert!(t.pipeline.sessions.get_session(&stale).await.is_none());
    assert!(!t.root().join("sessions").join(&stale).exists());
    assert!(!export.zip_path.exists());
    assert!(t.pipeline.sessions.get_session(&fresh).await.is_some());
}

#[tokio::test]
async fn orphans_are_removed_after_the_grace_period() {
    let t = TestPipeline::with_config(Toolchain::Succeeds, |c| {
        c.cleanup.orphan_grace_secs = 0;
    })
    .await;
    let kept = t.session("Kept").await.id.to_string();

    let orphan_dir = t.root().join("sessions").join("no-such-session");
    std::fs::create_dir_all(&orphan_dir).unwrap();
    std::fs::write(orphan_dir.join("game.json"), b"{}").unwrap();
    std::fs::create_dir_all(t.root().join("exports")).unwrap();
    let orphan_zip = t.root().join("exports").join("no-such-session.zip");
    std::fs::write(&orphan_zip, b"PK").unwrap();
    let unrelated = t.root().join("exports").join("README");
    std::fs::write(&unrelated, b"keep").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.orphans_cleaned, 2);
    assert!(!orphan_dir.exists());
    assert!(!orphan_zip.exists());
    assert!(unrelated.exists());
    assert!(t.root().join("sessions").join(&kept).exists());
}

#[tokio::test]
async fn young_orphans_are_left_alone() {
    let t = TestPipeline::new(Toolchain::Succeeds).await;
    let orphan_dir = t.root().join("sessions").join("being-created");
    std::fs::create_dir_all(&orphan_dir).unwrap();

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.orphans_cleaned, 0);
    assert!(orphan_dir.exists());
}

#[tokio::test]
async fn old_temp_files_and_exports_expire() {
    let t = TestPipeline::new(Toolchain::Succeeds).await;
    let id = t.session("Space Race").await.id.to_string();
    let export = t.pipeline.export(&id, None).await.unwrap();

    let temp = t.root().join("temp");
    std::fs::create_dir_all(temp.join("upload")).unwrap();
    std::fs::write(temp.join("upload/old.bin"), vec![0u8; 64]).unwrap();
    std::fs::write(temp.join("recent.bin"), b"r").unwrap();
    age_file(&temp.join("upload/old.bin"), 30);
    age_file(&export.zip_path, 30);

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.temp_files_cleaned, 1);
    assert_eq!(report.exports_cleaned, 1);
    assert!(!temp.join("upload/old.bin").exists());
    assert!(temp.join("upload").is_dir());
    assert!(temp.join("recent.bin").exists());
    assert!(!export.zip_path.exists());

    let status = t.pipeline.export_status(&id).await.unwrap();
    assert!(!status.exists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_build_keeps_its_workspace() {
    let t = TestPipeline::with_config(Toolchain::Slow { millis: 1500 }, |c| {
        c.cleanup.orphan_grace_secs = 0;
    })
    .await;
    let id = t.session("Space Race").await.id.to_string();
    let workspace = t.root().join("isolated").join(&id);

    let pipeline = t.pipeline.clone();
    let build_id = id.clone();
    let build = tokio::spawn(async move { pipeline.preview(&build_id).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    age_file(&workspace.join("game.json"), 30);

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.temp_files_cleaned, 0);
    assert!(workspace.join("game.json").is_file());

    assert!(build.await.unwrap().is_ok());
    assert!(!workspace.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inactive_session_with_a_running_build_is_kept() {
    let mut t = TestPipeline::new(Toolchain::Slow { millis: 1500 }).await;
    let id = t.session("Old Game").await.id.to_string();
    backdate_session(t.root(), &id, 100);
    t.reopen().await;

    let pipeline = t.pipeline.clone();
    let build_id = id.clone();
    let build = tokio::spawn(async move { pipeline.preview(&build_id).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = t.pipeline.cleanup_service().run_sweep().await;
    assert_eq!(report.sessions_cleaned, 0);
    assert!(t.pipeline.sessions.get_session(&id).await.is_some());

    assert!(build.await.unwrap().is_ok());
    assert!(t.root().join("sessions").join(&id).join("game.json").is_file());
}

#[tokio::test]
async fn cleanup_task_sweeps_until_cancelled() {
    let t = TestPipeline::with_config(Toolchain::Succeeds, |c| {
        c.cleanup.orphan_grace_secs = 0;
    })
    .await;
    let orphan_dir = t.root().join("isolated").join("left-behind");
    std::fs::create_dir_all(&orphan_dir).unwrap();

    let cancel = CancellationToken::new();
    let handle = spawn_cleanup_task(
        Arc::new(t.pipeline.cleanup_service()),
        Duration::from_millis(50),
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!orphan_dir.exists());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

mod common;

use std::time::Duration;

use futures::future::join_all;

use common::{TestPipeline, Toolchain};
use playforge_pipeline::{BuildKind, BuildPolicy, PipelineError, SessionStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builds_for_one_session_never_overlap() {
    let t = TestPipeline::new(Toolchain::Slow { millis: 300 }).await;
    let session = t.session("Space Race").await;
    let id = session.id.as_str();

    let (preview, export) = tokio::join!(t.pipeline.preview(id), t.pipeline.export(id, None));
    assert!(preview.is_ok());
    assert!(export.is_ok());
    assert_eq!(t.invocations(), 2);
    assert_eq!(t.overlaps(), 0);
    assert!(!t.pipeline.runtime.is_building(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_build_in_parallel_up_to_the_limit() {
    let t = TestPipeline::with_config(Toolchain::Slow { millis: 500 }, |c| {
        c.limits.max_concurrent_builds = 2;
    })
    .await;
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(t.session(&format!("Game {i}")).await.id);
    }

    let results = join_all(ids.iter().map(|id| t.pipeline.preview(id.as_str()))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(t.invocations(), 4);
    assert_eq!(t.peak_concurrency(), 2);
    assert_eq!(t.pipeline.runtime.available_slots(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reject_policy_refuses_a_second_build() {
    let t = TestPipeline::with_config(Toolchain::Slow { millis: 800 }, |c| {
        c.limits.concurrent_build_policy = BuildPolicy::Reject;
    })
    .await;
    let session = t.session("Space Race").await;
    let id = session.id.as_str().to_string();

    let pipeline = t.pipeline.clone();
    let first_id = id.clone();
    let first = tokio::spawn(async move { pipeline.preview(&first_id).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(t.pipeline.runtime.is_building(&id));

    let err = t.pipeline.export(&id, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::BuildInProgress(_)));
    assert!(first.await.unwrap().is_ok());

    // A busy refusal does not count against the session.
    let session = t.pipeline.sessions.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archiving_cancels_a_running_build() {
    let t = TestPipeline::new(Toolchain::Slow { millis: 5000 }).await;
    let session = t.session("Space Race").await;
    let id = session.id.as_str().to_string();

    let pipeline = t.pipeline.clone();
    let build_id = id.clone();
    let build = tokio::spawn(async move { pipeline.preview(&build_id).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let archived = t.pipeline.archive(&id).await.unwrap();
    assert_eq!(archived.status, SessionStatus::Archived);

    let err = tokio::time::timeout(Duration::from_secs(3), build)
        .await
        .expect("cancelled build should finish promptly")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(_)));
    assert!(!t.pipeline.runtime.is_building(&id));
    assert!(!t.root().join("isolated").join(&id).exists());
    // Partial output of the cancelled build is discarded.
    assert!(!t.pipeline.runtime.output_dir(&id, BuildKind::Preview).exists());

    let session = t.pipeline.sessions.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Archived);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_build_removes_its_workspace() {
    let t = TestPipeline::new(Toolchain::Slow { millis: 5000 }).await;
    let session = t.session("Space Race").await;
    let id = session.id.as_str().to_string();
    let workspace = t.root().join("isolated").join(&id);

    let pipeline = t.pipeline.clone();
    let build_id = id.clone();
    let build = tokio::spawn(async move { pipeline.preview(&build_id).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(workspace.is_dir());

    build.abort();
    assert!(build.await.unwrap_err().is_cancelled());
    assert!(!workspace.exists());
    assert!(!t.pipeline.runtime.is_building(&id));
    assert_eq!(t.pipeline.runtime.available_slots(), t.config.limits.max_concurrent_builds);

    // The session lock was released too.
    assert!(t.pipeline.runtime.try_hold(&id).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_get_distinct_versions() {
    let t = TestPipeline::new(Toolchain::Succeeds).await;
    let session = t.session("Space Race").await;
    let id = session.id.as_str();

    let updates = (0..8).map(|i| {
        t.pipeline
            .update_document(id, common::document(&format!("Space Race {i}")))
    });
    let results = join_all(updates).await;
    let mut versions: Vec<u64> = results.into_iter().map(|r| r.unwrap().version).collect();
    versions.sort_unstable();
    assert_eq!(versions, (2..=9).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_every_build() {
    let t = TestPipeline::new(Toolchain::Slow { millis: 5000 }).await;
    let mut builds = Vec::new();
    for i in 0..2 {
        let id = t.session(&format!("Game {i}")).await.id.to_string();
        let pipeline = t.pipeline.clone();
        builds.push(tokio::spawn(async move { pipeline.preview(&id).await }));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(t.pipeline.shutdown(), 2);
    for build in builds {
        let result = tokio::time::timeout(Duration::from_secs(3), build)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
    }
    assert!(t.pipeline.runtime.building_sessions().is_empty());
}

use std::sync::Arc;

use serde_json::json;

use permit_client::{DenyInfo, PermitDecision};

use crate::steps::{HarvestSettings, SEARCH_RESULT_LIST, SEARCH_SUBMIT};
use crate::testing::*;
use crate::workflow::Block;

use super::search::SearchBlock;

fn on_target_plane() -> Arc<MockControlPlane> {
    Arc::new(MockControlPlane::new().on_snapshot(snapshot(
        "https://notes.example/search?keyword=cats",
        vec![anchored(SEARCH_RESULT_LIST)],
    )))
}

fn off_target_plane() -> Arc<MockControlPlane> {
    // First snapshot: home page without the result list. Every later query
    // sees the post-submit result page.
    Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot("https://notes.example/", vec![]))
            .on_snapshot(snapshot(
                "https://notes.example/search?keyword=cats",
                vec![anchored(SEARCH_RESULT_LIST)],
            )),
    )
}

#[tokio::test]
async fn on_target_page_skips_the_gate_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let plane = on_target_plane();
    let gate = Arc::new(MockGate::new());
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        HarvestSettings::default(),
    );

    let output = SearchBlock::new(deps.clone())
        .call(json!({ "keyword": "cats" }))
        .await
        .unwrap();

    assert_eq!(output["permitSkipped"], json!(true));
    assert_eq!(gate.request_count(), 0);
    assert!(plane.ops_for(SEARCH_SUBMIT).is_empty());
    let state = deps.state.lock().unwrap();
    assert_eq!(state.stats.permits_skipped, 1);
    assert_eq!(state.stats.searches, 0);
}

#[tokio::test]
async fn substring_keyword_match_does_not_skip_the_search() {
    let dir = tempfile::tempdir().unwrap();
    // The page shows results for "catsanddogs"; a search for "cats" must
    // still go through the gate and submit.
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot(
                "https://notes.example/search?keyword=catsanddogs",
                vec![anchored(SEARCH_RESULT_LIST)],
            ))
            .on_snapshot(snapshot(
                "https://notes.example/search?keyword=cats",
                vec![anchored(SEARCH_RESULT_LIST)],
            )),
    );
    let gate = Arc::new(MockGate::allowing());
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        HarvestSettings::default(),
    );

    let output = SearchBlock::new(deps)
        .call(json!({ "keyword": "cats" }))
        .await
        .unwrap();

    assert_eq!(output["permitSkipped"], json!(false));
    assert_eq!(gate.request_count(), 1);
    assert_eq!(plane.ops_for(SEARCH_SUBMIT), vec!["click"]);
}

#[tokio::test]
async fn percent_encoded_keyword_still_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let plane = Arc::new(MockControlPlane::new().on_snapshot(snapshot(
        "https://notes.example/search?keyword=caf%C3%A9%20au%20lait",
        vec![anchored(SEARCH_RESULT_LIST)],
    )));
    let gate = Arc::new(MockGate::new());
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        HarvestSettings::default(),
    );

    let output = SearchBlock::new(deps)
        .call(json!({ "keyword": "café au lait" }))
        .await
        .unwrap();

    assert_eq!(output["permitSkipped"], json!(true));
    assert_eq!(gate.request_count(), 0);
    assert!(plane.ops_for(SEARCH_SUBMIT).is_empty());
}

#[tokio::test]
async fn off_target_page_waits_for_a_permit_and_submits() {
    let dir = tempfile::tempdir().unwrap();
    let plane = off_target_plane();
    let gate = Arc::new(MockGate::allowing());
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        HarvestSettings::default(),
    );

    let output = SearchBlock::new(deps.clone())
        .call(json!({ "keyword": "cats" }))
        .await
        .unwrap();

    assert_eq!(output["permitSkipped"], json!(false));
    assert_eq!(
        output["resultUrl"],
        json!("https://notes.example/search?keyword=cats")
    );
    assert_eq!(gate.request_count(), 1);
    assert_eq!(plane.ops_for(SEARCH_SUBMIT), vec!["click"]);

    {
        let state = deps.state.lock().unwrap();
        assert_eq!(state.stats.searches, 1);
        assert_eq!(state.progress.search_round, 1);
        assert_eq!(state.progress.last_keyword.as_deref(), Some("cats"));
    }
    // The checkpoint landed on disk.
    assert!(deps.tracker.exists());
}

#[tokio::test]
async fn skip_flag_off_always_consults_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let plane = on_target_plane();
    let gate = Arc::new(MockGate::allowing());
    let settings = HarvestSettings {
        skip_permit_on_target: false,
        ..HarvestSettings::default()
    };
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        settings,
    );

    SearchBlock::new(deps)
        .call(json!({ "keyword": "cats" }))
        .await
        .unwrap();

    assert_eq!(gate.request_count(), 1);
    assert_eq!(plane.ops_for(SEARCH_SUBMIT), vec!["click"]);
}

#[tokio::test]
async fn identical_repeat_is_rejected_locally() {
    let dir = tempfile::tempdir().unwrap();
    let plane = on_target_plane();
    let gate = Arc::new(MockGate::allowing());
    let settings = HarvestSettings {
        skip_permit_on_target: false,
        ..HarvestSettings::default()
    };
    let deps = make_deps(
        plane,
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        settings,
    );
    let block = SearchBlock::new(deps);

    block.call(json!({ "keyword": "cats" })).await.unwrap();
    let err = block.call(json!({ "keyword": "cats" })).await.unwrap_err();

    assert!(format!("{err:#}").contains("identical permit request repeated"));
    // The gate never saw the repeat.
    assert_eq!(gate.request_count(), 1);
}

#[tokio::test]
async fn non_retryable_denial_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let plane = off_target_plane();
    let gate = Arc::new(MockGate::new().on_decision(PermitDecision {
        allowed: false,
        deny: Some(DenyInfo {
            code: "dev_consecutive_keyword_limit".to_string(),
            message: "keyword repeated too often".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }));
    let deps = make_deps(
        plane.clone(),
        gate.clone(),
        Arc::new(MemorySink::new()),
        dir.path(),
        HarvestSettings::default(),
    );

    let err = SearchBlock::new(deps)
        .call(json!({ "keyword": "cats" }))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("dev_consecutive_keyword_limit"));
    assert_eq!(gate.request_count(), 1);
    assert!(plane.ops_for(SEARCH_SUBMIT).is_empty());
}

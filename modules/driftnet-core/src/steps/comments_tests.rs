use std::sync::Arc;

use serde_json::json;

use crate::steps::{HarvestSettings, COMMENT_END_ANCHOR, COMMENT_LIST};
use crate::testing::*;
use crate::workflow::Block;

use super::comments::CollectCommentsBlock;

fn block_over(plane: Arc<MockControlPlane>, settings: HarvestSettings) -> CollectCommentsBlock {
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(
        plane,
        Arc::new(MockGate::allowing()),
        Arc::new(MemorySink::new()),
        dir.path(),
        settings,
    );
    // The tempdir can drop; comment collection never touches the checkpoint.
    CollectCommentsBlock::new(deps)
}

#[tokio::test]
async fn anchor_alone_decides_completion() {
    // Round 0: no anchor yet, scroll. Round 1: anchor visible, done.
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot(
                "https://notes.example/note/n1",
                vec![anchored(COMMENT_LIST)],
            ))
            .on_snapshot(snapshot(
                "https://notes.example/note/n1",
                vec![anchored(COMMENT_LIST), anchored(COMMENT_END_ANCHOR)],
            ))
            .on_extract(
                COMMENT_LIST,
                json!([
                    { "author": "kay", "content": "first" },
                    { "content": "second" },
                ]),
            ),
    );
    let block = block_over(plane.clone(), HarvestSettings::default());

    let output = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap();

    assert_eq!(output["commentsPartial"], json!(false));
    assert_eq!(output["comments"].as_array().unwrap().len(), 2);
    assert_eq!(output["comments"][0]["content"], json!("first"));
    assert_eq!(plane.ops_for(COMMENT_LIST), vec!["extract", "scroll", "extract"]);
}

#[tokio::test]
async fn extraction_failure_degrades_to_partial() {
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot(
                "https://notes.example/note/n1",
                vec![anchored(COMMENT_LIST)],
            ))
            .fail_container(COMMENT_LIST, "extract handler crashed"),
    );
    let block = block_over(plane, HarvestSettings::default());

    let output = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap();

    assert_eq!(output["commentsPartial"], json!(true));
    assert!(output["comments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn systemic_failure_aborts_instead_of_degrading() {
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot(
                "https://notes.example/note/n1",
                vec![anchored(COMMENT_LIST)],
            ))
            .fail_container(COMMENT_LIST, "session blocked by risk control"),
    );
    let block = block_over(plane, HarvestSettings::default());

    let err = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("risk control"));
}

#[tokio::test]
async fn round_budget_exhaustion_is_partial() {
    // Anchor never appears; after the round budget the set is not complete.
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot(
                "https://notes.example/note/n1",
                vec![anchored(COMMENT_LIST)],
            ))
            .on_extract(COMMENT_LIST, json!([{ "content": "only one" }])),
    );
    let settings = HarvestSettings {
        max_comment_rounds: 2,
        ..HarvestSettings::default()
    };
    let block = block_over(plane.clone(), settings);

    let output = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap();

    assert_eq!(output["commentsPartial"], json!(true));
    assert_eq!(output["comments"].as_array().unwrap().len(), 1);
    // Two full rounds: extract+scroll, extract+scroll.
    assert_eq!(
        plane.ops_for(COMMENT_LIST),
        vec!["extract", "scroll", "extract", "scroll"]
    );
}

#[tokio::test]
async fn anchor_check_failure_preserves_collected_comments() {
    // No snapshot scripted: the end-anchor check's remote query fails, but
    // the batch extracted before it must survive.
    let plane = Arc::new(
        MockControlPlane::new().on_extract(COMMENT_LIST, json!([{ "content": "kept" }])),
    );
    let block = block_over(plane, HarvestSettings::default());

    let output = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap();

    assert_eq!(output["commentsPartial"], json!(true));
    assert_eq!(output["comments"].as_array().unwrap().len(), 1);
    assert_eq!(output["comments"][0]["content"], json!("kept"));
}

#[tokio::test]
async fn hard_stop_during_anchor_check_propagates() {
    let plane = Arc::new(
        MockControlPlane::new()
            .on_snapshot(snapshot("https://ads.thirdparty.test/landing", vec![]))
            .on_extract(COMMENT_LIST, json!([])),
    );
    let block = block_over(plane, HarvestSettings::default());

    let err = block
        .call(json!({ "noteId": "n1", "skipped": false }))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("login status uncertain"));
}

#[tokio::test]
async fn skipped_note_passes_through_untouched() {
    let plane = Arc::new(MockControlPlane::new());
    let block = block_over(plane.clone(), HarvestSettings::default());

    let output = block
        .call(json!({ "noteId": "n1", "skipped": true }))
        .await
        .unwrap();

    assert_eq!(output["skipped"], json!(true));
    assert_eq!(output["commentsPartial"], json!(false));
    assert!(plane.ops_for(COMMENT_LIST).is_empty());
}

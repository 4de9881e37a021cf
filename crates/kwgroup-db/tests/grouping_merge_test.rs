//! Integration tests for keyword grouping, user grouping operations and merges.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database.
//! Run migrations first: `kwgroup migrate`

use std::collections::BTreeMap;

use kwgroup_db::test_fixtures::{new_keyword, TestProject};
use kwgroup_db::{Error, Keyword, KeywordRepository, KeywordStatus, LeaseRepository};
use sqlx::Row;

/// Helper to create a test project, loading `.env` first.
async fn test_project() -> TestProject {
    dotenvy::dotenv().ok();
    TestProject::new().await
}

/// Comparable state of every keyword, keyed by text.
async fn state(project: &TestProject) -> BTreeMap<String, (Vec<String>, i64, bool, bool, KeywordStatus)> {
    project
        .db
        .keywords
        .list_all(project.project_id)
        .await
        .unwrap()
        .into_iter()
        .map(|kw| {
            (
                kw.keyword.clone(),
                (kw.tokens, kw.volume, kw.is_parent, kw.group_id.is_some(), kw.status),
            )
        })
        .collect()
}

async fn by_text(project: &TestProject, text: &str) -> Keyword {
    project
        .db
        .keywords
        .get_by_text(project.project_id, text)
        .await
        .unwrap()
        .unwrap()
}

async fn merge_rows(project: &TestProject) -> (i64, i64) {
    let row = sqlx::query(
        "SELECT
             (SELECT COUNT(*) FROM merge_operations WHERE project_id = $1) AS ops,
             (SELECT COUNT(*) FROM keyword_merge_operations kmo
                JOIN merge_operations mo ON mo.id = kmo.merge_operation_id
               WHERE mo.project_id = $1) AS journal",
    )
    .bind(project.project_id)
    .fetch_one(project.db.pool())
    .await
    .unwrap();
    (row.get("ops"), row.get("journal"))
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_signature_group_scenario() {
    let project = test_project().await;
    let summary = project.ingest(&[("shoe", 100), ("shoes", 50), ("boot", 10)]).await;
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.groups_created, 1);
    assert_eq!(summary.standalone, 1);

    let shoe = by_text(&project, "shoe").await;
    let shoes = by_text(&project, "shoes").await;
    let boot = by_text(&project, "boot").await;

    assert!(shoe.is_parent);
    assert_eq!(shoe.volume, 150);
    assert_eq!(shoe.status, KeywordStatus::Grouped);
    assert!(!shoes.is_parent);
    assert_eq!(shoes.volume, 50);
    assert_eq!(shoes.group_id, shoe.group_id);

    assert!(boot.is_parent);
    assert_eq!(boot.group_id, None);
    assert_eq!(boot.volume, 10);
    assert_eq!(boot.status, KeywordStatus::Ungrouped);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_batches_join_existing_groups() {
    let one = test_project().await;
    one.ingest(&[("shoe", 100), ("shoes", 50), ("boot", 10), ("boots", 30)]).await;

    let many = test_project().await;
    many.ingest(&[("shoe", 100)]).await;
    many.ingest(&[("shoes", 50), ("boot", 10)]).await;
    many.ingest(&[("boots", 30)]).await;

    assert_eq!(state(&one).await, state(&many).await);
    assert_eq!(by_text(&many, "boots").await.volume, 40);

    one.cleanup().await;
    many.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_duplicate_text_is_dropped_at_insert() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100)]).await;
    let summary = project
        .db
        .keywords
        .insert_and_group(project.project_id, vec![new_keyword("Shoe", 5, None)])
        .await
        .unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.conflicts, 1);
    assert_eq!(by_text(&project, "shoe").await.volume, 100);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_block_missing_token_changes_nothing() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("shoes", 50), ("boot", 10)]).await;
    let before = state(&project).await;

    let count = project
        .db
        .grouping
        .block_token(project.project_id, "free", None)
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(state(&project).await, before);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_block_and_unblock_token() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("shoes", 50), ("boot", 10)]).await;
    let before = state(&project).await;

    let count = project
        .db
        .grouping
        .block_token(project.project_id, "shoe", Some("alice"))
        .await
        .unwrap();
    assert_eq!(count, 2);
    let counts = project.db.keywords.counts(project.project_id).await.unwrap();
    assert_eq!(counts.blocked, 2);
    assert_eq!(counts.groups, 0);

    let count = project
        .db
        .grouping
        .unblock_token(project.project_id, "shoe", Some("alice"))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(state(&project).await, before);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_regroup_then_ungroup_restores_exactly() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("boot", 10), ("sandal", 5)]).await;
    let before = state(&project).await;

    let boot = by_text(&project, "boot").await;
    let sandal = by_text(&project, "sandal").await;
    let outcome = project
        .db
        .grouping
        .regroup(project.project_id, &[boot.id, sandal.id], "Footwear", None)
        .await
        .unwrap();
    assert_eq!(outcome.members, 2);
    assert_eq!(outcome.parent_id, boot.id);
    assert_eq!(outcome.parent_keyword, "footwear");

    let parent = by_text(&project, "footwear").await;
    assert_eq!(parent.volume, 15);
    assert!(parent.original_state.is_some());

    let restored = project
        .db
        .grouping
        .ungroup(project.project_id, &[outcome.parent_id], None)
        .await
        .unwrap();
    assert_eq!(restored, 2);
    assert_eq!(state(&project).await, before);
    assert!(by_text(&project, "boot").await.original_state.is_none());

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_regroup_dissolves_the_group_it_empties() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("shoes", 50), ("boot", 10)]).await;

    let shoes = by_text(&project, "shoes").await;
    let boot = by_text(&project, "boot").await;
    project
        .db
        .grouping
        .regroup(project.project_id, &[shoes.id, boot.id], "footwear", None)
        .await
        .unwrap();

    let shoe = by_text(&project, "shoe").await;
    assert!(shoe.is_parent);
    assert_eq!(shoe.group_id, None);
    assert_eq!(shoe.volume, 100);
    assert_eq!(shoe.status, KeywordStatus::Ungrouped);

    let counts = project.db.keywords.counts(project.project_id).await.unwrap();
    assert_eq!(counts.grouped, 2);
    assert_eq!(counts.ungrouped, 1);
    assert_eq!(counts.groups, 1);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_regroup_requires_name_and_selection() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100)]).await;
    let shoe = by_text(&project, "shoe").await;

    let err = project
        .db
        .grouping
        .regroup(project.project_id, &[shoe.id], "  ", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = project
        .db
        .grouping
        .regroup(project.project_id, &[shoe.id], "footwear", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(by_text(&project, "shoe").await.original_state.is_none());
    let err = project
        .db
        .grouping
        .ungroup(project.project_id, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_mutations_conflict_with_active_lease() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("boot", 10)]).await;
    project
        .db
        .leases
        .try_acquire(project.project_id, "worker-a", std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let err = project
        .db
        .merges
        .merge(project.project_id, "footwear", &["shoe".to_string()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockConflict(_)));
    let err = project
        .db
        .grouping
        .block_token(project.project_id, "boot", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockConflict(_)));

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_merge_unmerge_round_trip() {
    let project = test_project().await;
    project
        .ingest(&[("running shoes", 10), ("running boots", 20), ("trail sneakers", 5)])
        .await;
    let before = state(&project).await;

    let outcome = project
        .db
        .merges
        .merge(
            project.project_id,
            "footwear",
            &["shoe".to_string(), "boot".to_string()],
            Some("alice"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.rewritten, 2);

    let shoes = by_text(&project, "running shoes").await;
    let boots = by_text(&project, "running boots").await;
    assert_eq!(shoes.tokens, vec!["footwear", "run"]);
    assert_eq!(shoes.group_id, boots.group_id);
    assert!(shoes.group_id.is_some());

    let undone = project
        .db
        .merges
        .unmerge(project.project_id, "footwear", Some("alice"))
        .await
        .unwrap();
    assert_eq!(undone.operations_removed, 1);
    assert_eq!(undone.restored, 2);

    assert_eq!(state(&project).await, before);
    assert_eq!(merge_rows(&project).await, (0, 0));

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_merge_hides_keywords_matching_a_grouped_parent() {
    let project = test_project().await;
    project
        .ingest(&[("shoe", 100), ("shoes", 50), ("sneaker", 30)])
        .await;
    let before = state(&project).await;

    let outcome = project
        .db
        .merges
        .merge(project.project_id, "shoe", &["sneaker".to_string()], None)
        .await
        .unwrap();
    assert_eq!(outcome.hidden, 1);

    let sneaker = by_text(&project, "sneaker").await;
    assert!(sneaker.is_hidden());
    let shoe = by_text(&project, "shoe").await;
    assert_eq!(sneaker.group_id, shoe.group_id);
    assert_eq!(shoe.volume, 180);

    let counts = project.db.keywords.counts(project.project_id).await.unwrap();
    assert_eq!(counts.total(), 2);
    assert_eq!(project.db.keywords.list(project.project_id).await.unwrap().len(), 2);

    let undone = project
        .db
        .merges
        .unmerge(project.project_id, "shoe", None)
        .await
        .unwrap();
    assert_eq!(undone.unhidden, 1);
    assert_eq!(state(&project).await, before);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_unmerge_restores_keywords_hidden_without_rewrite() {
    let project = test_project().await;
    project
        .ingest(&[("shoe", 100), ("shoes", 50), ("the shoe", 30), ("sneaker", 10)])
        .await;
    let shoes = by_text(&project, "shoes").await;
    project
        .db
        .grouping
        .ungroup(project.project_id, &[shoes.id], None)
        .await
        .unwrap();
    let before = state(&project).await;
    assert_eq!(by_text(&project, "shoe").await.volume, 130);

    let outcome = project
        .db
        .merges
        .merge(project.project_id, "shoe", &["sneaker".to_string()], None)
        .await
        .unwrap();
    assert_eq!(outcome.rewritten, 1);
    assert_eq!(outcome.hidden, 2);
    assert!(by_text(&project, "shoes").await.is_hidden());

    let undone = project
        .db
        .merges
        .unmerge(project.project_id, "shoe", None)
        .await
        .unwrap();
    assert_eq!(undone.restored, 1);
    assert_eq!(state(&project).await, before);

    let shoes = by_text(&project, "shoes").await;
    assert_eq!(shoes.group_id, None);
    assert_eq!(shoes.status, KeywordStatus::Ungrouped);
    assert_eq!(shoes.volume, 50);
    assert!(shoes.hidden_state.is_none());
    assert_eq!(by_text(&project, "shoe").await.volume, 130);
    assert_eq!(merge_rows(&project).await, (0, 0));

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_unmerge_keeps_earlier_regroup_rename() {
    let project = test_project().await;
    project
        .ingest(&[("shoe", 100), ("shoes", 50), ("sneaker", 10), ("boot", 5)])
        .await;
    let sneaker = by_text(&project, "sneaker").await;
    let boot = by_text(&project, "boot").await;
    project
        .db
        .grouping
        .regroup(project.project_id, &[sneaker.id, boot.id], "trainers", None)
        .await
        .unwrap();
    project
        .db
        .grouping
        .ungroup(project.project_id, &[boot.id], None)
        .await
        .unwrap();

    let trainers = by_text(&project, "trainers").await;
    assert_eq!(trainers.id, sneaker.id);
    assert_eq!(trainers.group_id, None);
    let regroup_snapshot = trainers.original_state.clone();
    assert!(regroup_snapshot.is_some());
    let before = state(&project).await;

    let outcome = project
        .db
        .merges
        .merge(project.project_id, "shoe", &["sneaker".to_string()], None)
        .await
        .unwrap();
    assert_eq!(outcome.hidden, 1);
    let hidden = by_text(&project, "trainers").await;
    assert!(hidden.is_hidden());
    assert_eq!(hidden.original_state, regroup_snapshot);

    project
        .db
        .merges
        .unmerge(project.project_id, "shoe", None)
        .await
        .unwrap();
    let after = state(&project).await;
    assert_eq!(
        after.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["boot", "shoe", "shoes", "trainers"]
    );
    assert_eq!(after, before);
    assert_eq!(by_text(&project, "trainers").await.original_state, regroup_snapshot);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_remerge_is_idempotent() {
    let project = test_project().await;
    project.ingest(&[("running shoes", 10), ("trail shoes", 5)]).await;

    let children = vec!["shoe".to_string()];
    let first = project
        .db
        .merges
        .merge(project.project_id, "footwear", &children, None)
        .await
        .unwrap();
    assert_eq!(first.rewritten, 2);
    let after_first = state(&project).await;
    let rows = merge_rows(&project).await;

    let second = project
        .db
        .merges
        .merge(project.project_id, "footwear", &children, None)
        .await
        .unwrap();
    assert_eq!(second.rewritten, 0);
    assert_eq!(second.operation_id, first.operation_id);
    assert_eq!(state(&project).await, after_first);
    assert_eq!(merge_rows(&project).await, rows);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_cyclic_merge_is_rejected_without_changes() {
    let project = test_project().await;
    project.ingest(&[("running shoes", 10), ("running boots", 20)]).await;

    project
        .db
        .merges
        .merge(project.project_id, "footwear", &["shoe".to_string()], None)
        .await
        .unwrap();
    let before = state(&project).await;

    let err = project
        .db
        .merges
        .merge(project.project_id, "shoe", &["footwear".to_string()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(state(&project).await, before);
    assert_eq!(merge_rows(&project).await.0, 1);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_new_keywords_get_existing_merges_applied() {
    let project = test_project().await;
    project.ingest(&[("running shoes", 10)]).await;
    let ops = project
        .db
        .merges
        .merge(project.project_id, "footwear", &["shoe".to_string()], None)
        .await
        .unwrap();

    let merge_ops = project.db.keywords.merge_operations(project.project_id).await.unwrap();
    assert_eq!(merge_ops.len(), 1);
    let applied = kwgroup_db::MergeMap::new(merge_ops).apply(&new_keyword("trail shoes", 5, None).tokens);
    let mut row = new_keyword("trail shoes", 5, None);
    row.tokens = applied.tokens;
    row.merge_snapshots = applied.snapshots;
    project
        .db
        .keywords
        .insert_and_group(project.project_id, vec![row])
        .await
        .unwrap();
    assert_eq!(by_text(&project, "trail shoes").await.tokens, vec!["footwear", "trail"]);

    project
        .db
        .merges
        .unmerge(project.project_id, &ops.parent_token, None)
        .await
        .unwrap();
    assert_eq!(by_text(&project, "trail shoes").await.tokens, vec!["shoe", "trail"]);

    project.cleanup().await;
}

#[tokio::test]
#[ignore = "requires migrated database"]
async fn test_confirm_and_backfill() {
    let project = test_project().await;
    project.ingest(&[("shoe", 100), ("shoes", 50)]).await;
    let shoe = by_text(&project, "shoe").await;

    let confirmed = project
        .db
        .grouping
        .confirm_groups(project.project_id, &[shoe.id])
        .await
        .unwrap();
    assert_eq!(confirmed, 2);
    assert_eq!(by_text(&project, "shoes").await.status, KeywordStatus::Confirmed);
    project
        .db
        .grouping
        .unconfirm_groups(project.project_id, &[shoe.id])
        .await
        .unwrap();

    // Stale tokens are rewritten and regrouped.
    sqlx::query("UPDATE keywords SET tokens = ARRAY['shoes'] WHERE project_id = $1 AND keyword = 'shoes'")
        .bind(project.project_id)
        .execute(project.db.pool())
        .await
        .unwrap();

    let dry = project.db.backfill.run(project.project_id, 1, true).await.unwrap();
    assert_eq!(dry.changed, 1);
    assert_eq!(by_text(&project, "shoes").await.tokens, vec!["shoes"]);

    let report = project.db.backfill.run(project.project_id, 1, false).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.changed, 1);
    assert_eq!(by_text(&project, "shoes").await.tokens, vec!["shoe"]);

    let again = project.db.backfill.run(project.project_id, 1, false).await.unwrap();
    assert_eq!(again.changed, 0);

    project.cleanup().await;
}

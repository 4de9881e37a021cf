//! Token merge and unmerge.
//!
//! A merge rewrites child tokens to the parent token in every keyword that
//! contains them and journals each keyword's pre-merge tokens in
//! `keyword_merge_operations`. Keywords the merge hides under a grouped
//! parent are journaled there too, flagged `hidden`. Unmerge replays that
//! journal backwards.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use kwgroup_core::merge::{normalize_token, rewrite_tokens};
use kwgroup_core::{
    new_v7, ActivityLog, AttachMode, Error, MergeGraph, MergeMap, MergeOperation, MergeOutcome,
    MergePlan, Result, UnmergeOutcome,
};

use crate::keywords::{
    ensure_unlocked, load_by_ids, lock_project, parse_keyword_row, record_merge_hide,
    record_merge_snapshot, restructure_in_tx, write_keywords, ContextSeed, KEYWORD_COLUMNS,
};

/// Merge operations of a project in creation order.
pub(crate) async fn fetch_merge_operations<'e, E>(
    executor: E,
    project_id: Uuid,
) -> Result<Vec<MergeOperation>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT id, project_id, parent_token, child_tokens, operation_id, created_by, created_at
         FROM merge_operations WHERE project_id = $1
         ORDER BY created_at, id",
    )
    .bind(project_id)
    .fetch_all(executor)
    .await
    .map_err(Error::Database)?;

    Ok(rows
        .into_iter()
        .map(|row| MergeOperation {
            id: row.get("id"),
            project_id: row.get("project_id"),
            parent_token: row.get("parent_token"),
            child_tokens: row.get("child_tokens"),
            operation_id: row.get("operation_id"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Overwrite the journal entries of a keyword for re-applied operations.
///
/// Used after an unmerge: later operations now see different pre-merge
/// tokens. Entries of other operations are left alone.
pub(crate) async fn upsert_merge_snapshots(
    tx: &mut Transaction<'_, Postgres>,
    keyword_id: Uuid,
    snapshots: &[(Uuid, Vec<String>)],
) -> Result<()> {
    for (op_id, tokens) in snapshots {
        sqlx::query(
            "INSERT INTO keyword_merge_operations
                 (keyword_id, merge_operation_id, original_tokens_snapshot)
             VALUES ($1, $2, $3)
             ON CONFLICT (keyword_id, merge_operation_id)
             DO UPDATE SET original_tokens_snapshot = EXCLUDED.original_tokens_snapshot",
        )
        .bind(keyword_id)
        .bind(op_id)
        .bind(tokens)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    }
    Ok(())
}

/// PostgreSQL merge engine.
pub struct PgMergeEngine {
    pool: Pool<Postgres>,
    activity: Option<Arc<dyn ActivityLog>>,
}

impl PgMergeEngine {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub async fn list_merge_operations(&self, project_id: Uuid) -> Result<Vec<MergeOperation>> {
        fetch_merge_operations(&self.pool, project_id).await
    }

    /// Create or extend the operation row for `plan` and fold absorbed
    /// operations into it. Returns `(id, operation_id)`.
    async fn persist_plan(
        tx: &mut Transaction<'_, Postgres>,
        project_id: Uuid,
        plan: &MergePlan,
        graph: &MergeGraph,
        created_by: Option<&str>,
    ) -> Result<(Uuid, Uuid)> {
        let children: Vec<String> = plan.child_tokens.iter().cloned().collect();

        let (id, operation_id) = match plan.extends.and_then(|id| {
            graph.operations().iter().find(|op| op.id == id)
        }) {
            Some(existing) => {
                sqlx::query("UPDATE merge_operations SET child_tokens = $2 WHERE id = $1")
                    .bind(existing.id)
                    .bind(&children)
                    .execute(&mut **tx)
                    .await
                    .map_err(Error::Database)?;
                (existing.id, existing.operation_id)
            }
            None => {
                let id = new_v7();
                let operation_id = new_v7();
                sqlx::query(
                    "INSERT INTO merge_operations
                         (id, project_id, parent_token, child_tokens, operation_id, created_by, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(id)
                .bind(project_id)
                .bind(&plan.parent_token)
                .bind(&children)
                .bind(operation_id)
                .bind(created_by)
                .bind(Utc::now())
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
                (id, operation_id)
            }
        };

        for absorbed in &plan.absorbed {
            // The absorbed journal holds the oldest tokens of its keywords;
            // an entry already present under the surviving operation wins.
            // Hide flags of both operations are kept.
            sqlx::query(
                "INSERT INTO keyword_merge_operations
                     (keyword_id, merge_operation_id, original_tokens_snapshot, hidden)
                 SELECT keyword_id, $2, original_tokens_snapshot, hidden
                 FROM keyword_merge_operations WHERE merge_operation_id = $1
                 ON CONFLICT (keyword_id, merge_operation_id)
                 DO UPDATE SET hidden = keyword_merge_operations.hidden OR EXCLUDED.hidden",
            )
            .bind(absorbed.id)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;

            sqlx::query("DELETE FROM merge_operations WHERE id = $1")
                .bind(absorbed.id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;

            debug!(
                subsystem = "merge",
                absorbed = %absorbed.parent_token,
                into = %plan.parent_token,
                "Merge chain flattened"
            );
        }

        Ok((id, operation_id))
    }

    /// Merge `children` into `parent` for every keyword of the project.
    ///
    /// Re-running the same merge is a no-op: rewritten keywords no longer
    /// contain the child tokens and their journal entries are kept.
    pub async fn merge(
        &self,
        project_id: Uuid,
        parent: &str,
        children: &[String],
        created_by: Option<&str>,
    ) -> Result<MergeOutcome> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let graph = MergeGraph::new(fetch_merge_operations(&mut *tx, project_id).await?);
        let plan = graph.plan(parent, children)?;
        let (op_id, operation_id) =
            Self::persist_plan(&mut tx, project_id, &plan, &graph, created_by).await?;

        let child_list: Vec<String> = plan.child_tokens.iter().cloned().collect();
        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords
             WHERE project_id = $1 AND tokens && $2::text[]
             ORDER BY seq"
        ))
        .bind(project_id)
        .bind(&child_list)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut rewritten = Vec::with_capacity(rows.len());
        for row in rows {
            let mut kw = parse_keyword_row(row)?;
            record_merge_snapshot(&mut tx, kw.id, op_id, &kw.tokens).await?;
            kw.tokens = rewrite_tokens(&kw.tokens, &plan.parent_token, &plan.child_tokens);
            rewritten.push(kw);
        }
        write_keywords(&mut tx, &rewritten).await?;

        let seed = ContextSeed {
            tokens: plan.affected_tokens(),
            follow_signatures: true,
            ..Default::default()
        };
        let out =
            restructure_in_tx(&mut tx, project_id, seed, AttachMode::Hide, &HashSet::new()).await?;
        for kw in out.rows.iter().filter(|kw| out.hidden.contains(&kw.id)) {
            record_merge_hide(&mut tx, kw.id, op_id, &kw.tokens).await?;
        }
        tx.commit().await.map_err(Error::Database)?;

        let outcome = MergeOutcome {
            operation_id,
            parent_token: plan.parent_token.clone(),
            child_tokens: child_list,
            absorbed: plan.absorbed.iter().map(|op| op.parent_token.clone()).collect(),
            rewritten: rewritten.len() as i64,
            hidden: out.stats.hidden,
        };
        info!(
            subsystem = "merge",
            op = "merge",
            project_id = %project_id,
            parent = %outcome.parent_token,
            children = outcome.child_tokens.len(),
            rewritten = outcome.rewritten,
            hidden = outcome.hidden,
            duration_ms = start.elapsed().as_millis() as u64,
            "Tokens merged"
        );
        if let Some(activity) = &self.activity {
            activity
                .log(
                    project_id,
                    "tokens_merged",
                    json!({
                        "parent_token": outcome.parent_token,
                        "child_tokens": outcome.child_tokens,
                        "absorbed": outcome.absorbed,
                        "rewritten": outcome.rewritten,
                    }),
                    created_by,
                )
                .await;
        }
        Ok(outcome)
    }

    /// Undo the merge whose parent token is `parent`.
    ///
    /// Journaled keywords get their pre-merge tokens back, with the project's
    /// remaining merges re-applied. Every keyword the merge hid returns to
    /// its state from before the hide, whether or not its tokens were
    /// rewritten.
    pub async fn unmerge(
        &self,
        project_id: Uuid,
        parent: &str,
        user: Option<&str>,
    ) -> Result<UnmergeOutcome> {
        let start = Instant::now();
        let parent = normalize_token(parent);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let operations = fetch_merge_operations(&mut *tx, project_id).await?;
        let graph = MergeGraph::new(operations.clone());
        let target = graph
            .by_parent(&parent)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("merge operation for '{parent}'")))?;
        let remaining = MergeMap::new(operations).without(&[target.id]);

        let journal = sqlx::query(
            "SELECT keyword_id, original_tokens_snapshot, hidden FROM keyword_merge_operations
             WHERE merge_operation_id = $1",
        )
        .bind(target.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let journal: Vec<(Uuid, Vec<String>, bool)> = journal
            .into_iter()
            .map(|row| {
                (
                    row.get("keyword_id"),
                    row.get("original_tokens_snapshot"),
                    row.get("hidden"),
                )
            })
            .collect();

        let ids: Vec<Uuid> = journal.iter().map(|(id, _, _)| *id).collect();
        let mut keywords = load_by_ids(&mut tx, project_id, &ids).await?;
        let mut outcome = UnmergeOutcome {
            operations_removed: 1,
            ..Default::default()
        };
        let mut former_groups: BTreeSet<Uuid> = BTreeSet::new();

        for kw in keywords.iter_mut() {
            let Some((_, snapshot, hidden)) = journal.iter().find(|(id, _, _)| *id == kw.id)
            else {
                continue;
            };
            former_groups.extend(kw.group_id);
            if *hidden && kw.is_hidden() {
                kw.unhide();
                outcome.unhidden += 1;
            }
            // Hidden but never rewritten.
            if *snapshot == kw.tokens {
                continue;
            }
            let applied = remaining.apply(snapshot);
            kw.tokens = applied.tokens;
            upsert_merge_snapshots(&mut tx, kw.id, &applied.snapshots).await?;
            outcome.restored += 1;
        }
        write_keywords(&mut tx, &keywords).await?;

        sqlx::query("DELETE FROM merge_operations WHERE id = $1")
            .bind(target.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let mut tokens: Vec<String> = target.child_tokens.clone();
        tokens.push(target.parent_token.clone());
        let seed = ContextSeed {
            tokens,
            group_ids: former_groups.into_iter().collect(),
            follow_signatures: true,
            ..Default::default()
        };
        let out =
            restructure_in_tx(&mut tx, project_id, seed, AttachMode::Leave, &HashSet::new()).await?;
        outcome.unhidden += out.stats.unhidden;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "merge",
            op = "unmerge",
            project_id = %project_id,
            parent = %parent,
            restored = outcome.restored,
            unhidden = outcome.unhidden,
            duration_ms = start.elapsed().as_millis() as u64,
            "Merge undone"
        );
        if let Some(activity) = &self.activity {
            activity
                .log(
                    project_id,
                    "tokens_unmerged",
                    json!({
                        "parent_token": parent,
                        "child_tokens": target.child_tokens,
                        "restored": outcome.restored,
                    }),
                    user,
                )
                .await;
        }
        Ok(outcome)
    }
}

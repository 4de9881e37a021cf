//! User-triggered grouping operations.
//!
//! Regroup, ungroup, token blocking and group confirmation. All of them are
//! refused with [`Error::LockConflict`] while the project's ingestion lease
//! is live, and each runs in a single transaction.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Pool, Postgres};
use tracing::info;
use uuid::Uuid;

use kwgroup_core::grouping::{expand_selection, plan_regroup, plan_ungroup, signature};
use kwgroup_core::merge::normalize_token;
use kwgroup_core::{
    normalize_keyword_text, ActivityLog, AttachMode, BlockedBy, Error, KeywordStatus, Result,
};

use crate::keywords::{
    ensure_unlocked, load_by_ids, load_context, lock_project, restructure_in_tx, write_keywords,
    ContextSeed, KEYWORD_COLUMNS,
};

/// Result of a regroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegroupOutcome {
    pub group_id: Uuid,
    pub parent_id: Uuid,
    pub parent_keyword: String,
    pub members: i64,
}

/// PostgreSQL grouping engine for user operations.
pub struct PgGroupingEngine {
    pool: Pool<Postgres>,
    activity: Option<Arc<dyn ActivityLog>>,
}

impl PgGroupingEngine {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            activity: None,
        }
    }

    /// Record user operations in an activity log.
    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    async fn log(&self, project_id: Uuid, action: &str, details: serde_json::Value, user: Option<&str>) {
        if let Some(activity) = &self.activity {
            activity.log(project_id, action, details, user).await;
        }
    }

    /// Move the selected keywords into a new group named `group_name`.
    ///
    /// The groups they leave are re-settled: re-elected, recomputed or
    /// dissolved when one member remains.
    pub async fn regroup(
        &self,
        project_id: Uuid,
        keyword_ids: &[Uuid],
        group_name: &str,
        user: Option<&str>,
    ) -> Result<RegroupOutcome> {
        let start = Instant::now();
        let ids: Vec<Uuid> = keyword_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let selected = load_by_ids(&mut tx, project_id, &ids).await?;
        let name = normalize_keyword_text(group_name);
        let name_taken: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM keywords
                 WHERE project_id = $1 AND keyword = $2 AND NOT (id = ANY($3::uuid[]))
             )",
        )
        .bind(project_id)
        .bind(&name)
        .bind(&ids)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let former_groups: Vec<Uuid> = selected.iter().filter_map(|kw| kw.group_id).collect();
        let plan = plan_regroup(selected, group_name, name_taken)?;
        write_keywords(&mut tx, &plan.members).await?;

        let mut group_ids = former_groups;
        group_ids.push(plan.group_id);
        let seed = ContextSeed {
            group_ids,
            ..Default::default()
        };
        restructure_in_tx(&mut tx, project_id, seed, AttachMode::Leave, &HashSet::new()).await?;
        tx.commit().await.map_err(Error::Database)?;

        let outcome = RegroupOutcome {
            group_id: plan.group_id,
            parent_id: plan.parent_id,
            parent_keyword: name,
            members: plan.members.len() as i64,
        };
        info!(
            subsystem = "grouping",
            op = "regroup",
            project_id = %project_id,
            group_id = %outcome.group_id,
            members = outcome.members,
            duration_ms = start.elapsed().as_millis() as u64,
            "Keywords regrouped"
        );
        self.log(
            project_id,
            "keywords_regrouped",
            json!({
                "group_id": outcome.group_id,
                "group_name": outcome.parent_keyword,
                "keyword_ids": ids,
            }),
            user,
        )
        .await;
        Ok(outcome)
    }

    /// Restore the selected keywords from their snapshots.
    ///
    /// Selecting a parent ungroups its whole group. Keywords without a
    /// snapshot become standalone and keep their current numbers. Returns
    /// the number of keywords restored.
    pub async fn ungroup(
        &self,
        project_id: Uuid,
        keyword_ids: &[Uuid],
        user: Option<&str>,
    ) -> Result<i64> {
        let start = Instant::now();
        if keyword_ids.is_empty() {
            return Err(Error::Validation("no keywords selected".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let selected = load_by_ids(&mut tx, project_id, keyword_ids).await?;
        let seed = ContextSeed {
            group_ids: selected.iter().filter_map(|kw| kw.group_id).collect(),
            ids: keyword_ids.to_vec(),
            ..Default::default()
        };
        let rows = load_context(&mut tx, project_id, seed).await?;
        let expanded = expand_selection(keyword_ids, &rows);
        let chosen: Vec<_> = rows
            .into_iter()
            .filter(|kw| expanded.contains(&kw.id))
            .collect();
        let mut group_ids: Vec<Uuid> = chosen.iter().filter_map(|kw| kw.group_id).collect();

        let restored = plan_ungroup(chosen)?;
        write_keywords(&mut tx, &restored).await?;

        group_ids.extend(restored.iter().filter_map(|kw| kw.group_id));
        let preferred: HashSet<Uuid> = restored.iter().map(|kw| kw.id).collect();
        let seed = ContextSeed {
            group_ids,
            ..Default::default()
        };
        restructure_in_tx(&mut tx, project_id, seed, AttachMode::Leave, &preferred).await?;
        tx.commit().await.map_err(Error::Database)?;

        let count = restored.len() as i64;
        info!(
            subsystem = "grouping",
            op = "ungroup",
            project_id = %project_id,
            restored = count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Keywords ungrouped"
        );
        self.log(
            project_id,
            "keywords_ungrouped",
            json!({ "keyword_ids": expanded, "restored": count }),
            user,
        )
        .await;
        Ok(count)
    }

    /// Block every visible keyword containing `token`. Returns the count.
    ///
    /// Blocked keywords leave their groups; the groups are re-settled.
    pub async fn block_token(&self, project_id: Uuid, token: &str, user: Option<&str>) -> Result<i64> {
        let token = normalize_token(token);
        if token.is_empty() {
            return Err(Error::Validation("token is required".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords
             WHERE project_id = $1 AND $2 = ANY(tokens)
               AND status <> 'blocked'
               AND blocked_by IS DISTINCT FROM 'merge_hidden'
             ORDER BY seq"
        ))
        .bind(project_id)
        .bind(&token)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if rows.is_empty() {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(0);
        }

        let mut blocked = rows
            .into_iter()
            .map(crate::keywords::parse_keyword_row)
            .collect::<Result<Vec<_>>>()?;
        let former_groups: Vec<Uuid> = blocked.iter().filter_map(|kw| kw.group_id).collect();
        for kw in blocked.iter_mut() {
            kw.make_standalone();
            kw.status = KeywordStatus::Blocked;
            kw.blocked_by = Some(BlockedBy::User);
        }
        write_keywords(&mut tx, &blocked).await?;

        let seed = ContextSeed {
            group_ids: former_groups,
            ..Default::default()
        };
        restructure_in_tx(&mut tx, project_id, seed, AttachMode::Leave, &HashSet::new()).await?;
        tx.commit().await.map_err(Error::Database)?;

        let count = blocked.len() as i64;
        info!(
            subsystem = "grouping",
            op = "block_token",
            project_id = %project_id,
            token = %token,
            count,
            "Token blocked"
        );
        self.log(
            project_id,
            "token_blocked",
            json!({ "token": token, "count": count }),
            user,
        )
        .await;
        Ok(count)
    }

    /// Unblock keywords blocked by a user for `token`. Returns the count.
    ///
    /// Unblocked keywords rejoin grouping through their signatures.
    pub async fn unblock_token(
        &self,
        project_id: Uuid,
        token: &str,
        user: Option<&str>,
    ) -> Result<i64> {
        let token = normalize_token(token);
        if token.is_empty() {
            return Err(Error::Validation("token is required".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords
             WHERE project_id = $1 AND $2 = ANY(tokens)
               AND status = 'blocked' AND blocked_by = 'user'
             ORDER BY seq"
        ))
        .bind(project_id)
        .bind(&token)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if rows.is_empty() {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(0);
        }

        let mut unblocked = rows
            .into_iter()
            .map(crate::keywords::parse_keyword_row)
            .collect::<Result<Vec<_>>>()?;
        for kw in unblocked.iter_mut() {
            kw.make_standalone();
        }
        write_keywords(&mut tx, &unblocked).await?;

        let seed = ContextSeed {
            signatures: unblocked.iter().map(|kw| signature(&kw.tokens)).collect(),
            follow_signatures: true,
            ..Default::default()
        };
        restructure_in_tx(&mut tx, project_id, seed, AttachMode::Attach, &HashSet::new()).await?;
        tx.commit().await.map_err(Error::Database)?;

        let count = unblocked.len() as i64;
        info!(
            subsystem = "grouping",
            op = "unblock_token",
            project_id = %project_id,
            token = %token,
            count,
            "Token unblocked"
        );
        self.log(
            project_id,
            "token_unblocked",
            json!({ "token": token, "count": count }),
            user,
        )
        .await;
        Ok(count)
    }

    /// Mark the groups of the given parents `confirmed`. Returns rows updated.
    pub async fn confirm_groups(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<i64> {
        self.set_group_status(project_id, parent_ids, KeywordStatus::Grouped, KeywordStatus::Confirmed)
            .await
    }

    /// Move confirmed groups of the given parents back to `grouped`.
    pub async fn unconfirm_groups(&self, project_id: Uuid, parent_ids: &[Uuid]) -> Result<i64> {
        self.set_group_status(project_id, parent_ids, KeywordStatus::Confirmed, KeywordStatus::Grouped)
            .await
    }

    async fn set_group_status(
        &self,
        project_id: Uuid,
        parent_ids: &[Uuid],
        from: KeywordStatus,
        to: KeywordStatus,
    ) -> Result<i64> {
        if parent_ids.is_empty() {
            return Err(Error::Validation("no groups selected".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;
        ensure_unlocked(&mut tx, project_id).await?;

        // Hidden members carry the group status too, so unhiding later keeps
        // the group consistent.
        let result = sqlx::query(
            "UPDATE keywords SET status = $4, updated_at = now()
             WHERE project_id = $1 AND status = $3
               AND group_id IN (
                   SELECT group_id FROM keywords
                   WHERE project_id = $1 AND id = ANY($2::uuid[])
                     AND is_parent AND group_id IS NOT NULL
               )",
        )
        .bind(project_id)
        .bind(parent_ids)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        let updated = result.rows_affected() as i64;
        info!(
            subsystem = "grouping",
            op = "set_group_status",
            project_id = %project_id,
            groups = parent_ids.len(),
            status = to.as_str(),
            updated,
            "Group status changed"
        );
        Ok(updated)
    }
}

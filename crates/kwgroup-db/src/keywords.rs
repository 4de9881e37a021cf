//! Keyword storage and batch grouping.
//!
//! Every mutation of the `keywords` table runs inside one transaction that
//! first locks the project's row in `projects`. That serializes ingestion
//! batches, user grouping operations and merges of the same project, so a
//! reader never sees a group with zero or two parents.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use kwgroup_core::grouping::{self, signature};
use kwgroup_core::{
    AttachMode, Error, GroupingSummary, Keyword, KeywordCounts, KeywordRepository,
    KeywordSnapshot, KeywordStatus, MergeOperation, NewKeyword, RestructureStats, Restructured,
    Result,
};

use crate::merges::fetch_merge_operations;

pub(crate) const KEYWORD_COLUMNS: &str = "id, project_id, seq, keyword, tokens, volume, \
     difficulty, original_volume, original_difficulty, serp_features, is_parent, group_id, \
     status, blocked_by, original_state, hidden_state";

/// SQL expression producing the same string as [`signature`].
pub(crate) const SIGNATURE_SQL: &str = "array_to_string(tokens, chr(31))";

pub(crate) fn parse_keyword_row(row: sqlx::postgres::PgRow) -> Result<Keyword> {
    let status: String = row.get("status");
    let blocked_by: Option<String> = row.get("blocked_by");
    let original_state: Option<Json<KeywordSnapshot>> = row.get("original_state");
    let hidden_state: Option<Json<KeywordSnapshot>> = row.get("hidden_state");
    Ok(Keyword {
        id: row.get("id"),
        project_id: row.get("project_id"),
        seq: row.get("seq"),
        keyword: row.get("keyword"),
        tokens: row.get("tokens"),
        volume: row.get("volume"),
        difficulty: row.get("difficulty"),
        original_volume: row.get("original_volume"),
        original_difficulty: row.get("original_difficulty"),
        serp_features: row.get("serp_features"),
        is_parent: row.get("is_parent"),
        group_id: row.get("group_id"),
        status: status.parse()?,
        blocked_by: blocked_by.map(|b| b.parse()).transpose()?,
        original_state: original_state.map(|s| s.0),
        hidden_state: hidden_state.map(|s| s.0),
    })
}

/// Lock the project row for the rest of the transaction.
pub(crate) async fn lock_project(tx: &mut Transaction<'_, Postgres>, project_id: Uuid) -> Result<()> {
    sqlx::query("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
        .bind(project_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
    Ok(())
}

/// Fail with [`Error::LockConflict`] while an ingestion lease is live.
pub(crate) async fn ensure_unlocked(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
) -> Result<()> {
    let locked: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT 1 FROM project_processing_leases
             WHERE project_id = $1 AND lease_expires_at > now()
         )",
    )
    .bind(project_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(Error::Database)?;

    if locked {
        return Err(Error::LockConflict(format!(
            "project {project_id} is processing uploads; try again when ingestion finishes"
        )));
    }
    Ok(())
}

/// Starting points for loading the rows a restructure needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextSeed {
    /// Rows containing any of these tokens.
    pub tokens: Vec<String>,
    /// Rows with exactly one of these signatures.
    pub signatures: Vec<String>,
    /// Every member of these groups.
    pub group_ids: Vec<Uuid>,
    pub ids: Vec<Uuid>,
    /// Also load rows sharing a signature with any loaded row. Needed when
    /// ungrouped rows may attach or form groups; user operations that only
    /// settle the groups they touched leave it off.
    pub follow_signatures: bool,
}

impl ContextSeed {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
            && self.signatures.is_empty()
            && self.group_ids.is_empty()
            && self.ids.is_empty()
    }
}

/// Load the seed rows, then close over group membership (and signatures
/// when the seed asks for it).
///
/// The result holds every member of every group it touches, which
/// [`grouping::restructure`] requires. Rows are ordered by `seq`.
pub(crate) async fn load_context(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    seed: ContextSeed,
) -> Result<Vec<Keyword>> {
    let mut loaded: BTreeMap<Uuid, Keyword> = BTreeMap::new();
    let mut seen_signatures: HashSet<String> = HashSet::new();
    let mut seen_groups: HashSet<Uuid> = HashSet::new();

    let follow_signatures = seed.follow_signatures;
    let mut tokens = seed.tokens;
    let mut ids = seed.ids;
    let mut signatures: Vec<String> = seed
        .signatures
        .into_iter()
        .filter(|s| !s.is_empty() && seen_signatures.insert(s.clone()))
        .collect();
    let mut group_ids: Vec<Uuid> = seed
        .group_ids
        .into_iter()
        .filter(|g| seen_groups.insert(*g))
        .collect();

    let mut rounds = 0usize;
    while !(tokens.is_empty() && ids.is_empty() && signatures.is_empty() && group_ids.is_empty())
    {
        rounds += 1;
        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords
             WHERE project_id = $1
               AND (tokens && $2::text[]
                    OR {SIGNATURE_SQL} = ANY($3::text[])
                    OR group_id = ANY($4::uuid[])
                    OR id = ANY($5::uuid[]))"
        ))
        .bind(project_id)
        .bind(&tokens)
        .bind(&signatures)
        .bind(&group_ids)
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

        tokens.clear();
        ids.clear();
        signatures.clear();
        group_ids.clear();

        for row in rows {
            let kw = parse_keyword_row(row)?;
            if loaded.contains_key(&kw.id) {
                continue;
            }
            let sig = signature(&kw.tokens);
            if follow_signatures && !sig.is_empty() && seen_signatures.insert(sig.clone()) {
                signatures.push(sig);
            }
            let snapshot_groups = [&kw.original_state, &kw.hidden_state]
                .into_iter()
                .filter_map(|state| state.as_ref().and_then(|s| s.group_id));
            for gid in kw.group_id.into_iter().chain(snapshot_groups) {
                if seen_groups.insert(gid) {
                    group_ids.push(gid);
                }
            }
            loaded.insert(kw.id, kw);
        }
    }

    let mut rows: Vec<Keyword> = loaded.into_values().collect();
    rows.sort_by_key(|kw| kw.seq);
    debug!(
        subsystem = "grouping",
        component = "context",
        project_id = %project_id,
        rows = rows.len(),
        rounds,
        "Loaded restructure context"
    );
    Ok(rows)
}

/// Load the given rows, failing with [`Error::NotFound`] if any is missing.
pub(crate) async fn load_by_ids(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<Keyword>> {
    let rows = sqlx::query(&format!(
        "SELECT {KEYWORD_COLUMNS} FROM keywords
         WHERE project_id = $1 AND id = ANY($2::uuid[])
         ORDER BY seq"
    ))
    .bind(project_id)
    .bind(ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(Error::Database)?;

    let keywords = rows
        .into_iter()
        .map(parse_keyword_row)
        .collect::<Result<Vec<_>>>()?;
    let wanted: HashSet<Uuid> = ids.iter().copied().collect();
    if keywords.len() != wanted.len() {
        let found: HashSet<Uuid> = keywords.iter().map(|k| k.id).collect();
        let missing: Vec<String> = wanted
            .difference(&found)
            .map(|id| id.to_string())
            .collect();
        return Err(Error::NotFound(format!("keywords {}", missing.join(", "))));
    }
    Ok(keywords)
}

/// Persist the mutable fields of each row.
pub(crate) async fn write_keywords(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[Keyword],
) -> Result<()> {
    for kw in rows {
        sqlx::query(
            "UPDATE keywords
             SET keyword = $2, tokens = $3, volume = $4, difficulty = $5, is_parent = $6,
                 group_id = $7, status = $8, blocked_by = $9, original_state = $10,
                 hidden_state = $11, updated_at = now()
             WHERE id = $1",
        )
        .bind(kw.id)
        .bind(&kw.keyword)
        .bind(&kw.tokens)
        .bind(kw.volume)
        .bind(kw.difficulty)
        .bind(kw.is_parent)
        .bind(kw.group_id)
        .bind(kw.status.as_str())
        .bind(kw.blocked_by.map(|b| b.as_str()))
        .bind(kw.original_state.as_ref().map(Json))
        .bind(kw.hidden_state.as_ref().map(Json))
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
    }
    Ok(())
}

/// Load the context for `seed`, restructure it and write back what changed.
pub(crate) async fn restructure_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    seed: ContextSeed,
    mode: AttachMode,
    preferred: &HashSet<Uuid>,
) -> Result<Restructured> {
    if seed.is_empty() {
        return Ok(Restructured::default());
    }
    let rows = load_context(tx, project_id, seed).await?;
    let out = grouping::restructure(rows, mode, preferred);
    write_keywords(tx, &out.changed).await?;
    Ok(out)
}

/// Insert one keyword as a standalone row. `None` on a text conflict.
async fn insert_keyword(tx: &mut Transaction<'_, Postgres>, kw: &Keyword) -> Result<Option<i64>> {
    let seq: Option<i64> = sqlx::query_scalar(
        "INSERT INTO keywords
             (id, project_id, keyword, tokens, volume, difficulty, original_volume,
              original_difficulty, serp_features, is_parent, group_id, status, blocked_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         ON CONFLICT (project_id, keyword) DO NOTHING
         RETURNING seq",
    )
    .bind(kw.id)
    .bind(kw.project_id)
    .bind(&kw.keyword)
    .bind(&kw.tokens)
    .bind(kw.volume)
    .bind(kw.difficulty)
    .bind(kw.original_volume)
    .bind(kw.original_difficulty)
    .bind(&kw.serp_features)
    .bind(kw.is_parent)
    .bind(kw.group_id)
    .bind(kw.status.as_str())
    .bind(kw.blocked_by.map(|b| b.as_str()))
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;
    Ok(seq)
}

/// Record the pre-merge tokens of a keyword under a merge operation.
///
/// Existing rows win, so a snapshot is never overwritten.
pub(crate) async fn record_merge_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    keyword_id: Uuid,
    merge_operation_id: Uuid,
    tokens: &[String],
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO keyword_merge_operations
             (keyword_id, merge_operation_id, original_tokens_snapshot)
         VALUES ($1, $2, $3)
         ON CONFLICT (keyword_id, merge_operation_id) DO NOTHING",
    )
    .bind(keyword_id)
    .bind(merge_operation_id)
    .bind(tokens)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;
    Ok(result.rows_affected() > 0)
}

/// Mark a keyword as hidden by a merge operation.
///
/// Keywords hidden without a token rewrite get their current tokens
/// journaled, so unmerge finds every keyword the operation hid.
pub(crate) async fn record_merge_hide(
    tx: &mut Transaction<'_, Postgres>,
    keyword_id: Uuid,
    merge_operation_id: Uuid,
    tokens: &[String],
) -> Result<()> {
    sqlx::query(
        "INSERT INTO keyword_merge_operations
             (keyword_id, merge_operation_id, original_tokens_snapshot, hidden)
         VALUES ($1, $2, $3, true)
         ON CONFLICT (keyword_id, merge_operation_id) DO UPDATE SET hidden = true",
    )
    .bind(keyword_id)
    .bind(merge_operation_id)
    .bind(tokens)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

/// PostgreSQL keyword store.
pub struct PgKeywordRepository {
    pool: Pool<Postgres>,
}

impl PgKeywordRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Visible keywords of a project in ingestion order.
    pub async fn list(&self, project_id: Uuid) -> Result<Vec<Keyword>> {
        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords
             WHERE project_id = $1 AND blocked_by IS DISTINCT FROM 'merge_hidden'
             ORDER BY seq"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(parse_keyword_row).collect()
    }

    /// Every keyword of a project, merge-hidden rows included.
    pub async fn list_all(&self, project_id: Uuid) -> Result<Vec<Keyword>> {
        let rows = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords WHERE project_id = $1 ORDER BY seq"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(parse_keyword_row).collect()
    }

    pub async fn get_by_text(&self, project_id: Uuid, text: &str) -> Result<Option<Keyword>> {
        let row = sqlx::query(&format!(
            "SELECT {KEYWORD_COLUMNS} FROM keywords WHERE project_id = $1 AND keyword = $2"
        ))
        .bind(project_id)
        .bind(kwgroup_core::normalize_keyword_text(text))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(parse_keyword_row).transpose()
    }
}

#[async_trait]
impl KeywordRepository for PgKeywordRepository {
    async fn existing_texts(&self, project_id: Uuid) -> Result<HashSet<String>> {
        let texts: Vec<String> =
            sqlx::query_scalar("SELECT keyword FROM keywords WHERE project_id = $1")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(texts.into_iter().collect())
    }

    async fn merge_operations(&self, project_id: Uuid) -> Result<Vec<MergeOperation>> {
        fetch_merge_operations(&self.pool, project_id).await
    }

    async fn insert_and_group(
        &self,
        project_id: Uuid,
        rows: Vec<NewKeyword>,
    ) -> Result<GroupingSummary> {
        let start = Instant::now();
        let mut summary = GroupingSummary::default();
        if rows.is_empty() {
            return Ok(summary);
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;

        let mut inserted: Vec<Uuid> = Vec::new();
        let mut signatures: Vec<String> = Vec::new();
        for record in rows {
            let snapshots = record.merge_snapshots.clone();
            let kw = record.into_keyword(project_id);
            let Some(_seq) = insert_keyword(&mut tx, &kw).await? else {
                summary.conflicts += 1;
                continue;
            };
            summary.inserted += 1;
            for (op_id, tokens) in &snapshots {
                record_merge_snapshot(&mut tx, kw.id, *op_id, tokens).await?;
            }
            if kw.is_groupable() {
                inserted.push(kw.id);
                signatures.push(signature(&kw.tokens));
            }
        }

        let seed = ContextSeed {
            signatures,
            follow_signatures: true,
            ..Default::default()
        };
        let out = restructure_in_tx(&mut tx, project_id, seed, AttachMode::Attach, &HashSet::new())
            .await?;
        tx.commit().await.map_err(Error::Database)?;

        let grouped: HashSet<Uuid> = out
            .rows
            .iter()
            .filter(|kw| kw.group_id.is_some())
            .map(|kw| kw.id)
            .collect();
        summary.standalone = inserted.iter().filter(|id| !grouped.contains(id)).count() as i64;
        summary.groups_created = out.stats.groups_created;
        summary.groups_extended = out.stats.groups_extended;

        debug!(
            subsystem = "grouping",
            component = "batch",
            op = "insert_and_group",
            project_id = %project_id,
            inserted = summary.inserted,
            conflicts = summary.conflicts,
            groups_created = summary.groups_created,
            groups_extended = summary.groups_extended,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch inserted"
        );
        Ok(summary)
    }

    async fn group_remaining(&self, project_id: Uuid) -> Result<RestructureStats> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_project(&mut tx, project_id).await?;

        let signatures: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT {SIGNATURE_SQL} FROM keywords
             WHERE project_id = $1 AND group_id IS NULL AND status = 'ungrouped'
               AND cardinality(tokens) > 0"
        ))
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let seed = ContextSeed {
            signatures,
            follow_signatures: true,
            ..Default::default()
        };
        let out = restructure_in_tx(&mut tx, project_id, seed, AttachMode::Attach, &HashSet::new())
            .await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "grouping",
            op = "group_remaining",
            project_id = %project_id,
            groups_created = out.stats.groups_created,
            groups_extended = out.stats.groups_extended,
            changed = out.changed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Catch-all grouping pass finished"
        );
        Ok(out.stats)
    }

    async fn counts(&self, project_id: Uuid) -> Result<KeywordCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM keywords
             WHERE project_id = $1 AND blocked_by IS DISTINCT FROM 'merge_hidden'
             GROUP BY status",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut counts = KeywordCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<KeywordStatus>()? {
                KeywordStatus::Ungrouped => counts.ungrouped = n,
                KeywordStatus::Grouped => counts.grouped = n,
                KeywordStatus::Confirmed => counts.confirmed = n,
                KeywordStatus::Blocked => counts.blocked = n,
            }
        }

        counts.groups = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT group_id) FROM keywords
             WHERE project_id = $1 AND group_id IS NOT NULL
               AND blocked_by IS DISTINCT FROM 'merge_hidden'",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(counts)
    }
}

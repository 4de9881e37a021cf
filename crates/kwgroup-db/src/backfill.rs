//! Maintenance backfill: re-tokenize stored keywords.
//!
//! Used after tokenizer changes. Keywords are re-tokenized in `seq` order,
//! the project's merge map is re-applied, and changed rows are regrouped
//! over the union of their old and new tokens. Re-running on an unchanged
//! project changes nothing.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use sqlx::{Pool, Postgres};
use tracing::{debug, info};
use uuid::Uuid;

use kwgroup_core::{analyze, AttachMode, BackfillReport, Error, Keyword, MergeMap, Result};

use crate::keywords::{
    ensure_unlocked, lock_project, parse_keyword_row, restructure_in_tx, write_keywords,
    ContextSeed, KEYWORD_COLUMNS,
};
use crate::merges::{fetch_merge_operations, upsert_merge_snapshots};

/// One keyword whose recomputed tokens differ from the stored ones.
struct Retokenized {
    keyword: Keyword,
    old_tokens: Vec<String>,
    snapshots: Vec<(Uuid, Vec<String>)>,
}

fn retokenize(page: Vec<Keyword>, merges: &MergeMap) -> Vec<Retokenized> {
    page.into_iter()
        .filter_map(|mut kw| {
            let applied = merges.apply(&analyze(&kw.keyword).tokens);
            if applied.tokens == kw.tokens {
                return None;
            }
            let old_tokens = std::mem::replace(&mut kw.tokens, applied.tokens);
            Some(Retokenized {
                keyword: kw,
                old_tokens,
                snapshots: applied.snapshots,
            })
        })
        .collect()
}

/// Backfill runner over a connection pool.
pub struct PgBackfill {
    pool: Pool<Postgres>,
}

impl PgBackfill {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Re-tokenize every keyword of a project, `batch_size` rows per
    /// transaction. A dry run reports what would change and writes nothing.
    pub async fn run(&self, project_id: Uuid, batch_size: i64, dry_run: bool) -> Result<BackfillReport> {
        if batch_size <= 0 {
            return Err(Error::Validation("batch size must be positive".to_string()));
        }
        let start = Instant::now();
        let merges = MergeMap::new(fetch_merge_operations(&self.pool, project_id).await?);
        let mut report = BackfillReport {
            dry_run,
            ..Default::default()
        };
        let mut after_seq = 0i64;

        loop {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;
            if !dry_run {
                lock_project(&mut tx, project_id).await?;
                ensure_unlocked(&mut tx, project_id).await?;
            }

            let rows = sqlx::query(&format!(
                "SELECT {KEYWORD_COLUMNS} FROM keywords
                 WHERE project_id = $1 AND seq > $2
                 ORDER BY seq
                 LIMIT $3"
            ))
            .bind(project_id)
            .bind(after_seq)
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if rows.is_empty() {
                tx.rollback().await.map_err(Error::Database)?;
                break;
            }
            let page = rows
                .into_iter()
                .map(parse_keyword_row)
                .collect::<Result<Vec<_>>>()?;
            report.scanned += page.len() as i64;
            after_seq = page.last().map(|kw| kw.seq).unwrap_or(after_seq);

            let changed = retokenize(page, &merges);
            report.changed += changed.len() as i64;
            report.merge_snapshots += changed.iter().map(|c| c.snapshots.len() as i64).sum::<i64>();

            if dry_run || changed.is_empty() {
                tx.rollback().await.map_err(Error::Database)?;
                continue;
            }

            let mut tokens: BTreeSet<String> = BTreeSet::new();
            for item in &changed {
                tokens.extend(item.old_tokens.iter().cloned());
                tokens.extend(item.keyword.tokens.iter().cloned());
                upsert_merge_snapshots(&mut tx, item.keyword.id, &item.snapshots).await?;
            }
            let keywords: Vec<Keyword> = changed.into_iter().map(|c| c.keyword).collect();
            write_keywords(&mut tx, &keywords).await?;

            let seed = ContextSeed {
                tokens: tokens.into_iter().collect(),
                ids: keywords.iter().map(|kw| kw.id).collect(),
                follow_signatures: true,
                ..Default::default()
            };
            let out =
                restructure_in_tx(&mut tx, project_id, seed, AttachMode::Attach, &HashSet::new())
                    .await?;
            tx.commit().await.map_err(Error::Database)?;

            debug!(
                subsystem = "backfill",
                project_id = %project_id,
                after_seq,
                changed = keywords.len(),
                regrouped = out.changed.len(),
                "Backfill page written"
            );
        }

        info!(
            subsystem = "backfill",
            project_id = %project_id,
            scanned = report.scanned,
            changed = report.changed,
            merge_snapshots = report.merge_snapshots,
            dry_run,
            duration_ms = start.elapsed().as_millis() as u64,
            "Backfill finished"
        );
        Ok(report)
    }
}

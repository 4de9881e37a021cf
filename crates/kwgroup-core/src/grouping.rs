//! Pure grouping logic over in-memory keyword rows.
//!
//! Storage backends load the affected rows, call [`restructure`],
//! [`plan_regroup`] or [`plan_ungroup`], and write back the rows those
//! functions report as changed. Nothing here performs I/O.
//!
//! Parent election everywhere: highest original volume, then lower original
//! difficulty (missing sorts last), then lowest `seq`, then id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::defaults::DIFFICULTY_DECIMALS;
use crate::error::{Error, Result};
use crate::models::{normalize_keyword_text, Keyword, KeywordStatus};
use crate::tokenizer;
use crate::uuid_utils::new_v7;

/// Separator between tokens in a serialized signature (ASCII unit separator).
///
/// Must match `array_to_string(tokens, chr(31))` on the SQL side.
pub const SIGNATURE_SEPARATOR: char = '\u{1f}';

/// Serialized token signature. Tokens are expected sorted and unique.
pub fn signature(tokens: &[String]) -> String {
    let mut sig = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            sig.push(SIGNATURE_SEPARATOR);
        }
        sig.push_str(token);
    }
    sig
}

/// Round to the number of decimals kept on aggregated difficulty.
pub fn round_difficulty(value: f64) -> f64 {
    let factor = 10f64.powi(DIFFICULTY_DECIMALS);
    (value * factor).round() / factor
}

/// Aggregated parent values for a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub volume: i64,
    pub difficulty: Option<f64>,
}

/// Sum of original volumes and rounded mean of non-null original difficulties.
pub fn aggregate<'a>(members: impl IntoIterator<Item = &'a Keyword>) -> Aggregate {
    let mut volume = 0i64;
    let mut difficulty_sum = 0f64;
    let mut difficulty_count = 0usize;
    for kw in members {
        volume += kw.original_volume;
        if let Some(d) = kw.original_difficulty {
            difficulty_sum += d;
            difficulty_count += 1;
        }
    }
    Aggregate {
        volume,
        difficulty: (difficulty_count > 0)
            .then(|| round_difficulty(difficulty_sum / difficulty_count as f64)),
    }
}

/// Ordering where the preferred parent sorts first.
pub fn parent_order(a: &Keyword, b: &Keyword) -> Ordering {
    b.original_volume
        .cmp(&a.original_volume)
        .then_with(|| match (a.original_difficulty, b.original_difficulty) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.seq.cmp(&b.seq))
        .then_with(|| a.id.cmp(&b.id))
}

/// Index of the elected parent among `candidates` (indices into `rows`).
pub fn elect_parent(rows: &[Keyword], candidates: &[usize]) -> Option<usize> {
    candidates
        .iter()
        .copied()
        .min_by(|&a, &b| parent_order(&rows[a], &rows[b]))
}

/// How restructuring treats ungrouped keywords that match a grouped parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Fold them under the parent as merge-hidden children.
    Hide,
    /// Attach them as visible children.
    Attach,
    /// Leave them standalone.
    Leave,
}

/// Counters reported by [`restructure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestructureStats {
    pub groups_created: i64,
    pub groups_extended: i64,
    pub groups_dissolved: i64,
    /// Members split off an auto group whose signature they no longer share.
    pub split: i64,
    pub hidden: i64,
    pub unhidden: i64,
}

/// Rows after restructuring, plus the subset that changed.
#[derive(Debug, Clone, Default)]
pub struct Restructured {
    pub rows: Vec<Keyword>,
    pub changed: Vec<Keyword>,
    /// Keywords hidden by this call (`Hide` mode only).
    pub hidden: Vec<Uuid>,
    pub stats: RestructureStats,
}

/// True when a visible member carries a user regroup snapshot.
///
/// Manual groups are never split by signature and keep their chosen parent.
pub fn is_manual_group<'a>(members: impl IntoIterator<Item = &'a Keyword>) -> bool {
    members
        .into_iter()
        .any(|kw| !kw.is_hidden() && kw.original_state.is_some())
}

fn group_members(rows: &[Keyword]) -> BTreeMap<Uuid, Vec<usize>> {
    let mut groups: BTreeMap<Uuid, Vec<usize>> = BTreeMap::new();
    for (i, kw) in rows.iter().enumerate() {
        if let Some(gid) = kw.group_id {
            groups.entry(gid).or_default().push(i);
        }
    }
    groups
}

/// Settle one group: pick its parent and recompute aggregates.
///
/// Dissolves groups left with a single visible member and no hidden ones,
/// and unhides hidden members of groups with no visible member left.
/// Returns false when the group no longer exists.
fn settle_group(
    rows: &mut [Keyword],
    members: &[usize],
    reelect: bool,
    preferred: &HashSet<Uuid>,
    stats: &mut RestructureStats,
) -> bool {
    let visible: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| !rows[i].is_hidden())
        .collect();
    let hidden: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| rows[i].is_hidden())
        .collect();

    if visible.is_empty() {
        for &i in &hidden {
            rows[i].unhide();
            stats.unhidden += 1;
        }
        if !hidden.is_empty() {
            stats.groups_dissolved += 1;
        }
        return false;
    }
    if visible.len() == 1 && hidden.is_empty() {
        rows[visible[0]].make_standalone();
        stats.groups_dissolved += 1;
        return false;
    }

    let parents: Vec<usize> = visible
        .iter()
        .copied()
        .filter(|&i| rows[i].is_parent)
        .collect();
    let restored: Vec<usize> = parents
        .iter()
        .copied()
        .filter(|&i| preferred.contains(&rows[i].id))
        .collect();

    let chosen = if !restored.is_empty() {
        elect_parent(rows, &restored)
    } else if reelect || parents.is_empty() {
        elect_parent(rows, &visible)
    } else {
        elect_parent(rows, &parents)
    };
    let Some(parent) = chosen else {
        return false;
    };

    let group_status = if visible
        .iter()
        .any(|&i| rows[i].status == KeywordStatus::Confirmed)
    {
        KeywordStatus::Confirmed
    } else {
        KeywordStatus::Grouped
    };
    let totals = aggregate(members.iter().map(|&i| &rows[i]));

    for &i in &visible {
        let kw = &mut rows[i];
        kw.status = group_status;
        kw.blocked_by = None;
        if i == parent {
            kw.is_parent = true;
            kw.volume = totals.volume;
            kw.difficulty = totals.difficulty;
        } else {
            kw.is_parent = false;
            kw.volume = kw.original_volume;
            kw.difficulty = kw.original_difficulty;
        }
    }
    for &i in &hidden {
        let kw = &mut rows[i];
        kw.is_parent = false;
        kw.volume = kw.original_volume;
        kw.difficulty = kw.original_difficulty;
    }
    true
}

/// Restricted regrouping over a loaded set of rows.
///
/// `rows` must hold every member of any group it touches. `preferred` names
/// keywords whose restored parent role wins over a parent elected since.
///
/// 1. Auto groups drop members whose signature differs from the parent's.
/// 2. Every group is settled (dissolve, unhide, parent, aggregates).
/// 3. Ungrouped keywords sharing a signature that matches no grouped parent
///    form new groups.
/// 4. Ungrouped keywords matching a grouped parent follow `mode`.
pub fn restructure(
    rows: Vec<Keyword>,
    mode: AttachMode,
    preferred: &HashSet<Uuid>,
) -> Restructured {
    let before = rows.clone();
    let mut rows = rows;
    let mut stats = RestructureStats::default();

    // Step 1 and 2: repair existing groups.
    let mut surviving: Vec<(Uuid, bool)> = Vec::new();
    for (gid, members) in group_members(&rows) {
        let manual = is_manual_group(members.iter().map(|&i| &rows[i]));
        let confirmed = members
            .iter()
            .any(|&i| rows[i].status == KeywordStatus::Confirmed);

        let mut kept = members.clone();
        if !manual {
            let visible: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| !rows[i].is_hidden())
                .collect();
            let parents: Vec<usize> = visible
                .iter()
                .copied()
                .filter(|&i| rows[i].is_parent)
                .collect();
            let anchor = elect_parent(&rows, &parents).or_else(|| elect_parent(&rows, &visible));
            if let Some(anchor) = anchor {
                let anchor_sig = signature(&rows[anchor].tokens);
                kept.clear();
                for &i in &members {
                    let kw = &mut rows[i];
                    if signature(&kw.tokens) == anchor_sig && kw.status != KeywordStatus::Blocked {
                        kept.push(i);
                    } else if kw.is_hidden() {
                        kw.unhide();
                        stats.unhidden += 1;
                    } else {
                        kw.make_standalone();
                        stats.split += 1;
                    }
                }
            }
        }

        let reelect = !manual && !confirmed;
        if settle_group(&mut rows, &kept, reelect, preferred, &mut stats) {
            surviving.push((gid, reelect));
        }
    }

    // Grouped parent per signature; lowest parent seq wins on duplicates.
    let mut by_signature: HashMap<String, (Uuid, usize)> = HashMap::new();
    for (i, kw) in rows.iter().enumerate() {
        if let (Some(gid), true) = (kw.group_id, kw.is_parent && !kw.is_hidden()) {
            let sig = signature(&kw.tokens);
            if sig.is_empty() {
                continue;
            }
            match by_signature.get(&sig) {
                Some(&(_, existing)) if parent_order_by_seq(&rows[existing], kw).is_le() => {}
                _ => {
                    by_signature.insert(sig, (gid, i));
                }
            }
        }
    }

    // Step 3 and 4: bucket ungrouped keywords by signature.
    let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, kw) in rows.iter().enumerate() {
        if kw.group_id.is_none() && kw.is_groupable() {
            let sig = signature(&kw.tokens);
            if !sig.is_empty() {
                buckets.entry(sig).or_default().push(i);
            }
        }
    }

    let reelect_of: HashMap<Uuid, bool> = surviving.iter().copied().collect();
    let mut extended: BTreeMap<Uuid, bool> = BTreeMap::new();
    let mut hidden: Vec<Uuid> = Vec::new();

    for (sig, bucket) in buckets {
        if let Some(&(gid, _)) = by_signature.get(&sig) {
            match mode {
                AttachMode::Leave => {}
                AttachMode::Attach => {
                    for &i in &bucket {
                        let kw = &mut rows[i];
                        kw.group_id = Some(gid);
                        kw.is_parent = false;
                        kw.status = KeywordStatus::Grouped;
                    }
                    extended.insert(gid, reelect_of.get(&gid).copied().unwrap_or(true));
                }
                AttachMode::Hide => {
                    for &i in &bucket {
                        rows[i].hide_under(gid);
                        hidden.push(rows[i].id);
                        stats.hidden += 1;
                    }
                    extended.insert(gid, false);
                }
            }
            continue;
        }

        if bucket.len() < 2 {
            let kw = &mut rows[bucket[0]];
            kw.make_standalone();
            continue;
        }

        let gid = new_v7();
        for &i in &bucket {
            let kw = &mut rows[i];
            kw.group_id = Some(gid);
            kw.status = KeywordStatus::Grouped;
        }
        settle_group(&mut rows, &bucket, true, preferred, &mut stats);
        stats.groups_created += 1;
    }

    if !extended.is_empty() {
        let groups = group_members(&rows);
        for (gid, reelect) in extended {
            if let Some(members) = groups.get(&gid) {
                settle_group(&mut rows, members, reelect, preferred, &mut stats);
                stats.groups_extended += 1;
            }
        }
    }

    let changed = rows
        .iter()
        .zip(before.iter())
        .filter(|(after, before)| after != before)
        .map(|(after, _)| after.clone())
        .collect();

    Restructured {
        rows,
        changed,
        hidden,
        stats,
    }
}

fn parent_order_by_seq(a: &Keyword, b: &Keyword) -> Ordering {
    a.seq.cmp(&b.seq).then_with(|| a.id.cmp(&b.id))
}

/// Outcome of planning a user regroup.
#[derive(Debug, Clone)]
pub struct RegroupPlan {
    pub group_id: Uuid,
    pub parent_id: Uuid,
    /// Selected keywords after the regroup.
    pub members: Vec<Keyword>,
}

/// Regroup the selected keywords under a new group named `group_name`.
///
/// A group needs at least two keywords. Every selected keyword is
/// snapshotted once before mutation. The parent is
/// the selected keyword whose text already equals the name, otherwise the
/// elected one, renamed to the name. `name_taken` reports whether the
/// normalized name belongs to a keyword outside the selection.
pub fn plan_regroup(
    selected: Vec<Keyword>,
    group_name: &str,
    name_taken: bool,
) -> Result<RegroupPlan> {
    if selected.is_empty() {
        return Err(Error::Validation("no keywords selected".to_string()));
    }
    if selected.len() < 2 {
        return Err(Error::Validation(
            "select at least two keywords to form a group".to_string(),
        ));
    }
    let name = normalize_keyword_text(group_name);
    if name.is_empty() {
        return Err(Error::Validation("group name is required".to_string()));
    }
    if name_taken {
        return Err(Error::Validation(format!(
            "keyword '{name}' already exists outside the selection"
        )));
    }

    let mut members = selected;
    for kw in members.iter_mut() {
        kw.snapshot_once();
    }

    let all: Vec<usize> = (0..members.len()).collect();
    let parent = members
        .iter()
        .position(|kw| kw.keyword == name)
        .or_else(|| elect_parent(&members, &all))
        .ok_or_else(|| Error::Internal("empty selection after validation".to_string()))?;

    let group_id = new_v7();
    let totals = aggregate(members.iter());
    for (i, kw) in members.iter_mut().enumerate() {
        kw.group_id = Some(group_id);
        kw.status = KeywordStatus::Grouped;
        kw.blocked_by = None;
        if i == parent {
            kw.is_parent = true;
            kw.keyword = name.clone();
            kw.tokens = tokenizer::analyze(&name).tokens;
            kw.volume = totals.volume;
            kw.difficulty = totals.difficulty;
        } else {
            kw.is_parent = false;
            kw.volume = kw.original_volume;
            kw.difficulty = kw.original_difficulty;
        }
    }

    Ok(RegroupPlan {
        group_id,
        parent_id: members[parent].id,
        members,
    })
}

/// Expand a selection so that a selected parent brings its whole group.
pub fn expand_selection(selected_ids: &[Uuid], rows: &[Keyword]) -> Vec<Uuid> {
    let wanted: HashSet<Uuid> = selected_ids.iter().copied().collect();
    let parent_groups: HashSet<Uuid> = rows
        .iter()
        .filter(|kw| wanted.contains(&kw.id) && kw.is_parent)
        .filter_map(|kw| kw.group_id)
        .collect();

    let mut ids: Vec<Uuid> = rows
        .iter()
        .filter(|kw| {
            wanted.contains(&kw.id)
                || kw
                    .group_id
                    .map(|g| parent_groups.contains(&g) && !kw.is_hidden())
                    .unwrap_or(false)
        })
        .map(|kw| kw.id)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Restore the given keywords from their snapshots (or the fallback reset).
///
/// Merge-hidden keywords are unhidden instead.
///
/// Returns the restored rows; their ids are the preferred parents when the
/// caller restructures afterwards.
pub fn plan_ungroup(selected: Vec<Keyword>) -> Result<Vec<Keyword>> {
    if selected.is_empty() {
        return Err(Error::Validation("no keywords selected".to_string()));
    }
    Ok(selected
        .into_iter()
        .map(|mut kw| {
            if kw.is_hidden() {
                kw.unhide();
            } else {
                let plan = kw.restore_plan();
                kw.restore(plan);
            }
            kw
        })
        .collect())
}

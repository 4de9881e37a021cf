//! Token merge planning.
//!
//! Existing merge operations form a small directed graph with one edge per
//! child token (child -> parent). The graph is kept flat: a parent token is
//! never itself a child. [`MergeGraph::plan`] validates a new merge against
//! that graph and folds in operations whose parent becomes a child.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::MergeOperation;
use crate::tokenizer::sorted_unique;

/// Normalize a user-supplied token: trimmed and lowercased.
pub fn normalize_token(token: &str) -> String {
    token.trim().to_lowercase()
}

/// Replace every child token with the parent token, then sort and dedupe.
pub fn rewrite_tokens(tokens: &[String], parent: &str, children: &BTreeSet<String>) -> Vec<String> {
    let rewritten = tokens
        .iter()
        .map(|t| {
            if children.contains(t) {
                parent.to_string()
            } else {
                t.clone()
            }
        })
        .collect();
    sorted_unique(rewritten)
}

/// Validated plan for one merge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub parent_token: String,
    /// Final child set of the surviving operation.
    pub child_tokens: BTreeSet<String>,
    /// Existing operation with the same parent that is extended, if any.
    pub extends: Option<Uuid>,
    /// Operations folded into this one; deleted after their join rows move.
    pub absorbed: Vec<MergeOperation>,
}

impl MergePlan {
    /// Every token whose keywords need restructuring.
    pub fn affected_tokens(&self) -> Vec<String> {
        let mut tokens: BTreeSet<String> = self.child_tokens.clone();
        tokens.insert(self.parent_token.clone());
        tokens.into_iter().collect()
    }
}

/// Graph of a project's merge operations.
#[derive(Debug, Clone, Default)]
pub struct MergeGraph {
    operations: Vec<MergeOperation>,
    /// child token -> index of the operation that owns it
    child_of: BTreeMap<String, usize>,
    /// parent token -> index of its operation
    parent_of: BTreeMap<String, usize>,
}

impl MergeGraph {
    pub fn new(operations: Vec<MergeOperation>) -> Self {
        let mut child_of = BTreeMap::new();
        let mut parent_of = BTreeMap::new();
        for (i, op) in operations.iter().enumerate() {
            parent_of.insert(op.parent_token.clone(), i);
            for child in &op.child_tokens {
                child_of.insert(child.clone(), i);
            }
        }
        Self {
            operations,
            child_of,
            parent_of,
        }
    }

    pub fn operations(&self) -> &[MergeOperation] {
        &self.operations
    }

    /// Operation whose parent token is `token`.
    pub fn by_parent(&self, token: &str) -> Option<&MergeOperation> {
        self.parent_of.get(token).map(|&i| &self.operations[i])
    }

    /// Validate `merge(parent, children)` and compute the resulting operation.
    pub fn plan(&self, parent: &str, children: &[String]) -> Result<MergePlan> {
        let parent = normalize_token(parent);
        if parent.is_empty() {
            return Err(Error::Validation("parent token is required".to_string()));
        }
        let requested: BTreeSet<String> = children
            .iter()
            .map(|c| normalize_token(c))
            .filter(|c| !c.is_empty())
            .collect();
        if requested.is_empty() {
            return Err(Error::Validation("at least one child token is required".to_string()));
        }
        if requested.contains(&parent) {
            return Err(Error::Validation(format!(
                "cyclic merge: '{parent}' cannot be merged into itself"
            )));
        }

        let extended = self.parent_of.get(&parent).copied();

        let mut child_tokens = requested.clone();
        if let Some(i) = extended {
            child_tokens.extend(self.operations[i].child_tokens.iter().cloned());
        }

        // Fold in operations whose parent is one of the new children.
        let mut absorbed_idx: BTreeSet<usize> = BTreeSet::new();
        let mut frontier: Vec<String> = requested.iter().cloned().collect();
        while let Some(token) = frontier.pop() {
            let Some(&i) = self.parent_of.get(&token) else {
                continue;
            };
            if Some(i) == extended || !absorbed_idx.insert(i) {
                continue;
            }
            for child in &self.operations[i].child_tokens {
                if child_tokens.insert(child.clone()) {
                    frontier.push(child.clone());
                }
            }
        }

        if child_tokens.contains(&parent) {
            return Err(Error::Validation(format!(
                "cyclic merge: '{parent}' would become its own descendant"
            )));
        }

        if let Some(&owner) = self.child_of.get(&parent) {
            return Err(Error::Validation(format!(
                "'{parent}' is already merged into '{}'",
                self.operations[owner].parent_token
            )));
        }
        for child in &requested {
            if let Some(&owner) = self.child_of.get(child) {
                if Some(owner) != extended && !absorbed_idx.contains(&owner) {
                    return Err(Error::Validation(format!(
                        "'{child}' is already merged into '{}'",
                        self.operations[owner].parent_token
                    )));
                }
            }
        }

        Ok(MergePlan {
            parent_token: parent,
            child_tokens,
            extends: extended.map(|i| self.operations[i].id),
            absorbed: absorbed_idx
                .into_iter()
                .map(|i| self.operations[i].clone())
                .collect(),
        })
    }
}

/// Merge operations applied to token lists at ingestion and backfill time.
#[derive(Debug, Clone, Default)]
pub struct MergeMap {
    operations: Vec<(Uuid, String, BTreeSet<String>)>,
}

/// Tokens after applying a merge map, with the snapshot each operation takes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeApplication {
    pub tokens: Vec<String>,
    /// `(merge_operations.id, tokens before that operation)`
    pub snapshots: Vec<(Uuid, Vec<String>)>,
}

impl MergeMap {
    /// Build from operations in creation order.
    pub fn new(mut operations: Vec<MergeOperation>) -> Self {
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self {
            operations: operations
                .into_iter()
                .map(|op| (op.id, op.parent_token, op.child_tokens.into_iter().collect()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations other than `excluded`, in the same order.
    pub fn without(&self, excluded: &[Uuid]) -> Self {
        Self {
            operations: self
                .operations
                .iter()
                .filter(|(id, _, _)| !excluded.contains(id))
                .cloned()
                .collect(),
        }
    }

    /// Rewrite tokens through every operation that touches them.
    pub fn apply(&self, tokens: &[String]) -> MergeApplication {
        let mut current = tokens.to_vec();
        let mut snapshots = Vec::new();
        for (id, parent, children) in &self.operations {
            if current.iter().any(|t| children.contains(t)) {
                snapshots.push((*id, current.clone()));
                current = rewrite_tokens(&current, parent, children);
            }
        }
        MergeApplication {
            tokens: current,
            snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn op(parent: &str, children: &[&str], age_secs: i64) -> MergeOperation {
        MergeOperation {
            id: Uuid::new_v4(),
            project_id: Uuid::nil(),
            parent_token: parent.to_string(),
            child_tokens: children.iter().map(|c| c.to_string()).collect(),
            operation_id: Uuid::new_v4(),
            created_by: None,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rewrite_tokens_dedupes() {
        let tokens = strings(&["boot", "shoe", "sneaker"]);
        assert_eq!(
            rewrite_tokens(&tokens, "shoe", &set(&["sneaker", "boot"])),
            strings(&["shoe"])
        );
        assert_eq!(
            rewrite_tokens(&strings(&["red", "sneaker"]), "shoe", &set(&["sneaker"])),
            strings(&["red", "shoe"])
        );
    }

    #[test]
    fn test_plan_fresh_merge() {
        let plan = MergeGraph::default()
            .plan(" Shoe ", &strings(&["sneaker", "boot", "boot"]))
            .unwrap();
        assert_eq!(plan.parent_token, "shoe");
        assert_eq!(plan.child_tokens, set(&["boot", "sneaker"]));
        assert!(plan.extends.is_none());
        assert!(plan.absorbed.is_empty());
        assert_eq!(plan.affected_tokens(), strings(&["boot", "shoe", "sneaker"]));
    }

    #[test]
    fn test_plan_rejects_empty_and_self_merge() {
        let graph = MergeGraph::default();
        assert!(matches!(graph.plan("shoe", &[]), Err(Error::Validation(_))));
        assert!(matches!(graph.plan("  ", &strings(&["a"])), Err(Error::Validation(_))));
        assert!(matches!(
            graph.plan("shoe", &strings(&["shoe"])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_plan_extends_existing_parent() {
        let existing = op("shoe", &["sneaker"], 10);
        let graph = MergeGraph::new(vec![existing.clone()]);
        let plan = graph.plan("shoe", &strings(&["boot"])).unwrap();
        assert_eq!(plan.extends, Some(existing.id));
        assert_eq!(plan.child_tokens, set(&["boot", "sneaker"]));
    }

    #[test]
    fn test_plan_flattens_chain() {
        // footwear <- shoe <- sneaker becomes footwear <- {shoe, sneaker}
        let existing = op("shoe", &["sneaker", "trainer"], 10);
        let graph = MergeGraph::new(vec![existing.clone()]);
        let plan = graph.plan("footwear", &strings(&["shoe"])).unwrap();
        assert_eq!(plan.child_tokens, set(&["shoe", "sneaker", "trainer"]));
        assert_eq!(plan.absorbed, vec![existing]);
    }

    #[test]
    fn test_plan_rejects_cycle_through_absorption() {
        let graph = MergeGraph::new(vec![op("boot", &["shoe"], 10)]);
        let err = graph.plan("shoe", &strings(&["boot"])).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_plan_rejects_child_owned_elsewhere() {
        let graph = MergeGraph::new(vec![op("shoe", &["sneaker"], 10)]);
        assert!(matches!(
            graph.plan("boot", &strings(&["sneaker"])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_plan_rejects_parent_that_is_a_child() {
        let graph = MergeGraph::new(vec![op("shoe", &["sneaker"], 10)]);
        assert!(matches!(
            graph.plan("sneaker", &strings(&["trainer"])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_merge_map_applies_in_creation_order() {
        let first = op("shoe", &["sneaker"], 20);
        let second = op("cheap", &["budget"], 10);
        let map = MergeMap::new(vec![second.clone(), first.clone()]);

        let applied = map.apply(&strings(&["budget", "sneaker"]));
        assert_eq!(applied.tokens, strings(&["cheap", "shoe"]));
        assert_eq!(
            applied.snapshots,
            vec![
                (first.id, strings(&["budget", "sneaker"])),
                (second.id, strings(&["budget", "shoe"])),
            ]
        );

        let untouched = map.apply(&strings(&["boot"]));
        assert_eq!(untouched.tokens, strings(&["boot"]));
        assert!(untouched.snapshots.is_empty());
    }

    #[test]
    fn test_merge_map_without_excludes() {
        let first = op("shoe", &["sneaker"], 20);
        let map = MergeMap::new(vec![first.clone()]).without(&[first.id]);
        assert!(map.is_empty());
        assert_eq!(map.apply(&strings(&["sneaker"])).tokens, strings(&["sneaker"]));
    }
}

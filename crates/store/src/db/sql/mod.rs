//! Wrapper functions for SQL statements.

#[macro_use]
pub(crate) mod utils;

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::params;
use utils::{read_edge_type, rule_from_row};

use super::{EdgeInvalidation, EdgeType, Result, Rule, RuleAction};
use crate::{AccountId, db::transaction::Transaction, errors::DatabaseError};

// ACCOUNT QUERIES
// ================================================================================================

/// Inserts a new account row and returns its generated id.
pub fn insert_account(transaction: &Transaction) -> Result<AccountId> {
    let mut stmt = transaction.prepare_cached("INSERT INTO accounts DEFAULT VALUES")?;
    stmt.execute([])?;

    Ok(transaction.last_insert_rowid())
}

/// Deletes the account row with the given id.
///
/// Absent rows simply do not match; this is not an error.
pub fn delete_account(transaction: &Transaction, account_id: AccountId) -> Result<usize> {
    let mut stmt = transaction.prepare_cached("DELETE FROM accounts WHERE id = ?1")?;

    Ok(stmt.execute(params![account_id])?)
}

// AUTHENTICATOR QUERIES
// ================================================================================================

/// Inserts a new authenticator tuple.
///
/// # Returns
///
/// A uniqueness violation on the name surfaces as a [`DatabaseError::SqliteError`]; use
/// [`DatabaseError::is_unique_violation`] to classify it.
pub fn insert_authenticator(
    transaction: &Transaction,
    name: &str,
    verifier: &str,
    account: AccountId,
) -> Result<()> {
    let mut stmt =
        transaction.prepare_cached(insert_sql!(authenticators { name, verifier, account }))?;
    stmt.execute(params![name, verifier, account])?;

    Ok(())
}

pub fn delete_authenticator(transaction: &Transaction, name: &str) -> Result<usize> {
    let mut stmt = transaction.prepare_cached("DELETE FROM authenticators WHERE name = ?1")?;

    Ok(stmt.execute(params![name])?)
}

/// Deletes every authenticator owned by the given account.
pub fn delete_authenticators_by_account(
    transaction: &Transaction,
    account_id: AccountId,
) -> Result<usize> {
    let mut stmt = transaction.prepare_cached("DELETE FROM authenticators WHERE account = ?1")?;

    Ok(stmt.execute(params![account_id])?)
}

/// Selects the stored verifier for the named authenticator.
pub fn select_authenticator_verifier(
    transaction: &Transaction,
    name: &str,
) -> Result<Option<String>> {
    let mut stmt =
        transaction.prepare_cached("SELECT verifier FROM authenticators WHERE name = ?1")?;
    let mut rows = stmt.query(params![name])?;

    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

// GROUP QUERIES
// ================================================================================================

/// Inserts a new group row.
///
/// # Returns
///
/// A uniqueness violation on the name surfaces as a [`DatabaseError::SqliteError`]; use
/// [`DatabaseError::is_unique_violation`] to classify it.
pub fn insert_group(transaction: &Transaction, name: &str) -> Result<()> {
    let mut stmt = transaction.prepare_cached(insert_sql!(groups { name }))?;
    stmt.execute(params![name])?;

    Ok(())
}

pub fn delete_group(transaction: &Transaction, name: &str) -> Result<usize> {
    let mut stmt = transaction.prepare_cached("DELETE FROM groups WHERE name = ?1")?;

    Ok(stmt.execute(params![name])?)
}

pub fn group_exists(transaction: &Transaction, name: &str) -> Result<bool> {
    let mut stmt = transaction.prepare_cached("SELECT 1 FROM groups WHERE name = ?1")?;

    Ok(stmt.exists(params![name])?)
}

/// Deletes every edge that mentions the given group as either endpoint.
pub fn delete_edges_mentioning(transaction: &Transaction, name: &str) -> Result<usize> {
    let mut stmt = transaction
        .prepare_cached("DELETE FROM group_members WHERE parent = ?1 OR child = ?1")?;

    Ok(stmt.execute(params![name])?)
}

// EDGE QUERIES
// ================================================================================================

/// Inserts an edge row, silently keeping the existing row on an endpoint collision.
///
/// The `(parent, child)` pair is the table's primary key, so a second edge with the same
/// endpoints is discarded even when its edgetype differs.
pub fn insert_edge(
    transaction: &Transaction,
    parent: &str,
    child: &str,
    edgetype: EdgeType,
) -> Result<()> {
    let mut stmt = transaction
        .prepare_cached(insert_sql!(group_members { parent, child, edgetype } | ignore))?;
    stmt.execute(params![parent, child, edgetype.as_str()])?;

    Ok(())
}

/// Deletes the edge row matching the exact `(parent, child, edgetype)` triple.
pub fn delete_edge(
    transaction: &Transaction,
    parent: &str,
    child: &str,
    edgetype: EdgeType,
) -> Result<usize> {
    let mut stmt = transaction.prepare_cached(
        "DELETE FROM group_members WHERE parent = ?1 AND child = ?2 AND edgetype = ?3",
    )?;

    Ok(stmt.execute(params![parent, child, edgetype.as_str()])?)
}

/// Selects a group's direct members as `(edgetype, child)` pairs.
///
/// # Returns
///
/// The empty set for an unknown group.
pub fn select_members(
    transaction: &Transaction,
    group: &str,
) -> Result<BTreeSet<(EdgeType, String)>> {
    let mut stmt = transaction
        .prepare_cached("SELECT edgetype, child FROM group_members WHERE parent = ?1")?;
    let mut rows = stmt.query(params![group])?;

    let mut members = BTreeSet::new();
    while let Some(row) = rows.next()? {
        members.insert((read_edge_type(row, 0)?, row.get(1)?));
    }

    Ok(members)
}

pub fn edge_exists(transaction: &Transaction, parent: &str, child: &str) -> Result<bool> {
    let mut stmt = transaction
        .prepare_cached("SELECT 1 FROM group_members WHERE parent = ?1 AND child = ?2")?;

    Ok(stmt.exists(params![parent, child])?)
}

fn select_children(transaction: &Transaction, parent: &str) -> Result<BTreeSet<String>> {
    let mut stmt =
        transaction.prepare_cached("SELECT child FROM group_members WHERE parent = ?1")?;
    let mut rows = stmt.query(params![parent])?;

    let mut children = BTreeSet::new();
    while let Some(row) = rows.next()? {
        children.insert(row.get(0)?);
    }

    Ok(children)
}

/// Selects the direct parents of a node (a group name or an account leaf).
pub fn select_parents(transaction: &Transaction, child: &str) -> Result<BTreeSet<String>> {
    let mut stmt =
        transaction.prepare_cached("SELECT parent FROM group_members WHERE child = ?1")?;
    let mut rows = stmt.query(params![child])?;

    let mut parents = BTreeSet::new();
    while let Some(row) = rows.next()? {
        parents.insert(row.get(0)?);
    }

    Ok(parents)
}

// EXPANSION QUERIES
// ================================================================================================

/// Computes the set of accounts that are effective members of the given group.
///
/// Folds the group's direct members by edgetype: the union of `or` children and `account`
/// leaves, joined with the intersection of all `and` children, minus the union of all `not`
/// children. An `and` fold over zero edges is empty, not universal, and pruning is local to
/// this group's own fold.
///
/// `memo` is populated with an empty set before recursing, so cycles bottom out instead of
/// looping; the entry is overwritten with the final expansion afterwards.
pub fn expand_accounts(
    transaction: &Transaction,
    group: &str,
    memo: &mut BTreeMap<String, BTreeSet<AccountId>>,
) -> Result<BTreeSet<AccountId>> {
    if let Some(expansion) = memo.get(group) {
        return Ok(expansion.clone());
    }
    memo.insert(group.to_string(), BTreeSet::new());

    let mut union = BTreeSet::new();
    let mut intersection: Option<BTreeSet<AccountId>> = None;
    let mut prune = BTreeSet::new();

    for (edgetype, child) in select_members(transaction, group)? {
        match edgetype {
            EdgeType::Account => {
                let account = child.parse::<AccountId>().map_err(|_| {
                    DatabaseError::DataCorrupted(format!(
                        "account edge child '{child}' is not an integer"
                    ))
                })?;
                union.insert(account);
            },
            EdgeType::Or => {
                union.extend(expand_accounts(transaction, &child, memo)?);
            },
            EdgeType::And => {
                let accounts = expand_accounts(transaction, &child, memo)?;
                intersection = Some(match intersection {
                    Some(existing) => existing.intersection(&accounts).copied().collect(),
                    None => accounts,
                });
            },
            EdgeType::Not => {
                prune.extend(expand_accounts(transaction, &child, memo)?);
            },
        }
    }

    if let Some(intersection) = intersection {
        union.extend(intersection);
    }
    let expansion: BTreeSet<AccountId> = union.difference(&prune).copied().collect();

    memo.insert(group.to_string(), expansion.clone());

    Ok(expansion)
}

/// Collects every node transitively reachable from `node` along `parent -> child` edges,
/// regardless of edgetype. The node itself is included only when it sits on a cycle.
pub fn expand_descendants(transaction: &Transaction, node: &str) -> Result<BTreeSet<String>> {
    let mut reached = BTreeSet::new();
    let mut frontier = vec![node.to_string()];

    while let Some(current) = frontier.pop() {
        for child in select_children(transaction, &current)? {
            if reached.insert(child.clone()) {
                frontier.push(child);
            }
        }
    }

    Ok(reached)
}

/// Collects every node from which `node` is reachable along `parent -> child` edges. The
/// mirror image of [`expand_descendants`].
pub fn expand_ancestors(transaction: &Transaction, node: &str) -> Result<BTreeSet<String>> {
    let mut reached = BTreeSet::new();
    let mut frontier = vec![node.to_string()];

    while let Some(current) = frontier.pop() {
        for parent in select_parents(transaction, &current)? {
            if reached.insert(parent.clone()) {
                frontier.push(parent);
            }
        }
    }

    Ok(reached)
}

/// Computes the cache keys staled by a mutation of the `(parent, child)` edge.
///
/// Must run against the pre-mutation graph: the upward set is the parent plus its ancestors,
/// whose account and descendant expansions may have depended on the edge; the downward set is
/// the child plus its descendants, whose ancestor expansions may have.
pub fn edge_invalidation(
    transaction: &Transaction,
    parent: &str,
    child: &str,
) -> Result<EdgeInvalidation> {
    let mut upward = expand_ancestors(transaction, parent)?;
    upward.insert(parent.to_string());

    let mut downward = expand_descendants(transaction, child)?;
    downward.insert(child.to_string());

    Ok(EdgeInvalidation { upward, downward })
}

// RULE QUERIES
// ================================================================================================

/// Selects the highest rule order currently assigned within a group, or 0 if the group has no
/// rules.
pub fn select_max_rule_order(transaction: &Transaction, group: &str) -> Result<i64> {
    let mut stmt = transaction
        .prepare_cached("SELECT COALESCE(MAX(\"order\"), 0) FROM rules WHERE \"group\" = ?1")?;

    Ok(stmt.query_row(params![group], |row| row.get(0))?)
}

/// Inserts a new rule row and returns its generated id.
pub fn insert_rule(
    transaction: &Transaction,
    group: &str,
    action: RuleAction,
    condition: &str,
    argument: Option<&str>,
    order: i64,
) -> Result<i64> {
    let mut stmt = transaction.prepare_cached(
        "INSERT INTO rules (\"group\", action, condition, argument, \"order\") \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    stmt.execute(params![group, action.as_str(), condition, argument, order])?;

    Ok(transaction.last_insert_rowid())
}

pub fn delete_rule(transaction: &Transaction, rule_id: i64) -> Result<usize> {
    let mut stmt = transaction.prepare_cached("DELETE FROM rules WHERE id = ?1")?;

    Ok(stmt.execute(params![rule_id])?)
}

/// Selects a group's rules ordered by ascending rule order.
pub fn select_rules_by_group(transaction: &Transaction, group: &str) -> Result<Vec<Rule>> {
    let mut stmt = transaction.prepare_cached(
        "SELECT id, \"group\", action, condition, argument, \"order\" \
         FROM rules WHERE \"group\" = ?1 ORDER BY \"order\" ASC",
    )?;
    let mut rows = stmt.query(params![group])?;

    let mut rules = Vec::new();
    while let Some(row) = rows.next()? {
        rules.push(rule_from_row(row)?);
    }

    Ok(rules)
}

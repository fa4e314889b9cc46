#![allow(clippy::too_many_lines, reason = "test code can be long")]

use std::collections::BTreeMap;

use assert_matches::assert_matches;

use super::{EdgeType, RuleAction, sql};
use crate::{
    db::{connection::Connection, migrations::apply_migrations, settings::Settings},
    errors::DatabaseError,
};

fn create_db() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    apply_migrations(&mut conn).unwrap();
    conn
}

/// Builds the reference graph used by the expansion tests:
///
/// ```text
/// foo --or--> bar,  foo --not--> baz,  qux --and--> bar,  qux --and--> baz
/// foo: account 1    bar: accounts 2, 3    baz: accounts 3, 4
/// ```
fn create_complex_graph(conn: &mut Connection) {
    let transaction = conn.transaction().unwrap();
    for group in ["foo", "bar", "baz", "qux"] {
        sql::insert_group(&transaction, group).unwrap();
    }
    sql::insert_edge(&transaction, "foo", "bar", EdgeType::Or).unwrap();
    sql::insert_edge(&transaction, "foo", "baz", EdgeType::Not).unwrap();
    sql::insert_edge(&transaction, "qux", "bar", EdgeType::And).unwrap();
    sql::insert_edge(&transaction, "qux", "baz", EdgeType::And).unwrap();
    sql::insert_edge(&transaction, "foo", "1", EdgeType::Account).unwrap();
    sql::insert_edge(&transaction, "bar", "2", EdgeType::Account).unwrap();
    sql::insert_edge(&transaction, "bar", "3", EdgeType::Account).unwrap();
    sql::insert_edge(&transaction, "baz", "3", EdgeType::Account).unwrap();
    sql::insert_edge(&transaction, "baz", "4", EdgeType::Account).unwrap();
    transaction.commit().unwrap();
}

fn expand(conn: &mut Connection, group: &str) -> Vec<i64> {
    let transaction = conn.transaction().unwrap();
    let mut memo = BTreeMap::new();
    sql::expand_accounts(&transaction, group, &mut memo)
        .unwrap()
        .into_iter()
        .collect()
}

#[test]
fn sql_insert_account_generates_increasing_ids() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    let first = sql::insert_account(&transaction).unwrap();
    let second = sql::insert_account(&transaction).unwrap();
    let third = sql::insert_account(&transaction).unwrap();
    transaction.commit().unwrap();

    assert!(first < second && second < third, "Ids must be strictly increasing");
}

#[test]
fn sql_account_drop_cascades_to_authenticators() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    let account = sql::insert_account(&transaction).unwrap();
    sql::insert_authenticator(&transaction, "foo", "plaintext:bar", account).unwrap();
    transaction.commit().unwrap();

    // Both rows must disappear within a single transaction.
    let transaction = conn.transaction().unwrap();
    sql::delete_account(&transaction, account).unwrap();
    sql::delete_authenticators_by_account(&transaction, account).unwrap();
    transaction.commit().unwrap();

    let transaction = conn.transaction().unwrap();
    let verifier = sql::select_authenticator_verifier(&transaction, "foo").unwrap();
    assert_eq!(verifier, None);
}

#[test]
fn sql_insert_authenticator_duplicate_name_is_constraint_violation() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_authenticator(&transaction, "foo", "plaintext:bar", 1).unwrap();
    let res = sql::insert_authenticator(&transaction, "foo", "plaintext:baz", 2);

    assert!(res.as_ref().is_err_and(DatabaseError::is_unique_violation), "{res:?}");
}

#[test]
fn sql_insert_group_duplicate_name_is_constraint_violation() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "foo").unwrap();
    let res = sql::insert_group(&transaction, "foo");

    assert!(res.as_ref().is_err_and(DatabaseError::is_unique_violation), "{res:?}");
}

#[test]
fn sql_insert_edge_keeps_first_row_on_endpoint_collision() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "foo").unwrap();
    sql::insert_edge(&transaction, "foo", "bar", EdgeType::Or).unwrap();
    // Same endpoints with a different edgetype must not create a second row.
    sql::insert_edge(&transaction, "foo", "bar", EdgeType::And).unwrap();

    let members = sql::select_members(&transaction, "foo").unwrap();
    assert_eq!(members.len(), 1);
    assert!(members.contains(&(EdgeType::Or, "bar".to_string())));
}

#[test]
fn sql_select_members_and_parents() {
    let mut conn = create_db();
    create_complex_graph(&mut conn);

    let transaction = conn.transaction().unwrap();

    let members = sql::select_members(&transaction, "foo").unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.contains(&(EdgeType::Or, "bar".to_string())));
    assert!(members.contains(&(EdgeType::Not, "baz".to_string())));
    assert!(members.contains(&(EdgeType::Account, "1".to_string())));

    // Unknown groups have no members.
    assert!(sql::select_members(&transaction, "nosuch").unwrap().is_empty());

    let parents = sql::select_parents(&transaction, "3").unwrap();
    assert_eq!(parents.into_iter().collect::<Vec<_>>(), vec!["bar", "baz"]);

    assert!(sql::edge_exists(&transaction, "foo", "bar").unwrap());
    assert!(!sql::edge_exists(&transaction, "bar", "foo").unwrap());
}

#[test]
fn sql_expand_accounts_folds_by_edgetype() {
    let mut conn = create_db();
    create_complex_graph(&mut conn);

    // or-union plus the account leaf, minus the not-pruned baz accounts.
    assert_eq!(expand(&mut conn, "foo"), vec![1, 2]);
    // Intersection of bar and baz.
    assert_eq!(expand(&mut conn, "qux"), vec![3]);
    assert_eq!(expand(&mut conn, "bar"), vec![2, 3]);
    // Unknown groups expand to nothing.
    assert_eq!(expand(&mut conn, "nosuch"), Vec::<i64>::new());
}

#[test]
fn sql_expand_accounts_terminates_on_cycles() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "a").unwrap();
    sql::insert_group(&transaction, "b").unwrap();
    sql::insert_edge(&transaction, "a", "b", EdgeType::Or).unwrap();
    sql::insert_edge(&transaction, "b", "a", EdgeType::Or).unwrap();
    sql::insert_edge(&transaction, "a", "1", EdgeType::Account).unwrap();
    sql::insert_edge(&transaction, "b", "2", EdgeType::Account).unwrap();
    transaction.commit().unwrap();

    // Each root sees the full union despite the cycle.
    assert_eq!(expand(&mut conn, "a"), vec![1, 2]);
    assert_eq!(expand(&mut conn, "b"), vec![1, 2]);
}

#[test]
fn sql_expand_accounts_rejects_unknown_edgetype_rows() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "foo").unwrap();
    transaction
        .prepare_cached("INSERT INTO group_members (parent, child, edgetype) VALUES (?1, ?2, ?3)")
        .unwrap()
        .execute(rusqlite::params!["foo", "bar", "xor"])
        .unwrap();

    let mut memo = BTreeMap::new();
    let res = sql::expand_accounts(&transaction, "foo", &mut memo);

    assert_matches!(res, Err(DatabaseError::UnknownEdgeType(edgetype)) => {
        assert_eq!(edgetype, "xor");
    });
}

#[test]
fn sql_expand_descendants_and_ancestors() {
    let mut conn = create_db();
    create_complex_graph(&mut conn);

    let transaction = conn.transaction().unwrap();

    let descendants = sql::expand_descendants(&transaction, "foo").unwrap();
    assert_eq!(descendants.into_iter().collect::<Vec<_>>(), vec!["1", "2", "3", "4", "bar", "baz"]);

    let ancestors = sql::expand_ancestors(&transaction, "2").unwrap();
    assert_eq!(ancestors.into_iter().collect::<Vec<_>>(), vec!["bar", "foo", "qux"]);

    // Leaves have no descendants, roots no ancestors.
    assert!(sql::expand_descendants(&transaction, "1").unwrap().is_empty());
    assert!(sql::expand_ancestors(&transaction, "foo").unwrap().is_empty());
}

#[test]
fn sql_expand_descendants_terminates_on_cycles() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    for group in ["a", "b", "c"] {
        sql::insert_group(&transaction, group).unwrap();
    }
    sql::insert_edge(&transaction, "a", "b", EdgeType::Or).unwrap();
    sql::insert_edge(&transaction, "b", "c", EdgeType::Or).unwrap();
    sql::insert_edge(&transaction, "c", "a", EdgeType::Or).unwrap();

    let descendants = sql::expand_descendants(&transaction, "a").unwrap();
    // The node itself appears since it sits on the cycle.
    assert_eq!(descendants.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

#[test]
fn sql_edge_invalidation_is_computed_from_pre_mutation_graph() {
    let mut conn = create_db();
    create_complex_graph(&mut conn);

    let transaction = conn.transaction().unwrap();
    let invalidation = sql::edge_invalidation(&transaction, "bar", "3").unwrap();

    assert_eq!(
        invalidation.upward.into_iter().collect::<Vec<_>>(),
        vec!["bar", "foo", "qux"],
        "Upward set must cover the parent and everything above it"
    );
    assert_eq!(invalidation.downward.into_iter().collect::<Vec<_>>(), vec!["3"]);

    // Dropping a whole group invalidates with the group standing as both endpoints.
    let invalidation = sql::edge_invalidation(&transaction, "bar", "bar").unwrap();
    assert_eq!(invalidation.upward.into_iter().collect::<Vec<_>>(), vec!["bar", "foo", "qux"]);
    assert_eq!(invalidation.downward.into_iter().collect::<Vec<_>>(), vec!["2", "3", "bar"]);
}

#[test]
fn sql_rule_orders_increase_per_group() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "foo").unwrap();
    sql::insert_group(&transaction, "bar").unwrap();

    assert_eq!(sql::select_max_rule_order(&transaction, "foo").unwrap(), 0);

    for expected_order in 1..=3 {
        let order = sql::select_max_rule_order(&transaction, "foo").unwrap() + 1;
        assert_eq!(order, expected_order);
        sql::insert_rule(&transaction, "foo", RuleAction::Deny, "always", None, order).unwrap();
    }

    // Orders are scoped per group.
    assert_eq!(sql::select_max_rule_order(&transaction, "bar").unwrap(), 0);

    let rules = sql::select_rules_by_group(&transaction, "foo").unwrap();
    assert_eq!(rules.iter().map(|rule| rule.order).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(rules.iter().all(|rule| rule.action == RuleAction::Deny));
    assert!(rules.iter().all(|rule| rule.condition == "always"));
}

#[test]
fn sql_delete_rule_by_id() {
    let mut conn = create_db();

    let transaction = conn.transaction().unwrap();
    sql::insert_group(&transaction, "foo").unwrap();
    let rule_id = sql::insert_rule(&transaction, "foo", RuleAction::Grant, "always", None, 1).unwrap();

    sql::delete_rule(&transaction, rule_id).unwrap();
    assert!(sql::select_rules_by_group(&transaction, "foo").unwrap().is_empty());

    // Deleting an absent rule is a no-op.
    assert_eq!(sql::delete_rule(&transaction, rule_id).unwrap(), 0);
}

#[test]
fn migrations_rerun_is_a_noop() {
    let mut conn = create_db();

    apply_migrations(&mut conn).unwrap();
}

#[test]
fn migrations_reject_tampered_fingerprint() {
    let mut conn = create_db();

    Settings::set_value(conn.inner(), "db-migration-hash", &vec![0u8; 32]).unwrap();

    let res = apply_migrations(&mut conn);
    assert_matches!(res, Err(DatabaseError::UnsupportedDatabaseVersion));
}

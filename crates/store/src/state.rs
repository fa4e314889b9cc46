//! Abstraction to synchronize expansion caches with graph mutations.
//!
//! The [State] owns the database handle and the memoized expansions of the membership graph.
//! Its main purpose is to ensure that graph mutations are atomic with the invalidation of any
//! expansion they stale, so that a read served from the cache is always equal to a fresh
//! recomputation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::{
    AccountId, COMPONENT,
    db::{Db, EdgeInvalidation, EdgeType, RuleAction, RuleOutcome},
    errors::StoreError,
    scheme::SchemeRegistry,
};

// STRUCTURES
// ================================================================================================

/// Groups are lowercase words, optionally dash-separated.
static GROUP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z-]+$").expect("valid regex"));

/// Subject of a rule evaluation.
///
/// The only condition defined today (`always`) fires regardless of the entity; richer
/// conditions will match against these attributes.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub attributes: BTreeMap<String, String>,
}

/// Container for the expansion caches that must be invalidated atomically with graph
/// mutations.
///
/// Values are frozen behind an [Arc]: a cache hit hands out a shared reference, never a copy
/// that could drift from the cached value.
#[derive(Default)]
struct InnerState {
    account_expansions: BTreeMap<String, Arc<BTreeSet<AccountId>>>,
    descendant_expansions: BTreeMap<String, Arc<BTreeSet<String>>>,
    ancestor_expansions: BTreeMap<String, Arc<BTreeSet<String>>>,
}

impl InnerState {
    /// Drops every cache entry staled by the given edge mutation.
    ///
    /// Account and descendant expansions depend on everything upward of the edge; ancestor
    /// expansions depend on everything downward.
    fn invalidate(&mut self, invalidation: &EdgeInvalidation) {
        for key in &invalidation.upward {
            self.account_expansions.remove(key);
            self.descendant_expansions.remove(key);
        }
        for key in &invalidation.downward {
            self.ancestor_expansions.remove(key);
        }
    }
}

/// The store's engine: accounts, authenticators, the group membership graph with its memoized
/// expansions, and the per-group rule lists.
///
/// ## Note on cache consistency
///
/// Mutations of the edge graph hold the cache write-lock for the whole of {pre-mutation
/// invalidation-set computation, database commit, cache entry removal}. Readers therefore see
/// either the pre-mutation cache or the post-mutation database, never a committed mutation
/// through a stale cache. Expansion reads that miss the cache also re-probe and compute under
/// the write-lock, so a concurrent mutation cannot slip between their computation and the
/// insert.
pub struct State {
    db: Db,

    /// Read-write lock guarding the expansion caches.
    ///
    /// The lock is writer-preferring, meaning the writer won't be starved.
    inner: RwLock<InnerState>,

    /// Serializes rule creation: the next rule order is read and written in separate
    /// statements, so concurrent appends to one group could otherwise collide.
    rule_writer: Mutex<()>,

    schemes: SchemeRegistry,
}

impl State {
    /// Creates the engine on top of the given database with the built-in verifier schemes.
    pub fn new(db: Db) -> Self {
        Self::with_schemes(db, SchemeRegistry::with_default_schemes())
    }

    /// Creates the engine with a caller-assembled scheme registry.
    pub fn with_schemes(db: Db, schemes: SchemeRegistry) -> Self {
        Self {
            db,
            inner: RwLock::new(InnerState::default()),
            rule_writer: Mutex::new(()),
            schemes,
        }
    }

    // ACCOUNTS
    // ---------------------------------------------------------------------------------------------

    /// Creates a new account and returns its id.
    pub async fn create_account(&self) -> Result<AccountId, StoreError> {
        Ok(self.db.create_account().await?)
    }

    /// Removes an account by id.
    ///
    /// Every authenticator owned by the account disappears in the same transaction. Dropping
    /// an account that does not exist is not an error. Account leaves referencing the id may
    /// remain in the membership graph and simply dangle.
    pub async fn drop_account(&self, account_id: AccountId) -> Result<(), StoreError> {
        Ok(self.db.drop_account(account_id).await?)
    }

    // AUTHENTICATORS
    // ---------------------------------------------------------------------------------------------

    /// Creates a new authenticator from an already-encoded verifier string.
    ///
    /// The account is not required to exist.
    pub async fn create_authenticator(
        &self,
        name: &str,
        verifier: &str,
        account: AccountId,
    ) -> Result<(), StoreError> {
        self.db
            .insert_authenticator(name.to_string(), verifier.to_string(), account)
            .await
            .map_err(|err| {
                if err.is_unique_violation() {
                    StoreError::DuplicateName(name.to_string())
                } else {
                    err.into()
                }
            })
    }

    /// Creates a new authenticator using a salted bcrypt hash of `password`.
    pub async fn create_bcrypt_authenticator(
        &self,
        name: &str,
        password: &str,
        account: AccountId,
    ) -> Result<(), StoreError> {
        let hashed =
            bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(StoreError::InvalidVerifier)?;
        self.create_authenticator(name, &format!("bcrypt:{hashed}"), account).await
    }

    /// Removes an authenticator by name; absent names are a no-op.
    pub async fn drop_authenticator(&self, name: &str) -> Result<(), StoreError> {
        Ok(self.db.delete_authenticator(name.to_string()).await?)
    }

    /// Verifies credentials for an authenticator.
    ///
    /// Unknown names verify as `false`; an unusable stored verifier is an error.
    #[instrument(target = COMPONENT, skip(self, secret), err)]
    pub async fn verify_authenticator(
        &self,
        name: &str,
        secret: &str,
    ) -> Result<bool, StoreError> {
        let Some(verifier) = self.db.select_authenticator_verifier(name.to_string()).await?
        else {
            return Ok(false);
        };

        self.schemes.verify(&verifier, secret)
    }

    // GROUPS AND EDGES
    // ---------------------------------------------------------------------------------------------

    /// Creates a new group.
    pub async fn create_group(&self, name: &str) -> Result<(), StoreError> {
        if !GROUP_NAME.is_match(name) {
            return Err(StoreError::InvalidGroupName(name.to_string()));
        }

        self.db.insert_group(name.to_string()).await.map_err(|err| {
            if err.is_unique_violation() {
                StoreError::DuplicateGroup(name.to_string())
            } else {
                err.into()
            }
        })
    }

    /// Removes a group together with every edge pointing at or away from it.
    ///
    /// The group's rules are left in place; a group recreated under the same name picks them
    /// back up.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn drop_group(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let invalidation = self.db.drop_group(name.to_string()).await?;
        inner.invalidate(&invalidation);

        Ok(())
    }

    /// Adds a typed edge from `parent` to `child`.
    ///
    /// The parent must be an existing group. Re-adding an existing `(parent, child)` pair is a
    /// no-op regardless of edgetype.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn add_subgroup(
        &self,
        parent: &str,
        child: &str,
        edgetype: EdgeType,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let invalidation =
            self.db.add_subgroup(parent.to_string(), child.to_string(), edgetype).await?;
        inner.invalidate(&invalidation);

        Ok(())
    }

    /// Removes the exact `(parent, child, edgetype)` edge; absent edges are a no-op.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn drop_subgroup(
        &self,
        parent: &str,
        child: &str,
        edgetype: EdgeType,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let invalidation =
            self.db.drop_subgroup(parent.to_string(), child.to_string(), edgetype).await?;
        inner.invalidate(&invalidation);

        Ok(())
    }

    /// Adds an account leaf to a group.
    pub async fn add_member_account(
        &self,
        group: &str,
        account: AccountId,
    ) -> Result<(), StoreError> {
        self.add_subgroup(group, &account.to_string(), EdgeType::Account).await
    }

    /// Removes an account leaf from a group.
    pub async fn drop_member_account(
        &self,
        group: &str,
        account: AccountId,
    ) -> Result<(), StoreError> {
        self.drop_subgroup(group, &account.to_string(), EdgeType::Account).await
    }

    pub async fn group_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.db.group_exists(name.to_string()).await?)
    }

    /// Lists a group's direct members as `(edgetype, child)` pairs; unknown groups yield the
    /// empty set.
    pub async fn list_members(
        &self,
        group: &str,
    ) -> Result<BTreeSet<(EdgeType, String)>, StoreError> {
        Ok(self.db.select_members(group.to_string()).await?)
    }

    /// Checks for a direct edge from `group` to `child` of any edgetype.
    pub async fn is_member(&self, group: &str, child: &str) -> Result<bool, StoreError> {
        Ok(self.db.edge_exists(group.to_string(), child.to_string()).await?)
    }

    /// Lists the direct parents of a node (a group name or an account leaf).
    pub async fn list_parents(&self, child: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.db.select_parents(child.to_string()).await?)
    }

    // EXPANSIONS
    // ---------------------------------------------------------------------------------------------

    /// Returns the set of accounts that are effective members of `group`.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn list_accounts(
        &self,
        group: &str,
    ) -> Result<Arc<BTreeSet<AccountId>>, StoreError> {
        {
            let inner = self.inner.read().await;
            if let Some(expansion) = inner.account_expansions.get(group) {
                return Ok(Arc::clone(expansion));
            }
        }

        let mut inner = self.inner.write().await;
        if let Some(expansion) = inner.account_expansions.get(group) {
            return Ok(Arc::clone(expansion));
        }

        let expansion = Arc::new(self.db.expand_group_accounts(group.to_string()).await?);
        inner.account_expansions.insert(group.to_string(), Arc::clone(&expansion));

        Ok(expansion)
    }

    /// Returns every node transitively reachable from `node`, regardless of edgetype.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn list_descendants(
        &self,
        node: &str,
    ) -> Result<Arc<BTreeSet<String>>, StoreError> {
        {
            let inner = self.inner.read().await;
            if let Some(expansion) = inner.descendant_expansions.get(node) {
                return Ok(Arc::clone(expansion));
            }
        }

        let mut inner = self.inner.write().await;
        if let Some(expansion) = inner.descendant_expansions.get(node) {
            return Ok(Arc::clone(expansion));
        }

        let expansion = Arc::new(self.db.expand_descendants(node.to_string()).await?);
        inner.descendant_expansions.insert(node.to_string(), Arc::clone(&expansion));

        Ok(expansion)
    }

    /// Returns every node from which `node` is reachable, regardless of edgetype.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn list_ancestors(&self, node: &str) -> Result<Arc<BTreeSet<String>>, StoreError> {
        {
            let inner = self.inner.read().await;
            if let Some(expansion) = inner.ancestor_expansions.get(node) {
                return Ok(Arc::clone(expansion));
            }
        }

        let mut inner = self.inner.write().await;
        if let Some(expansion) = inner.ancestor_expansions.get(node) {
            return Ok(Arc::clone(expansion));
        }

        let expansion = Arc::new(self.db.expand_ancestors(node.to_string()).await?);
        inner.ancestor_expansions.insert(node.to_string(), Arc::clone(&expansion));

        Ok(expansion)
    }

    /// Checks whether an account is an effective member of a group.
    pub async fn is_member_account(
        &self,
        group: &str,
        account: AccountId,
    ) -> Result<bool, StoreError> {
        Ok(self.list_accounts(group).await?.contains(&account))
    }

    /// Lists every group the account is an effective member of.
    ///
    /// The account's ancestor set over-approximates this: it also contains groups that reach
    /// the account only through `not` or unsatisfied `and` edges, so each candidate is checked
    /// against its own account expansion.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn list_account_memberships(
        &self,
        account: AccountId,
    ) -> Result<BTreeSet<String>, StoreError> {
        let ancestors = self.list_ancestors(&account.to_string()).await?;

        let mut memberships = BTreeSet::new();
        for group in ancestors.iter() {
            if self.list_accounts(group).await?.contains(&account) {
                memberships.insert(group.clone());
            }
        }

        Ok(memberships)
    }

    // RULES
    // ---------------------------------------------------------------------------------------------

    /// Adds a new membership rule for a group and returns its id.
    ///
    /// New rules are always appended last in the group's evaluation order.
    #[instrument(target = COMPONENT, skip(self), err)]
    pub async fn create_rule(
        &self,
        group: &str,
        action: RuleAction,
        condition: &str,
        argument: Option<&str>,
    ) -> Result<i64, StoreError> {
        let _guard = self.rule_writer.lock().await;

        self.db
            .create_rule(
                group.to_string(),
                action,
                condition.to_string(),
                argument.map(str::to_string),
            )
            .await
    }

    /// Removes a rule by id; absent ids are a no-op.
    pub async fn drop_rule(&self, rule_id: i64) -> Result<(), StoreError> {
        Ok(self.db.drop_rule(rule_id).await?)
    }

    /// Evaluates a group's rules for an entity, in rule order, returning the action of the
    /// first rule whose condition holds.
    ///
    /// Unknown conditions fail loudly rather than being skipped; silently skipping one would
    /// reorder the deny/grant sequence the rule list encodes.
    #[instrument(target = COMPONENT, skip(self, entity), err)]
    pub async fn evaluate_rules(
        &self,
        group: &str,
        entity: &Entity,
    ) -> Result<RuleOutcome, StoreError> {
        for rule in self.db.select_rules(group.to_string()).await? {
            if condition_holds(&rule.condition, rule.argument.as_deref(), entity)? {
                return Ok(rule.action.into());
            }
        }

        Ok(RuleOutcome::Ignore)
    }
}

/// Evaluates a single rule condition against an entity.
fn condition_holds(
    condition: &str,
    _argument: Option<&str>,
    _entity: &Entity,
) -> Result<bool, StoreError> {
    match condition {
        "always" => Ok(true),
        other => Err(StoreError::UnknownCondition(other.to_string())),
    }
}

use std::{
    collections::BTreeSet,
    fmt,
    fs::create_dir_all,
    path::PathBuf,
    str::FromStr,
};

use tracing::{info, instrument};

use crate::{
    AccountId, COMPONENT,
    db::{
        migrations::apply_migrations,
        pool_manager::{Pool, SqlitePoolManager},
    },
    errors::{DatabaseError, DatabaseSetupError, StoreError},
};

mod migrations;
#[macro_use]
mod sql;

mod connection;
mod pool_manager;
mod settings;
#[cfg(test)]
mod tests;
mod transaction;

pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;

/// Handle to the store's database, wrapping a pool of SQLite connections.
pub struct Db {
    pool: Pool,
}

// DOMAIN TYPES
// =================================================================================================

/// Type of a `group_members` edge, controlling how the child folds into the parent's
/// account expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeType {
    /// Union: the child group's accounts are added to the parent's expansion.
    Or,
    /// Intersection: the parent keeps only accounts present in every `and` child.
    And,
    /// Prune: the child group's accounts are removed from the parent's expansion.
    Not,
    /// Leaf: the child is the decimal form of a single account id.
    Account,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::Or => "or",
            EdgeType::And => "and",
            EdgeType::Not => "not",
            EdgeType::Account => "account",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "or" => Ok(EdgeType::Or),
            "and" => Ok(EdgeType::And),
            "not" => Ok(EdgeType::Not),
            "account" => Ok(EdgeType::Account),
            other => Err(StoreError::UnknownEdgeType(other.to_string())),
        }
    }
}

/// Action taken by a rule when its condition fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Grant,
    Deny,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleAction::Grant => "grant",
            RuleAction::Deny => "deny",
        }
    }
}

/// Result of evaluating a group's rule list against an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Grant,
    Deny,
    /// No rule fired.
    Ignore,
}

impl From<RuleAction> for RuleOutcome {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Grant => RuleOutcome::Grant,
            RuleAction::Deny => RuleOutcome::Deny,
        }
    }
}

/// A row of the `rules` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: i64,
    pub group: String,
    pub action: RuleAction,
    pub condition: String,
    pub argument: Option<String>,
    pub order: i64,
}

/// Cache keys whose memoized expansions an edge mutation has staled.
///
/// `upward` holds the mutated edge's parent and every pre-mutation ancestor of it; `downward`
/// holds the child and every pre-mutation descendant.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EdgeInvalidation {
    pub upward: BTreeSet<String>,
    pub downward: BTreeSet<String>,
}

// DATABASE HANDLE
// =================================================================================================

impl Db {
    /// Open a connection pool to the DB and apply any pending migrations.
    #[instrument(target = COMPONENT, skip_all)]
    pub async fn setup(database_filepath: PathBuf) -> Result<Self, DatabaseSetupError> {
        info!(target: COMPONENT, ?database_filepath, "Connecting to the database");

        if let Some(p) = database_filepath.parent() {
            create_dir_all(p).map_err(DatabaseError::IoError)?;
        }

        let sqlite_pool_manager = SqlitePoolManager::new(database_filepath.clone());
        let pool = Pool::builder(sqlite_pool_manager).build()?;

        let conn = pool.get().await.map_err(DatabaseError::MissingDbConnection)?;

        conn.interact(apply_migrations).await.map_err(|err| {
            DatabaseError::InteractError(format!("Migration task failed: {err}"))
        })??;

        info!(
            target: COMPONENT,
            sqlite = %database_filepath.display(),
            "Connected to the database"
        );

        Ok(Db { pool })
    }

    // ACCOUNTS
    // ---------------------------------------------------------------------------------------------

    /// Inserts a new account and returns its generated id.
    #[instrument(target = COMPONENT, skip_all, ret(level = "debug"), err)]
    pub async fn create_account(&self) -> Result<AccountId> {
        self.pool
            .get()
            .await?
            .interact(|conn| -> Result<AccountId> {
                let transaction = conn.transaction()?;
                let account_id = sql::insert_account(&transaction)?;
                transaction.commit()?;

                Ok(account_id)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Create account task failed: {err}"))
            })?
    }

    /// Deletes an account and, in the same transaction, every authenticator owned by it.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn drop_account(&self, account_id: AccountId) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::delete_account(&transaction, account_id)?;
                sql::delete_authenticators_by_account(&transaction, account_id)?;
                transaction.commit()?;

                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Drop account task failed: {err}"))
            })?
    }

    // AUTHENTICATORS
    // ---------------------------------------------------------------------------------------------

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn insert_authenticator(
        &self,
        name: String,
        verifier: String,
        account: AccountId,
    ) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::insert_authenticator(&transaction, &name, &verifier, account)?;
                transaction.commit()?;

                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Insert authenticator task failed: {err}"))
            })?
    }

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn delete_authenticator(&self, name: String) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::delete_authenticator(&transaction, &name)?;
                transaction.commit()?;

                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Delete authenticator task failed: {err}"))
            })?
    }

    /// Loads the stored verifier for the named authenticator, if any.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_authenticator_verifier(&self, name: String) -> Result<Option<String>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_authenticator_verifier(&transaction, &name)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select verifier task failed: {err}"))
            })?
    }

    // GROUPS AND EDGES
    // ---------------------------------------------------------------------------------------------

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn insert_group(&self, name: String) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::insert_group(&transaction, &name)?;
                transaction.commit()?;

                Ok(())
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Insert group task failed: {err}"))
            })?
    }

    /// Deletes a group together with every edge mentioning it, returning the invalidation
    /// computed from the pre-mutation graph with the group standing as both endpoints.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn drop_group(&self, name: String) -> Result<EdgeInvalidation> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<EdgeInvalidation> {
                let transaction = conn.transaction()?;
                let invalidation = sql::edge_invalidation(&transaction, &name, &name)?;
                sql::delete_group(&transaction, &name)?;
                sql::delete_edges_mentioning(&transaction, &name)?;
                transaction.commit()?;

                Ok(invalidation)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Drop group task failed: {err}"))
            })?
    }

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn group_exists(&self, name: String) -> Result<bool> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::group_exists(&transaction, &name)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Group exists task failed: {err}"))
            })?
    }

    /// Inserts an edge after checking that the parent group exists; the duplicate-endpoint
    /// case is swallowed by the insert itself.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn add_subgroup(
        &self,
        parent: String,
        child: String,
        edgetype: EdgeType,
    ) -> Result<EdgeInvalidation, StoreError> {
        self.pool
            .get()
            .await
            .map_err(DatabaseError::MissingDbConnection)?
            .interact(move |conn| -> Result<EdgeInvalidation, StoreError> {
                let transaction = conn.transaction().map_err(DatabaseError::SqliteError)?;
                if !sql::group_exists(&transaction, &parent)? {
                    return Err(StoreError::UnknownGroup(parent));
                }
                let invalidation = sql::edge_invalidation(&transaction, &parent, &child)?;
                sql::insert_edge(&transaction, &parent, &child, edgetype)?;
                transaction.commit().map_err(DatabaseError::SqliteError)?;

                Ok(invalidation)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Add subgroup task failed: {err}"))
            })?
    }

    /// Deletes the exact `(parent, child, edgetype)` edge row.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn drop_subgroup(
        &self,
        parent: String,
        child: String,
        edgetype: EdgeType,
    ) -> Result<EdgeInvalidation> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<EdgeInvalidation> {
                let transaction = conn.transaction()?;
                let invalidation = sql::edge_invalidation(&transaction, &parent, &child)?;
                sql::delete_edge(&transaction, &parent, &child, edgetype)?;
                transaction.commit()?;

                Ok(invalidation)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Drop subgroup task failed: {err}"))
            })?
    }

    /// Loads a group's direct members.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_members(&self, group: String) -> Result<BTreeSet<(EdgeType, String)>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_members(&transaction, &group)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select members task failed: {err}"))
            })?
    }

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn edge_exists(&self, parent: String, child: String) -> Result<bool> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::edge_exists(&transaction, &parent, &child)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Edge exists task failed: {err}"))
            })?
    }

    /// Loads the direct parents of a node.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_parents(&self, child: String) -> Result<BTreeSet<String>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_parents(&transaction, &child)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select parents task failed: {err}"))
            })?
    }

    // EXPANSIONS
    // ---------------------------------------------------------------------------------------------

    /// Computes a group's account expansion from scratch within a single read transaction.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn expand_group_accounts(&self, group: String) -> Result<BTreeSet<AccountId>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                let mut memo = std::collections::BTreeMap::new();
                sql::expand_accounts(&transaction, &group, &mut memo)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Expand accounts task failed: {err}"))
            })?
    }

    /// Computes a node's transitive descendant set from scratch.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn expand_descendants(&self, node: String) -> Result<BTreeSet<String>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::expand_descendants(&transaction, &node)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Expand descendants task failed: {err}"))
            })?
    }

    /// Computes a node's transitive ancestor set from scratch.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn expand_ancestors(&self, node: String) -> Result<BTreeSet<String>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::expand_ancestors(&transaction, &node)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Expand ancestors task failed: {err}"))
            })?
    }

    // RULES
    // ---------------------------------------------------------------------------------------------

    /// Appends a rule to a group's rule list and returns the generated rule id.
    ///
    /// The new rule's order is one past the group's current maximum, so rules evaluate in
    /// creation order. Callers serialize invocations per group (see
    /// [`crate::state::State::create_rule`]); the order computation spans two statements.
    #[instrument(target = COMPONENT, skip_all, ret(level = "debug"), err)]
    pub async fn create_rule(
        &self,
        group: String,
        action: RuleAction,
        condition: String,
        argument: Option<String>,
    ) -> Result<i64, StoreError> {
        self.pool
            .get()
            .await
            .map_err(DatabaseError::MissingDbConnection)?
            .interact(move |conn| -> Result<i64, StoreError> {
                let transaction = conn.transaction().map_err(DatabaseError::SqliteError)?;
                if !sql::group_exists(&transaction, &group)? {
                    return Err(StoreError::UnknownGroup(group));
                }
                let order = sql::select_max_rule_order(&transaction, &group)? + 1;
                let rule_id = sql::insert_rule(
                    &transaction,
                    &group,
                    action,
                    &condition,
                    argument.as_deref(),
                    order,
                )?;
                transaction.commit().map_err(DatabaseError::SqliteError)?;

                Ok(rule_id)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Create rule task failed: {err}"))
            })?
    }

    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn drop_rule(&self, rule_id: i64) -> Result<()> {
        self.pool
            .get()
            .await?
            .interact(move |conn| -> Result<()> {
                let transaction = conn.transaction()?;
                sql::delete_rule(&transaction, rule_id)?;
                transaction.commit()?;

                Ok(())
            })
            .await
            .map_err(|err| DatabaseError::InteractError(format!("Drop rule task failed: {err}")))?
    }

    /// Loads a group's rules ordered by ascending rule order.
    #[instrument(target = COMPONENT, skip_all, err)]
    pub async fn select_rules(&self, group: String) -> Result<Vec<Rule>> {
        self.pool
            .get()
            .await?
            .interact(move |conn| {
                let transaction = conn.transaction()?;
                sql::select_rules_by_group(&transaction, &group)
            })
            .await
            .map_err(|err| {
                DatabaseError::InteractError(format!("Select rules task failed: {err}"))
            })?
    }
}

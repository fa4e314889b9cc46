pub mod config;
pub mod db;
pub mod errors;
pub mod scheme;
pub mod state;

// CONSTANTS
// =================================================================================================

pub const COMPONENT: &str = "warden-store";

/// Number of sql statements that each connection will cache.
const SQL_STATEMENT_CACHE_CAPACITY: usize = 32;

// TYPE ALIASES
// =================================================================================================

/// An account's identity: the value of the `accounts` table's integer primary key.
pub type AccountId = i64;

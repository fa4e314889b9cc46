use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    db::{EdgeType, Rule, RuleAction},
    errors::DatabaseError,
};

/// Checks if a table exists in the database.
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = $1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Returns the schema version of the database.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT * FROM pragma_schema_version", [], |row| row.get(0))
}

/// Auxiliary macro which substitutes `$src` token by `$dst` expression.
macro_rules! subst {
    ($src:tt, $dst:expr) => {
        $dst
    };
}

pub(crate) use subst;

/// Generates a simple insert SQL statement with parameters for the provided table name and fields.
/// Supports optional conflict resolution (adding "| replace" or "| ignore" at the end will generate
/// "OR REPLACE" and "OR IGNORE", correspondingly).
///
/// # Usage:
///
/// `insert_sql!(users { id, first_name, last_name, age } | replace);`
///
/// which generates:
/// "INSERT OR REPLACE INTO users (id, `first_name`, `last_name`, age) VALUES (?, ?, ?, ?)"
macro_rules! insert_sql {
    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } $(, $on_conflict:expr)?) => {
        concat!(
            stringify!(INSERT $(OR $on_conflict)? INTO $table),
            " (",
            stringify!($first_field),
            $($(concat!(", ", stringify!($field))),+ ,)?
            ") VALUES (",
            subst!($first_field, "?"),
            $($(subst!($field, ", ?")),+ ,)?
            ")"
        )
    };

    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } | replace) => {
        insert_sql!($table { $first_field, $($($field),+)? }, REPLACE)
    };

    ($table:ident { $first_field:ident $(, $($field:ident),+)? $(,)? } | ignore) => {
        insert_sql!($table { $first_field, $($($field),+)? }, IGNORE)
    };
}

pub(crate) use insert_sql;

/// Reads an edgetype column and parses it into an [`EdgeType`].
pub fn read_edge_type<I: rusqlite::RowIndex>(row: &Row<'_>, index: I) -> crate::db::Result<EdgeType> {
    let raw: String = row.get(index)?;
    raw.parse::<EdgeType>().map_err(|_| DatabaseError::UnknownEdgeType(raw))
}

/// Constructs a [`Rule`] from a row of the `rules` table.
///
/// Note: field ordering must be the same as in the `rules` table!
pub fn rule_from_row(row: &Row<'_>) -> crate::db::Result<Rule> {
    let action: String = row.get(2)?;
    let action = match action.as_str() {
        "grant" => RuleAction::Grant,
        "deny" => RuleAction::Deny,
        other => {
            return Err(DatabaseError::DataCorrupted(format!(
                "rule row carries unknown action '{other}'"
            )));
        },
    };

    Ok(Rule {
        id: row.get(0)?,
        group: row.get(1)?,
        action,
        condition: row.get(3)?,
        argument: row.get(4)?,
        order: row.get(5)?,
    })
}

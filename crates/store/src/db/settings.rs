use rusqlite::{Connection, OptionalExtension, Result, ToSql, params, types::FromSql};

use crate::db::sql::utils::table_exists;

/// Access to the `settings` table, the store's persistent name/value bookkeeping.
pub struct Settings;

impl Settings {
    pub fn exists(conn: &Connection) -> Result<bool> {
        table_exists(conn, "settings")
    }

    pub fn get_value<T: FromSql>(conn: &Connection, name: &str) -> Result<Option<T>> {
        conn.query_row("SELECT value FROM settings WHERE name = $1", params![name], |row| {
            row.get(0)
        })
        .optional()
    }

    pub fn set_value<T: ToSql>(conn: &Connection, name: &str, value: &T) -> Result<()> {
        let count = conn.execute("INSERT OR REPLACE INTO settings (name, value) VALUES (?, ?)", params![
            name, value
        ])?;

        debug_assert_eq!(count, 1);

        Ok(())
    }
}

use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

// Main config
// ================================================================================================

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `SQLite` database file
    pub database_filepath: PathBuf,
}

impl Display for StoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{{ database_filepath: {:?} }}", self.database_filepath))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_filepath: PathBuf::from("./warden-store.sqlite3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use super::StoreConfig;

    #[test]
    fn config_loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden-store.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_filepath = \"/var/lib/warden/store.sqlite3\"").unwrap();

        let config: StoreConfig = warden_utils::config::load_config(&config_path).unwrap();

        assert_eq!(config.database_filepath, PathBuf::from("/var/lib/warden/store.sqlite3"));
    }
}

use std::path::Path;

use figment::{
    Figment,
    providers::{Format, Toml},
};
use serde::Deserialize;

/// Loads the user configuration.
///
/// This function will look for the configuration file at the provided path. Missing files resolve
/// to the type's defaults if it supplies any via serde, otherwise extraction fails.
pub fn load_config<T: for<'a> Deserialize<'a>>(
    config_file: impl AsRef<Path>,
) -> figment::Result<T> {
    Figment::from(Toml::file(config_file.as_ref())).extract()
}

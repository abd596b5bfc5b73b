use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Environment variable prefix shared by every service in the workspace.
pub const ENV_PREFIX: &str = "APP";

/// Load a service configuration.
///
/// Sources, lowest precedence first: an optional `configuration.{toml,yaml,json}`
/// file in the working directory, then `APP__`-prefixed environment variables
/// (`APP__DATABASE__URL` maps to `database.url`). A `.env` file is read first
/// when present.
pub fn load<T: DeserializeOwned>() -> Result<T, AppError> {
    load_from("configuration", &[])
}

/// Same as [`load`] with an explicit base file name. Environment values of
/// `list_keys` (dotted paths, e.g. `payments.supported_methods`) are split on
/// commas.
pub fn load_from<T: DeserializeOwned>(
    file_name: &str,
    list_keys: &[&str],
) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let environment = list_keys.iter().fold(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .try_parsing(true),
        |environment, key| environment.with_list_parse_key(key),
    );

    let config = Cfg::builder()
        .add_source(File::with_name(file_name).required(false))
        .add_source(environment)
        .build()?;

    Ok(config.try_deserialize()?)
}

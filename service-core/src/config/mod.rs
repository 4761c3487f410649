use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Environment variable prefix shared by every service (`APP__SERVER__PORT`).
pub const ENV_PREFIX: &str = "APP";

/// Load a service configuration from layered sources.
///
/// Sources, lowest precedence first: an optional `configuration` file in the
/// working directory, a `.env` file picked up by dotenvy, then `APP__`-prefixed
/// environment variables using `__` as the nesting separator.
pub fn load<T: DeserializeOwned>() -> Result<T, AppError> {
    load_from("configuration")
}

/// Same as [`load`] but reads the optional file from `file_name`.
pub fn load_from<T: DeserializeOwned>(file_name: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name(file_name).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Loads configuration from a file into a struct.
/// Supports TOML, YAML, JSON, etc. based on file extension.
///
/// Variables named `{env_prefix}_<FIELD>` override values from the file.
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<T> {
    let path_str = path.as_ref().to_str().context("Invalid config path")?;

    let settings = Config::builder()
        .add_source(File::with_name(path_str))
        .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
        .build()
        .context("Failed to build configuration")?;

    settings.try_deserialize::<T>().context("Failed to deserialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        retries: u32,
    }

    #[test]
    fn test_load_toml_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sample.toml");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "name = \"drip\"\nretries = 3")?;

        let sample: Sample = load_config(&path, "DRIP_COMMON_TEST")?;
        assert_eq!(sample.name, "drip");
        assert_eq!(sample.retries, 3);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result: Result<Sample> = load_config("/definitely/not/here.toml", "DRIP_COMMON_TEST");
        assert!(result.is_err());
    }
}

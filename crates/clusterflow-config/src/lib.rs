//! ClusterFlow operator configuration
//!
//! Locates `clusterflow.kdl` and parses it into an [`OperatorConfig`].

pub mod error;
pub mod model;
pub mod parser;

pub use error::*;
pub use model::*;
pub use parser::{parse_config_file, parse_config_str};

use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CLUSTERFLOW_CONFIG";

/// Config file name looked up in the current and config directories
pub const CONFIG_FILE_NAME: &str = "clusterflow.kdl";

/// ClusterFlow's directory under the user config dir
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("clusterflow"))
}

/// Locate the config file.
///
/// Search order:
/// 1. `explicit` (the `--config` flag); it must exist
/// 2. the `CLUSTERFLOW_CONFIG` environment variable
/// 3. `./clusterflow.kdl`
/// 4. `<config dir>/clusterflow/clusterflow.kdl`
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::MissingFile(path.to_path_buf()))
        };
    }

    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let local = std::env::current_dir()?.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(local);
    }

    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join(CONFIG_FILE_NAME);
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Locate and parse the config, falling back to defaults when no file
/// exists. A missing `explicit` path is still an error.
pub fn load_config(explicit: Option<&Path>) -> Result<(OperatorConfig, Option<PathBuf>)> {
    match find_config_file(explicit) {
        Ok(path) => Ok((parse_config_file(&path)?, Some(path))),
        Err(ConfigError::ConfigFileNotFound) => Ok((OperatorConfig::default(), None)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    /// Runs `f` with the current directory set to `dir`
    fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        let result = f();
        std::env::set_current_dir(original).unwrap();
        result
    }

    #[test]
    #[serial]
    fn test_explicit_path_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let explicit = temp_dir.path().join("custom.kdl");
        fs::write(&explicit, "").unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "").unwrap();

        let found = in_dir(temp_dir.path(), || find_config_file(Some(&explicit))).unwrap();
        assert_eq!(found, explicit);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_path_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("nope.kdl");
        let err = find_config_file(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(p) if p == missing));
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_before_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let from_env = temp_dir.path().join("env.kdl");
        fs::write(&from_env, "").unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "").unwrap();

        temp_env::with_var(CONFIG_ENV, Some(from_env.as_os_str()), || {
            let found = in_dir(temp_dir.path(), || find_config_file(None)).unwrap();
            assert_eq!(found, from_env);
        });
    }

    #[test]
    #[serial]
    fn test_current_dir_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "").unwrap();

        temp_env::with_var_unset(CONFIG_ENV, || {
            let found = in_dir(temp_dir.path(), || find_config_file(None)).unwrap();
            assert!(found.ends_with(CONFIG_FILE_NAME));
        });
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_global_config_dir() {
        let work = tempfile::tempdir().unwrap();
        let xdg = tempfile::tempdir().unwrap();
        let global_dir = xdg.path().join("clusterflow");
        fs::create_dir_all(&global_dir).unwrap();
        fs::write(global_dir.join(CONFIG_FILE_NAME), "retry {\n    deadline-secs 7\n}").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_ENV, None),
                ("XDG_CONFIG_HOME", Some(xdg.path().as_os_str())),
            ],
            || {
                let (config, path) = in_dir(work.path(), || load_config(None)).unwrap();
                assert_eq!(path, Some(global_dir.join(CONFIG_FILE_NAME)));
                assert_eq!(config.retry.deadline_secs, 7);
            },
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_defaults_when_nothing_found() {
        let work = tempfile::tempdir().unwrap();
        let xdg = tempfile::tempdir().unwrap();

        temp_env::with_vars(
            [
                (CONFIG_ENV, None),
                ("XDG_CONFIG_HOME", Some(xdg.path().as_os_str())),
            ],
            || {
                assert!(matches!(
                    in_dir(work.path(), || find_config_file(None)),
                    Err(ConfigError::ConfigFileNotFound)
                ));
                let (config, path) = in_dir(work.path(), || load_config(None)).unwrap();
                assert!(path.is_none());
                assert_eq!(config, OperatorConfig::default());
            },
        );
    }
}

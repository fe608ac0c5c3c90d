//! Loading the lab configuration file.

use std::path::Path;

use ailab_config::{LabConfig, ValidationError};

/// Load and validate a configuration file.
///
/// Files ending in `.json` use the legacy JSON layout; everything else is
/// parsed as TOML.
pub fn load(path: impl AsRef<Path>) -> Result<LabConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;

    let config: LabConfig = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
    };

    config.validate()?;
    for (project, root) in &config.projects {
        if !root.is_dir() {
            return Err(ConfigError::MissingProjectRoot(
                project.clone(),
                root.display().to_string(),
            ));
        }
    }
    if let Some(results) = &config.results
        && !results.is_dir()
    {
        tracing::warn!(path = %results.display(), "results tree does not exist yet");
    }

    Ok(config)
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error("project '{0}' root {1} is not a directory")]
    MissingProjectRoot(String, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_toml() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mnist");
        std::fs::create_dir(&root).unwrap();
        let path = write(
            dir.path(),
            "ailab.toml",
            &format!(
                r#"
gpus = [0, 1]
workspace = "{ws}"

[projects]
mnist = "{root}"

[scheduler]
max_concurrent_jobs = 4
env = {{ OMP_NUM_THREADS = "1" }}

[watcher]
interval_secs = 5
"#,
                ws = dir.path().join("ws").display(),
                root = root.display()
            ),
        );

        let config = load(&path).unwrap();
        assert_eq!(config.gpus, vec![0, 1]);
        assert_eq!(config.scheduler.max_concurrent_jobs, Some(4));
        assert_eq!(config.scheduler.env["OMP_NUM_THREADS"], "1");
        assert_eq!(config.watcher.interval_secs, 5);
        assert_eq!(config.watcher.max_depth, 5);
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.json",
            &format!(
                r#"{{"host": "localhost", "port": 12345, "users": {{"admin": "pw"}},
                    "projects": {{"demo": "{}"}}, "gpus": [0]}}"#,
                dir.path().display()
            ),
        );
        let config = load(&path).unwrap();
        assert_eq!(config.host, "localhost");
        assert!(config.authenticate("admin", "pw"));
    }

    #[test]
    fn test_missing_project_root() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "ailab.toml",
            "[projects]\nghost = \"/definitely/not/here\"\n",
        );
        assert!(matches!(
            load(&path),
            Err(ConfigError::MissingProjectRoot(name, _)) if name == "ghost"
        ));
    }

    #[test]
    fn test_invalid_values() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "ailab.toml",
            &format!(
                "gpus = [1, 1]\n[projects]\np = \"{}\"\n",
                dir.path().display()
            ),
        );
        assert!(matches!(
            load(&path),
            Err(ConfigError::Invalid(ValidationError::DuplicateGpu(1)))
        ));
        assert!(matches!(
            load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(..))
        ));
        let path = write(dir.path(), "bad.toml", "projects = 3");
        assert!(matches!(load(&path), Err(ConfigError::Parse(_))));
    }
}

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Context, Error, Result},
    schema::BundlerConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "mcp-bundler.toml",
    "mcp-bundler.yaml",
    "mcp-bundler.yml",
    "mcp-bundler.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<BundlerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./mcp-bundler.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/mcp-bundler/mcp-bundler.{toml,yaml,yml,json}` (user-global)
///
/// Returns `BundlerConfig::default()` if no config file is found or it fails
/// to parse.
pub fn discover_and_load() -> (BundlerConfig, Option<PathBuf>) {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return (cfg, Some(path)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    (BundlerConfig::default(), None)
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/mcp-bundler/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mcp-bundler").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<BundlerConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-bundler.toml");
        std::fs::write(
            &path,
            r#"
                [project]
                name = "demo"

                [[project.upstream]]
                alias = "fs"
                command = "mcp-server-filesystem"
                args = ["/tmp"]
            "#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.project.name, "demo");
        assert_eq!(cfg.project.upstreams[0].args, vec!["/tmp"]);
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-bundler.json");
        std::fs::write(
            &path,
            r#"{"project":{"name":"j","upstream":[{"alias":"a","command":"x"}]},"router":{"meta_tools":true}}"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert!(cfg.router.meta_tools);
        assert_eq!(cfg.project.upstreams.len(), 1);
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-bundler.yaml");
        std::fs::write(
            &path,
            "project:\n  name: y\n  upstream:\n    - alias: remote\n      transport: http\n      url: http://localhost:9000/mcp\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(
            cfg.project.upstreams[0].url.as_deref(),
            Some("http://localhost:9000/mcp")
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-bundler.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { ref extension } if extension == "ini"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/mcp-bundler.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}

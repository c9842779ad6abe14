/// Process-wide configuration.
///
/// Re-expresses the source's singleton `CONFIG` object as an explicit value
/// constructed once in `main` and handed to every subsystem read-only.
/// Precedence, highest first: environment variables, a TOML file, defaults.
/// A missing required field after merging every source is a fatal
/// [`ConfigError`], never silently defaulted.
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    version: Option<String>,
    repo_link: Option<String>,
    user_agent: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub repo_link: String,
    pub user_agent: String,
    pub email: Option<String>,
}

impl Config {
    /// Loads configuration from an optional TOML file plus the process
    /// environment. `EMAIL` is consulted only when the file does not set
    /// `email`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file_cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str::<FileConfig>(&raw)?
            }
            None => FileConfig::default(),
        };

        let version = std::env::var("VERSION")
            .ok()
            .or(file_cfg.version)
            .ok_or(ConfigError::MissingField("version"))?;

        let repo_link = std::env::var("REPO_LINK")
            .ok()
            .or(file_cfg.repo_link)
            .ok_or(ConfigError::MissingField("repo_link"))?;

        if !repo_link.starts_with("http://") && !repo_link.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "repo_link",
                reason: "must be an http(s) URL".to_string(),
            });
        }

        let user_agent = std::env::var("USER_AGENT")
            .ok()
            .or(file_cfg.user_agent)
            .ok_or(ConfigError::MissingField("user_agent"))?;

        let email = std::env::var("EMAIL").ok().or(file_cfg.email);

        Ok(Config {
            version,
            repo_link,
            user_agent,
            email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_field_is_fatal() {
        let result = Config::load(None);
        assert!(matches!(result, Err(ConfigError::MissingField("version"))));
    }

    #[test]
    fn rejects_non_url_repo_link() {
        unsafe {
            std::env::set_var("VERSION", "1.0.0");
            std::env::set_var("REPO_LINK", "not-a-url");
            std::env::set_var("USER_AGENT", "test-agent");
        }
        let result = Config::load(None);
        unsafe {
            std::env::remove_var("VERSION");
            std::env::remove_var("REPO_LINK");
            std::env::remove_var("USER_AGENT");
        }
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}

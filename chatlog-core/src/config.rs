use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ChatlogError, Result};
use crate::output::{JsonMode, OutputFormat, OutputOptions};

pub const CONFIG_ENV: &str = "CHATLOG_CONFIG";

/// User defaults for `chatlog`, read from `config.toml`.
///
/// Every field is optional; anything left unset falls back to the built-in
/// default, and command-line flags win over both.
///
/// ```toml
/// output_dir = "${HOME}/chat-archive"
/// format = "both"
/// json_mode = "multiple"
/// preserve_timestamps = true
/// jobs = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatlogConfig {
    pub output_dir: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    pub json_mode: Option<JsonMode>,
    pub preserve_timestamps: Option<bool>,
    pub jobs: Option<usize>,
    pub markdown_dir: Option<PathBuf>,
    pub json_dir: Option<PathBuf>,
    pub json_file: Option<PathBuf>,
}

impl ChatlogConfig {
    /// Loads the config from `$CHATLOG_CONFIG`, or the platform config dir.
    ///
    /// A missing file yields the defaults. A file that exists but is not
    /// valid TOML is an error.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// `$CHATLOG_CONFIG`, else `<config_dir>/chatlog/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        env::var_os(CONFIG_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("chatlog").join("config.toml")))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ChatlogError::config(format!("failed to read {}: {e}", path.display())))?;
        let mut config = Self::parse(&content)
            .map_err(|e| ChatlogError::config(format!("{}: {e}", path.display())))?;
        config.expand_variables();
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ChatlogError::config(format!("invalid TOML: {e}")))
    }

    /// Expand `${VAR}` references in path fields against the environment
    fn expand_variables(&mut self) {
        for path in [
            &mut self.output_dir,
            &mut self.markdown_dir,
            &mut self.json_dir,
            &mut self.json_file,
        ]
        .into_iter()
        .flatten()
        {
            *path = PathBuf::from(expand_env(&path.display().to_string()));
        }
    }

    /// Layers this config over `base`.
    pub fn apply(&self, base: &mut OutputOptions) {
        if let Some(dir) = &self.output_dir {
            base.output_dir = dir.clone();
        }
        if let Some(format) = self.format {
            base.format = format;
        }
        if let Some(mode) = self.json_mode {
            base.json_mode = mode;
        }
        if let Some(preserve) = self.preserve_timestamps {
            base.preserve_timestamps = preserve;
        }
        if self.markdown_dir.is_some() {
            base.markdown_dir = self.markdown_dir.clone();
        }
        if self.json_dir.is_some() {
            base.json_dir = self.json_dir.clone();
        }
        if self.json_file.is_some() {
            base.json_file = self.json_file.clone();
        }
    }
}

/// Replaces `${NAME}` with the value of env var `NAME`; unset vars expand to "".
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        out.push_str(&env::var(name).unwrap_or_default());
        rest = &rest[start + 3 + len..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_all_fields() {
        let config = ChatlogConfig::parse(
            r#"
            output_dir = "/archive"
            format = "markdown"
            json_mode = "multiple"
            preserve_timestamps = false
            jobs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.format, Some(OutputFormat::Markdown));
        assert_eq!(config.json_mode, Some(JsonMode::Multiple));
        assert_eq!(config.jobs, Some(3));

        let mut options = OutputOptions::default();
        config.apply(&mut options);
        assert_eq!(options.output_dir, PathBuf::from("/archive"));
        assert!(!options.preserve_timestamps);
        assert_eq!(options.json_file, None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ChatlogConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, ChatlogConfig::default());
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "format = [unclosed").unwrap();
        let err = ChatlogConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ChatlogError::Config { .. }));

        fs::write(&path, "format = \"pdf\"").unwrap();
        assert!(ChatlogConfig::load_from(&path).is_err());
    }

    #[test]
    fn expands_env_references() {
        assert_eq!(expand_env("plain/path"), "plain/path");
        assert_eq!(expand_env("${CHATLOG_TEST_SURELY_UNSET}/out"), "/out");
        assert_eq!(expand_env("broken ${ref"), "broken ${ref");
        let home = env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env("${HOME}/x"), format!("{home}/x"));
    }
}

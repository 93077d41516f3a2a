use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use taskview_sync::{read_config_file, SyncConfig};

/// Optional TOML file layered between built-in defaults and the command line.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub sync: SyncConfig,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub base_url: Option<String>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub admin_token: Option<String>,
    pub push_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub base_url: String,
    pub admin_token: Option<String>,
    pub sync: SyncConfig,
}

pub fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let contents = read_config_file(path)?;
    parse_file_config(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn parse_file_config(contents: &str) -> Result<FileConfig> {
    Ok(toml::from_str(contents)?)
}

/// Flags beat the file; the file beats defaults.
pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Settings> {
    let base_url = overrides
        .base_url
        .or(file.server.base_url)
        .filter(|url| !url.trim().is_empty())
        .context("no server url; pass --base-url or set TASKVIEW_BASE_URL")?;
    let admin_token = overrides
        .admin_token
        .or(file.server.admin_token)
        .filter(|token| !token.trim().is_empty());
    let mut sync = file.sync;
    if let Some(push_enabled) = overrides.push_enabled {
        sync.push_enabled = push_enabled;
    }
    sync.validate()?;
    Ok(Settings {
        base_url,
        admin_token,
        sync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_fills_gaps_and_flags_win() {
        let file = parse_file_config(
            r#"
[server]
base_url = "http://file:8000"
admin_token = "from-file"

[sync]
snapshot_interval_ms = 5000
push_enabled = true
"#,
        )
        .expect("parse");
        let settings = resolve(
            file,
            Overrides {
                base_url: Some("http://flag:9000".to_string()),
                admin_token: None,
                push_enabled: Some(false),
            },
        )
        .expect("resolve");
        assert_eq!(settings.base_url, "http://flag:9000");
        assert_eq!(settings.admin_token.as_deref(), Some("from-file"));
        assert_eq!(settings.sync.snapshot_interval_ms, 5_000);
        assert_eq!(settings.sync.delta_interval_ms, 1_500);
        assert!(!settings.sync.push_enabled);
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = resolve(FileConfig::default(), Overrides::default()).expect_err("no url");
        assert!(err.to_string().contains("--base-url"));
    }
}

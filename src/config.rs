use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::fs;
use url::Url;

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_base_url: Option<Url>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    upload_base_url: Option<Url>,
}

pub struct Config {
    pub upload_base_url: Url,
}

fn merge_config(base: ConfigFile, override_config: ConfigEnv) -> Result<Config> {
    let upload_base_url = override_config
        .upload_base_url
        .or(base.upload_base_url)
        .ok_or(anyhow!(
            "No upload base URL configured. Run `lorry config` or set UPLOAD_BASE_URL"
        ))?;

    Ok(Config { upload_base_url })
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("io", "lorry", "lorry").ok_or(anyhow!("Unable to determine home directory"))
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = envy::from_env::<ConfigEnv>().unwrap_or_default();

    let config_file = project_dirs()?.config_dir().join("config.toml");
    let file_config = if let Ok(config) = fs::read_to_string(config_file) {
        toml::from_str(&config)?
    } else {
        ConfigFile::default()
    };

    merge_config(file_config, env_config)
}

pub fn write_config(config: ConfigFile) -> Result<()> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).context("Failed to create the config directory")?;

    let contents = toml::to_string_pretty(&config)?;
    fs::write(config_dir.join("config.toml"), contents).context("Failed to write config.toml")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_file() {
        let file = ConfigFile {
            upload_base_url: Some(Url::parse("https://file.example/").unwrap()),
        };
        let env = ConfigEnv {
            upload_base_url: Some(Url::parse("https://env.example/").unwrap()),
        };

        let merged = merge_config(file, env).unwrap();
        assert_eq!(merged.upload_base_url.as_str(), "https://env.example/");
    }

    #[test]
    fn file_value_used_without_override() {
        let file = ConfigFile {
            upload_base_url: Some(Url::parse("https://file.example/").unwrap()),
        };

        let merged = merge_config(file, ConfigEnv::default()).unwrap();
        assert_eq!(merged.upload_base_url.as_str(), "https://file.example/");
    }

    #[test]
    fn missing_base_url_is_an_error() {
        assert!(merge_config(ConfigFile::default(), ConfigEnv::default()).is_err());
    }
}

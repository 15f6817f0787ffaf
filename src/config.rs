//! Configuration management for encore
//!
//! Stores settings in ~/.config/encore/config.json. Secrets never live in the
//! file: they come from the environment, then the system keychain.

use crate::cache::TtlPolicy;
use crate::generate::models::Model;
use crate::keyring;
use crate::pipeline::PipelineSettings;
use crate::quota::DEFAULT_GENERATION_LIMIT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const OPENROUTER_KEY_ENV: &str = "OPENROUTER_API_KEY";
const SPOTIFY_ID_ENV: &str = "SPOTIFY_CLIENT_ID";
const SPOTIFY_SECRET_ENV: &str = "SPOTIFY_CLIENT_SECRET";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Generations an identity may trigger before being refused
    pub generation_limit: u32,
    /// Identities exempt from the generation limit
    pub admin_identities: Vec<String>,
    pub suggestion_ttl_secs: u64,
    pub recommendation_ttl_secs: u64,
    pub influence_ttl_secs: u64,
    pub fallback_ttl_secs: u64,
    pub generation_timeout_secs: u64,
    pub in_flight_wait_secs: u64,
    /// Where the durable store and local cache snapshot live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_client_id: Option<String>,
    /// Model alias or OpenRouter id; unknown values fall back to the default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generation_limit: DEFAULT_GENERATION_LIMIT,
            admin_identities: Vec::new(),
            suggestion_ttl_secs: 5 * 60,
            recommendation_ttl_secs: 7 * 24 * 3600,
            influence_ttl_secs: 30 * 24 * 3600,
            fallback_ttl_secs: 10 * 60,
            generation_timeout_secs: 60,
            in_flight_wait_secs: 75,
            data_dir: None,
            spotify_client_id: None,
            model: None,
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("encore"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit path. A file that fails to parse is moved aside
    /// and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&dir.join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/encore/config.json".to_string())
    }

    /// Directory for the durable store and the local cache snapshot.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join("encore")))
            .unwrap_or_else(|| PathBuf::from(".encore"))
    }

    pub fn model(&self) -> Model {
        self.model
            .as_deref()
            .and_then(Model::parse)
            .unwrap_or_default()
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::from_secs(
            self.suggestion_ttl_secs,
            self.recommendation_ttl_secs,
            self.influence_ttl_secs,
            self.fallback_ttl_secs,
        )
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            ttl: self.ttl_policy(),
            generation_limit: self.generation_limit,
            admin_identities: self.admin_identities.clone(),
            generation_timeout: Duration::from_secs(self.generation_timeout_secs.max(1)),
            in_flight_wait: Duration::from_secs(self.in_flight_wait_secs),
        }
    }

    /// OpenRouter API key (from environment or keychain)
    pub fn get_api_key(&self) -> Option<String> {
        secret_from(OPENROUTER_KEY_ENV, keyring::get_api_key, "read OpenRouter key")
    }

    pub fn has_api_key(&self) -> bool {
        self.get_api_key().is_some()
    }

    /// Spotify client id: environment first, then the config file.
    pub fn spotify_client_id(&self) -> Option<String> {
        env_value(SPOTIFY_ID_ENV).or_else(|| self.spotify_client_id.clone())
    }

    /// Spotify client secret (from environment or keychain)
    pub fn spotify_client_secret(&self) -> Option<String> {
        secret_from(
            SPOTIFY_SECRET_ENV,
            keyring::get_spotify_secret,
            "read Spotify secret",
        )
    }

    /// Store the API key in the keychain and read it back to confirm.
    pub fn set_api_key(&self, key: &str) -> Result<(), String> {
        keyring::set_api_key(key).map_err(|err| {
            format!(
                "Failed to store API key in system keychain: {}. \
                 You can set the {} environment variable instead.",
                err, OPENROUTER_KEY_ENV
            )
        })?;
        match keyring::get_api_key() {
            Ok(Some(stored)) if stored == key => Ok(()),
            Ok(_) => Err(format!(
                "API key verification failed: key was not persisted to keychain. \
                 You can set the {} environment variable instead.",
                OPENROUTER_KEY_ENV
            )),
            Err(err) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}).",
                err
            )),
        }
    }

    pub fn set_spotify_secret(&self, secret: &str) -> Result<(), String> {
        keyring::set_spotify_secret(secret).map_err(|err| {
            format!(
                "Failed to store Spotify secret in system keychain: {}. \
                 You can set the {} environment variable instead.",
                err, SPOTIFY_SECRET_ENV
            )
        })
    }

    /// OpenRouter keys start with `sk-`
    pub fn validate_api_key_format(key: &str) -> bool {
        key.starts_with("sk-")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secret_from(
    env: &str,
    from_keychain: fn() -> Result<Option<String>, String>,
    context: &str,
) -> Option<String> {
    if let Some(value) = env_value(env) {
        return Some(value);
    }
    match from_keychain() {
        Ok(value) => value.filter(|v| !v.trim().is_empty()),
        Err(err) => {
            keyring::warn_keychain_error_once(context, &err);
            None
        }
    }
}

/// Interactive prompt to store the OpenRouter key and, optionally, Spotify credentials
pub fn setup_interactive() -> Result<(), String> {
    use std::io;

    let prompt = |label: &str| -> Result<String, String> {
        print!("  {}: ", label);
        io::stdout().flush().map_err(|e| e.to_string())?;
        let mut line = String::new();
        io::stdin().read_line(&mut line).map_err(|e| e.to_string())?;
        Ok(line.trim().to_string())
    };

    println!();
    println!("  encore uses OpenRouter to generate recommendations.");
    println!("  1. Get an API key at: https://openrouter.ai/keys");
    println!("  2. Paste it below (saved in your system keychain)");
    println!();

    let key = prompt("API Key")?;
    if key.is_empty() {
        return Err("No API key provided".to_string());
    }
    if !Config::validate_api_key_format(&key) {
        println!("  Warning: Key doesn't look like an OpenRouter key (should start with sk-)");
        println!("     Saving anyway...");
    }

    let mut config = Config::load();
    config.set_api_key(&key)?;

    println!();
    println!("  Spotify credentials enable artist lookup (leave blank to skip).");
    let client_id = prompt("Spotify client id")?;
    if !client_id.is_empty() {
        let secret = prompt("Spotify client secret")?;
        if !secret.is_empty() {
            config.set_spotify_secret(&secret)?;
        }
        config.spotify_client_id = Some(client_id);
    }
    config.save()?;

    println!();
    println!("  + Settings saved to {}", Config::config_location());
    println!();
    Ok(())
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(error = %e, "failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

//! Credential storage in the system keychain
//!
//! Both secrets live in one keychain entry, stored as JSON, so a keychain
//! that prompts per entry only prompts once.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

const KEYRING_SERVICE: &str = "encore-credentials";
const KEYRING_USERNAME: &str = "default";

/// All credentials stored in the single keychain entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    openrouter_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spotify_client_secret: Option<String>,
}

type KeyringResult<T> = Result<T, String>;

static CREDENTIALS_CACHE: OnceLock<Mutex<Option<StoredCredentials>>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<Option<StoredCredentials>> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(None))
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("ENCORE_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

/// Warn about keychain errors only once per process
pub fn warn_keychain_error_once(context: &str, err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        context,
        error = err,
        "couldn't access system keychain; set OPENROUTER_API_KEY and SPOTIFY_CLIENT_SECRET to bypass it"
    );
}

fn read_credentials_uncached() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return Ok(StoredCredentials::default());
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => parse_credentials(&json),
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn parse_credentials(json: &str) -> KeyringResult<StoredCredentials> {
    serde_json::from_str(json).map_err(|e| format!("Failed to parse credentials: {}", e))
}

fn write_credentials(creds: &StoredCredentials) -> KeyringResult<()> {
    if keyring_disabled() {
        return Err("keychain access is disabled (ENCORE_DISABLE_KEYRING)".to_string());
    }
    let json = serde_json::to_string(creds).map_err(|e| e.to_string())?;
    keyring_entry()
        .and_then(|entry| entry.set_password(&json))
        .map_err(|e| e.to_string())
}

fn read_credentials_cached() -> KeyringResult<StoredCredentials> {
    let mut guard = credentials_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(creds) = guard.as_ref() {
        return Ok(creds.clone());
    }
    let creds = read_credentials_uncached()?;
    *guard = Some(creds.clone());
    Ok(creds)
}

fn update_cache(creds: StoredCredentials) {
    let mut guard = credentials_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(creds);
}

fn update(apply: impl FnOnce(&mut StoredCredentials)) -> KeyringResult<()> {
    let mut creds = read_credentials_cached().unwrap_or_default();
    apply(&mut creds);
    write_credentials(&creds)?;
    update_cache(creds);
    Ok(())
}

/// OpenRouter API key from the keychain
pub fn get_api_key() -> KeyringResult<Option<String>> {
    Ok(read_credentials_cached()?.openrouter_api_key)
}

pub fn set_api_key(key: &str) -> KeyringResult<()> {
    update(|creds| creds.openrouter_api_key = Some(key.to_string()))
}

/// Spotify client secret from the keychain
pub fn get_spotify_secret() -> KeyringResult<Option<String>> {
    Ok(read_credentials_cached()?.spotify_client_secret)
}

pub fn set_spotify_secret(secret: &str) -> KeyringResult<()> {
    update(|creds| creds.spotify_client_secret = Some(secret.to_string()))
}

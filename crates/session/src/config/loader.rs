//! Configuration loader
//!
//! Loads the session configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. First, attempts to load from environment variables
//! 2. If the required ones are missing, falls back to loading from file
//! 3. Probes multiple paths for config files
//! 4. Supports JSON and TOML formats
//!
//! The result is validated before it is returned.
//!
//! ## Environment Variables
//! - `TETHER_ISSUER`: Issuer base URL (required)
//! - `TETHER_CLIENT_ID`: OAuth client id (required)
//! - `TETHER_REDIRECT_URI`: Custom-scheme redirect URI (required)
//! - `TETHER_SCOPES`: Space-separated scopes
//! - `TETHER_AUDIENCE`: API audience
//! - `TETHER_AUTHORIZE_PATH`, `TETHER_TOKEN_PATH`: Endpoint paths
//! - `TETHER_REVOKE_PATH`: Revocation path; empty disables revocation
//! - `TETHER_RENEWAL_BUFFER_SECS`: Renewal buffer in seconds
//! - `TETHER_AUTH_FLOW_STALENESS_SECS`: Abandoned-flow window in seconds
//! - `TETHER_BACKGROUND_INTERVAL_SECS`: Background renewal interval
//! - `TETHER_KEYCHAIN_SERVICE`: Keychain service name
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./tether.toml` or `./tether.json` (current working directory)
//! 2. `./config.toml` or `./config.json` (current working directory)
//! 3. The same names in the parent and grandparent directories
//! 4. Relative to executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tether_common::error::{CommonError, CommonResult};

use super::{OAuthSettings, SessionConfig};

const CONFIG_FILE_NAMES: [&str; 4] = ["tether.toml", "tether.json", "config.toml", "config.json"];

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns `CommonError::Config` if neither source yields a configuration,
/// the file is malformed, or validation fails.
pub fn load() -> CommonResult<SessionConfig> {
    let config = match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            config
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to load from environment, trying file");
            load_from_file(None)?
        }
    };

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// # Errors
/// Returns `CommonError::Config` if a required variable is missing or a
/// numeric variable does not parse.
pub fn load_from_env() -> CommonResult<SessionConfig> {
    let mut oauth = OAuthSettings::new(
        env_var("TETHER_ISSUER")?,
        env_var("TETHER_CLIENT_ID")?,
        env_var("TETHER_REDIRECT_URI")?,
    );

    if let Some(scopes) = env_opt("TETHER_SCOPES") {
        oauth.scopes = scopes.split_whitespace().map(ToString::to_string).collect();
    }
    oauth.audience = env_opt("TETHER_AUDIENCE");
    if let Some(path) = env_opt("TETHER_AUTHORIZE_PATH") {
        oauth.authorize_path = path;
    }
    if let Some(path) = env_opt("TETHER_TOKEN_PATH") {
        oauth.token_path = path;
    }
    if let Ok(path) = std::env::var("TETHER_REVOKE_PATH") {
        oauth.revoke_path = (!path.trim().is_empty()).then_some(path);
    }

    let mut config = SessionConfig::new(oauth);
    if let Some(secs) = env_parse("TETHER_RENEWAL_BUFFER_SECS")? {
        config.renewal_buffer_secs = secs;
    }
    if let Some(secs) = env_parse("TETHER_AUTH_FLOW_STALENESS_SECS")? {
        config.auth_flow_staleness_secs = secs;
    }
    if let Some(secs) = env_parse("TETHER_BACKGROUND_INTERVAL_SECS")? {
        config.background_interval_secs = secs;
    }
    if let Some(service) = env_opt("TETHER_KEYCHAIN_SERVICE") {
        config.keychain_service = service;
    }

    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is detected
/// by file extension.
///
/// # Errors
/// Returns `CommonError::Config` if the file is missing or has an unknown
/// extension, `Persistence` if it cannot be read and `Serialization` if it
/// is malformed.
pub fn load_from_file(path: Option<PathBuf>) -> CommonResult<SessionConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(CommonError::config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            CommonError::config("No config file found in any of the standard locations")
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)?;

    parse_config(&contents, &config_path)
}

/// Parse configuration from string content, by the extension of `path`
fn parse_config(contents: &str, path: &Path) -> CommonResult<SessionConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => Ok(toml::from_str(contents)?),
        "json" => Ok(serde_json::from_str(contents)?),
        _ => Err(CommonError::config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe the standard locations for a configuration file
///
/// Searches the working directory, its two parents, then the same three
/// levels relative to the executable.
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    {
        roots.push(exe_dir);
    }

    roots
        .iter()
        .flat_map(|root| [root.clone(), root.join(".."), root.join("../..")])
        .flat_map(|dir| CONFIG_FILE_NAMES.map(|name| dir.join(name)))
        .find(|path| path.exists())
}

/// Get required environment variable
fn env_var(key: &str) -> CommonResult<String> {
    std::env::var(key).map_err(|_| {
        CommonError::config_field(key, format!("Missing required environment variable: {key}"))
    })
}

/// Get optional, non-empty environment variable
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional numeric environment variable
fn env_parse<T>(key: &str) -> CommonResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_opt(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CommonError::config_field(key, format!("Invalid value {raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    //! Unit tests for config::loader.
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 12] = [
        "TETHER_ISSUER",
        "TETHER_CLIENT_ID",
        "TETHER_REDIRECT_URI",
        "TETHER_SCOPES",
        "TETHER_AUDIENCE",
        "TETHER_AUTHORIZE_PATH",
        "TETHER_TOKEN_PATH",
        "TETHER_REVOKE_PATH",
        "TETHER_RENEWAL_BUFFER_SECS",
        "TETHER_AUTH_FLOW_STALENESS_SECS",
        "TETHER_BACKGROUND_INTERVAL_SECS",
        "TETHER_KEYCHAIN_SERVICE",
    ];

    fn clear_env() {
        for key in ALL_VARS {
            std::env::remove_var(key);
        }
    }

    fn set_required() {
        std::env::set_var("TETHER_ISSUER", "https://login.example.com");
        std::env::set_var("TETHER_CLIENT_ID", "client-1");
        std::env::set_var("TETHER_REDIRECT_URI", "tether://callback");
    }

    /// Validates loading with every variable set.
    ///
    /// Assertions:
    /// - Scopes are split on whitespace.
    /// - An empty revoke path disables revocation.
    /// - Numeric settings override the defaults.
    #[test]
    fn test_load_from_env_all_vars_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_required();
        std::env::set_var("TETHER_SCOPES", "openid offline_access");
        std::env::set_var("TETHER_AUDIENCE", "https://api.example.com");
        std::env::set_var("TETHER_TOKEN_PATH", "/token");
        std::env::set_var("TETHER_REVOKE_PATH", "");
        std::env::set_var("TETHER_RENEWAL_BUFFER_SECS", "120");
        std::env::set_var("TETHER_BACKGROUND_INTERVAL_SECS", "3600");
        std::env::set_var("TETHER_KEYCHAIN_SERVICE", "tether.test");

        let config = load_from_env().unwrap();
        assert_eq!(config.oauth.scopes, vec!["openid".to_string(), "offline_access".to_string()]);
        assert_eq!(config.oauth.audience.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.oauth.token_path, "/token");
        assert_eq!(config.oauth.revoke_path, None);
        assert_eq!(config.renewal_buffer_secs, 120);
        assert_eq!(config.auth_flow_staleness_secs, 600);
        assert_eq!(config.background_interval_secs, 3600);
        assert_eq!(config.keychain_service, "tether.test");

        clear_env();
    }

    /// Validates that a missing required variable is a `Config` error.
    #[test]
    fn test_load_from_env_missing_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("TETHER_ISSUER", "https://login.example.com");

        let err = load_from_env().unwrap_err();
        assert!(matches!(err, CommonError::Config { .. }), "Should be a Config error");

        clear_env();
    }

    /// Validates that an unparsable number is rejected.
    #[test]
    fn test_load_from_env_invalid_number() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_required();
        std::env::set_var("TETHER_RENEWAL_BUFFER_SECS", "soon");

        assert!(load_from_env().is_err());

        clear_env();
    }

    /// Validates TOML file loading with the default fill-in.
    #[test]
    fn test_load_from_file_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            renewal_buffer_secs = 60

            [oauth]
            issuer = "https://login.example.com"
            client_id = "client-1"
            redirect_uri = "tether://callback"
            "#
        )
        .unwrap();

        let config = load_from_file(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.renewal_buffer_secs, 60);
        assert_eq!(config.oauth.token_path, "/oauth/token");
    }

    /// Validates JSON file loading.
    #[test]
    fn test_load_from_file_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "oauth": {{
                    "issuer": "https://login.example.com",
                    "client_id": "client-1",
                    "redirect_uri": "tether://callback",
                    "revoke_path": null
                }},
                "keychain_service": "tether.json"
            }}"#
        )
        .unwrap();

        let config = load_from_file(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.keychain_service, "tether.json");
        assert_eq!(config.oauth.revoke_path, None);
    }

    /// Validates the file error cases.
    ///
    /// Assertions:
    /// - A missing path is a `Config` error.
    /// - Malformed content is a `Serialization` error naming the format.
    /// - An unknown extension is a `Config` error.
    #[test]
    fn test_load_from_file_errors() {
        let missing = load_from_file(Some(PathBuf::from("/nonexistent/tether.toml")));
        assert!(matches!(missing, Err(CommonError::Config { .. })));

        let mut broken = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(broken, "[oauth\nissuer = ").unwrap();
        let malformed = load_from_file(Some(broken.path().to_path_buf()));
        assert!(matches!(
            malformed,
            Err(CommonError::Serialization { format: Some(ref f), .. }) if f == "TOML"
        ));

        let yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            load_from_file(Some(yaml.path().to_path_buf())),
            Err(CommonError::Config { .. })
        ));
    }
}

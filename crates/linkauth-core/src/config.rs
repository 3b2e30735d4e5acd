use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::{AuthKind, BrowserMode, Credential};

/// Locates the document-storage directory that holds per-account settings files.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent storage directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "linkauth", "linkauth")
            .ok_or(ConfigError::MissingProjectDirs)?;
        Self::at(dirs.data_dir())
    }

    /// Use an explicit directory instead of the platform default.
    pub fn at(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the settings file for the given account.
    pub fn settings_file(&self, account_id: &str) -> PathBuf {
        self.root.join(format!("{account_id}.settings"))
    }

    #[cfg(test)]
    pub(crate) fn from_root_for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Recognized keys of the per-account options bundle. Every key is optional and only
/// overrides the stored value when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccountOptions {
    pub keep_device_settings: Option<bool>,
    #[serde(deserialize_with = "browser_mode_from_str")]
    pub browser_mode: Option<BrowserMode>,
    pub custom_user_agent: Option<String>,
    pub cookies_domain: Option<String>,
    pub cookie_session_id_field: Option<String>,
    pub app_id: Option<String>,
}

impl AccountOptions {
    /// Parse an options bundle from a JSON object. Unknown keys are ignored.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        Self::deserialize(value).map_err(ConfigError::InvalidOption)
    }

    /// Apply the present keys to a credential, retaining prior values for absent ones.
    pub fn apply(&self, credential: &mut Credential) {
        if let Some(keep) = self.keep_device_settings {
            credential.browser.keep_device_settings = keep;
        }
        if let Some(mode) = self.browser_mode {
            credential.browser.mode = mode;
        }
        if let Some(agent) = &self.custom_user_agent {
            credential.browser.custom_user_agent = Some(agent.clone());
        }
        if let Some(app_id) = &self.app_id {
            credential.app_id = Some(app_id.clone());
        }
        if let AuthKind::Cookie {
            cookies_domain,
            session_cookie_field,
            ..
        } = &mut credential.auth
        {
            if let Some(domain) = &self.cookies_domain {
                *cookies_domain = domain.clone();
            }
            if let Some(field) = &self.cookie_session_id_field {
                *session_cookie_field = field.clone();
            }
        }
    }
}

fn browser_mode_from_str<'de, D>(deserializer: D) -> Result<Option<BrowserMode>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| raw.parse::<BrowserMode>().map_err(de::Error::custom))
        .transpose()
}

/// Errors that can occur when working with configuration directories and options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine storage directory for linkauth")]
    MissingProjectDirs,
    #[error("failed to create storage directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid options: {0}")]
    InvalidOption(#[source] serde_json::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn settings_file_uses_account_identifier() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::from_root_for_tests(temp_dir.path().to_path_buf());
        let path = locator.settings_file("instagram-42");
        assert!(path.ends_with("instagram-42.settings"));
    }

    #[test]
    fn options_apply_only_present_keys() {
        let mut credential = Credential::new(
            "acct",
            "instagram",
            AuthKind::empty_cookie(".instagram.com", "sessionid"),
        );
        credential.browser.custom_user_agent = Some("kept".into());

        let options = AccountOptions::from_json(&json!({
            "browser_mode": "desktop",
            "cookie_session_id_field": "ds_user_id",
            "app_id": "936619743392459",
            "unrelated": 12
        }))
        .unwrap();
        options.apply(&mut credential);

        assert_eq!(credential.browser.mode, BrowserMode::Desktop);
        assert_eq!(credential.browser.custom_user_agent.as_deref(), Some("kept"));
        assert_eq!(credential.app_id.as_deref(), Some("936619743392459"));
        match &credential.auth {
            AuthKind::Cookie {
                cookies_domain,
                session_cookie_field,
                ..
            } => {
                assert_eq!(cookies_domain, ".instagram.com");
                assert_eq!(session_cookie_field, "ds_user_id");
            }
            other => panic!("unexpected auth kind: {other:?}"),
        }
    }

    #[test]
    fn options_reject_wrong_types() {
        let err = AccountOptions::from_json(&json!({ "keep_device_settings": "yes" })).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption(_)));

        let err = AccountOptions::from_json(&json!({ "browser_mode": "tablet" })).unwrap_err();
        assert!(err.to_string().contains("tablet"));

        let err = AccountOptions::from_json(&json!(42)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption(_)));
    }

    #[test]
    fn options_accept_nulls_and_mode_aliases() {
        let options = AccountOptions::from_json(&json!({
            "browser_mode": "Default",
            "custom_user_agent": null,
            "keep_device_settings": true
        }))
        .unwrap();
        assert_eq!(options.browser_mode, Some(BrowserMode::Device));
        assert_eq!(options.custom_user_agent, None);
        assert_eq!(options.keep_device_settings, Some(true));
    }
}

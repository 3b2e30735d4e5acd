use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigLocator;

use super::credential::{AuthKind, BrowserIdentity, BrowserMode, Cookie, Credential};
use super::StorageError;

/// Persistence abstraction for linked-account credentials.
pub trait CredentialStore {
    /// Absence of a record is `Ok(None)`, not an error.
    fn load(&self, account_id: &str) -> Result<Option<Credential>, StorageError>;
    fn save(&self, credential: &Credential) -> Result<(), StorageError>;
    fn clear(&self, account_id: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed storage writing one `<account>.settings` file per account.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    locator: ConfigLocator,
}

impl FileCredentialStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, StorageError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    /// Write to a sibling temp file, fsync, then rename over the target so a crash never
    /// leaves a truncated settings file behind.
    fn write_atomically(path: &Path, payload: &str) -> Result<(), StorageError> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidAccountId(path.display().to_string()))?;
        fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::InvalidAccountId(path.display().to_string()))?;
        let tmp_path = dir.join(format!(
            ".{file_name}.tmp.{}",
            std::time::SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));

        let result = (|| -> Result<(), std::io::Error> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
            }

            fs::rename(&tmp_path, path)?;
            if let Ok(parent) = fs::File::open(dir) {
                let _ = parent.sync_all();
            }
            Ok(())
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

fn validate_account_id(account_id: &str) -> Result<(), StorageError> {
    let invalid = account_id.is_empty()
        || account_id.starts_with('.')
        || account_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidAccountId(account_id.to_owned()));
    }
    Ok(())
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, account_id: &str) -> Result<Option<Credential>, StorageError> {
        validate_account_id(account_id)?;
        let path = self.locator.settings_file(account_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let record: SettingsRecord = serde_json::from_str(&raw)?;
        Ok(Some(record.into_credential(account_id)))
    }

    fn save(&self, credential: &Credential) -> Result<(), StorageError> {
        validate_account_id(&credential.account_id)?;
        let path = self.locator.settings_file(&credential.account_id);
        let payload = serde_json::to_string_pretty(&SettingsRecord::from_credential(credential))?;
        Self::write_atomically(&path, &payload)?;
        debug!(account = %credential.account_id, kind = credential.auth.kind_name(), "saved account settings");
        Ok(())
    }

    fn clear(&self, account_id: &str) -> Result<(), StorageError> {
        validate_account_id(account_id)?;
        let path = self.locator.settings_file(account_id);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Flat key-value bundle stored in a settings file. Every key defaults so that files
/// written by older or newer versions still load.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SettingsRecord {
    version: u32,
    provider: String,
    auth_kind: Option<String>,
    cookies_domain: String,
    cookie_session_id_field: String,
    browser_mode: BrowserMode,
    custom_user_agent: Option<String>,
    keep_device_settings: bool,
    locale_identifiers: Vec<String>,
    session_id: String,
    csrf_token: String,
    cookies: Vec<Cookie>,
    consumer_key: String,
    consumer_secret: String,
    token: String,
    token_secret: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    app_id: Option<String>,
    username: Option<String>,
}

const SETTINGS_VERSION: u32 = 1;

impl SettingsRecord {
    fn from_credential(credential: &Credential) -> Self {
        let mut record = SettingsRecord {
            version: SETTINGS_VERSION,
            provider: credential.provider.clone(),
            auth_kind: Some(credential.auth.kind_name().to_owned()),
            browser_mode: credential.browser.mode,
            custom_user_agent: credential.browser.custom_user_agent.clone(),
            keep_device_settings: credential.browser.keep_device_settings,
            locale_identifiers: credential.browser.locale_identifiers.clone(),
            app_id: credential.app_id.clone(),
            username: credential.username.clone(),
            ..Default::default()
        };

        match &credential.auth {
            AuthKind::OAuth1 {
                consumer_key,
                consumer_secret,
                token,
                token_secret,
            } => {
                record.consumer_key = consumer_key.clone();
                record.consumer_secret = consumer_secret.clone();
                record.token = token.clone();
                record.token_secret = token_secret.clone();
            }
            AuthKind::OAuth2 {
                access_token,
                refresh_token,
                expires_at,
            } => {
                record.access_token = access_token.clone();
                record.refresh_token = refresh_token.clone();
                record.expires_at = *expires_at;
            }
            AuthKind::Cookie {
                session_id,
                csrf_token,
                cookies,
                cookies_domain,
                session_cookie_field,
            } => {
                record.session_id = session_id.clone();
                record.csrf_token = csrf_token.clone();
                record.cookies = cookies
                    .iter()
                    .filter(|cookie| cookie.matches_domain(cookies_domain))
                    .cloned()
                    .collect();
                record.cookies_domain = cookies_domain.clone();
                record.cookie_session_id_field = session_cookie_field.clone();
            }
        }
        record
    }

    fn into_credential(self, account_id: &str) -> Credential {
        let kind = self.auth_kind.clone().unwrap_or_else(|| self.infer_kind());
        let auth = match kind.as_str() {
            "oauth1" => AuthKind::OAuth1 {
                consumer_key: self.consumer_key,
                consumer_secret: self.consumer_secret,
                token: self.token,
                token_secret: self.token_secret,
            },
            "cookie" => AuthKind::Cookie {
                session_id: self.session_id,
                csrf_token: self.csrf_token,
                cookies: self.cookies,
                cookies_domain: self.cookies_domain,
                session_cookie_field: self.cookie_session_id_field,
            },
            _ => AuthKind::OAuth2 {
                access_token: self.access_token,
                refresh_token: self.refresh_token,
                expires_at: self.expires_at,
            },
        };

        Credential {
            account_id: account_id.to_owned(),
            provider: self.provider,
            auth,
            browser: BrowserIdentity {
                mode: self.browser_mode,
                custom_user_agent: self.custom_user_agent,
                locale_identifiers: self.locale_identifiers,
                keep_device_settings: self.keep_device_settings,
            },
            app_id: self.app_id,
            username: self.username,
        }
    }

    fn infer_kind(&self) -> String {
        if !self.token_secret.is_empty() || !self.consumer_key.is_empty() {
            "oauth1".into()
        } else if !self.cookies_domain.is_empty() || !self.session_id.is_empty() {
            "cookie".into()
        } else {
            "oauth2".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn store_in(temp_dir: &TempDir) -> FileCredentialStore {
        FileCredentialStore::new(ConfigLocator::from_root_for_tests(
            temp_dir.path().to_path_buf(),
        ))
    }

    fn cookie_credential() -> Credential {
        let mut session = Cookie::new("sessionid", "s3ss10n", ".instagram.com");
        session.expires = Some(Utc.with_ymd_and_hms(2031, 5, 1, 12, 0, 0).unwrap());
        session.http_only = true;
        let mut credential = Credential::new(
            "ig-main",
            "instagram",
            AuthKind::Cookie {
                session_id: "s3ss10n".into(),
                csrf_token: "csrf".into(),
                cookies: vec![session, Cookie::new("csrftoken", "csrf", "www.instagram.com")],
                cookies_domain: ".instagram.com".into(),
                session_cookie_field: "sessionid".into(),
            },
        );
        credential.browser = BrowserIdentity {
            mode: BrowserMode::Mobile,
            custom_user_agent: Some("Custom/1.0".into()),
            locale_identifiers: vec!["en_US".into(), "fr_FR".into()],
            keep_device_settings: false,
        };
        credential.app_id = Some("936619743392459".into());
        credential.username = Some("photographer".into());
        credential
    }

    #[test]
    fn round_trip_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);

        let credential = cookie_credential();
        store.save(&credential).unwrap();
        assert_eq!(store.load("ig-main").unwrap().unwrap(), credential);

        let oauth2 = Credential::new(
            "reddit-1",
            "reddit",
            AuthKind::OAuth2 {
                access_token: "token".into(),
                refresh_token: Some("refresh".into()),
                expires_at: Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
            },
        );
        store.save(&oauth2).unwrap();
        assert_eq!(store.load("reddit-1").unwrap().unwrap(), oauth2);
    }

    #[test]
    fn save_drops_cookies_outside_scope() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut credential = cookie_credential();
        if let AuthKind::Cookie { cookies, .. } = &mut credential.auth {
            cookies.push(Cookie::new("tracker", "x", ".example.com"));
        }
        store.save(&credential).unwrap();
        let loaded = store.load("ig-main").unwrap().unwrap();
        assert_eq!(loaded, cookie_credential());
    }

    #[test]
    fn partial_records_keep_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        fs::write(
            temp_dir.path().join("legacy.settings"),
            r#"{ "provider": "instagram", "cookies_domain": ".instagram.com", "session_id": "abc", "future_field": true }"#,
        )
        .unwrap();

        let loaded = store.load("legacy").unwrap().unwrap();
        assert_eq!(loaded.browser.mode, BrowserMode::Device);
        assert!(loaded.app_id.is_none());
        match loaded.auth {
            AuthKind::Cookie {
                session_id,
                csrf_token,
                cookies_domain,
                ..
            } => {
                assert_eq!(session_id, "abc");
                assert!(csrf_token.is_empty());
                assert_eq!(cookies_domain, ".instagram.com");
            }
            other => panic!("unexpected auth kind: {other:?}"),
        }
    }

    #[test]
    fn missing_record_is_none_and_corrupt_record_errors() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert!(store.load("nobody").unwrap().is_none());

        fs::write(temp_dir.path().join("broken.settings"), "{ not json").unwrap();
        assert!(matches!(
            store.load("broken").unwrap_err(),
            StorageError::Serde(_)
        ));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let mut credential = Credential::new("gh", "github", AuthKind::empty_oauth2());
        store.save(&credential).unwrap();
        credential.auth = AuthKind::OAuth2 {
            access_token: "new".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };
        store.save(&credential).unwrap();

        let entries: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["gh.settings".to_string()]);
    }

    #[test]
    fn clear_missing_is_ok_and_rejects_path_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        store.clear("missing").unwrap();
        assert!(matches!(
            store.clear("../escape").unwrap_err(),
            StorageError::InvalidAccountId(_)
        ));
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Browser profile presented to the provider by the embedded web view and by API calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrowserMode {
    #[default]
    Device,
    Desktop,
    Mobile,
}

impl std::str::FromStr for BrowserMode {
    type Err = InvalidBrowserMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "device" | "default" => Ok(BrowserMode::Device),
            "desktop" => Ok(BrowserMode::Desktop),
            "mobile" => Ok(BrowserMode::Mobile),
            other => Err(InvalidBrowserMode(other.to_owned())),
        }
    }
}

impl std::fmt::Display for BrowserMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            BrowserMode::Device => "device",
            BrowserMode::Desktop => "desktop",
            BrowserMode::Mobile => "mobile",
        };
        write!(f, "{value}")
    }
}

/// Error reported when parsing an unsupported browser mode.
#[derive(Debug, thiserror::Error)]
#[error("invalid browser mode '{0}'")]
pub struct InvalidBrowserMode(pub String);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub mode: BrowserMode,
    pub custom_user_agent: Option<String>,
    pub locale_identifiers: Vec<String>,
    /// When set, requests present the device user agent and ignore the custom override.
    #[serde(default)]
    pub keep_device_settings: bool,
}

/// A single HTTP cookie as held by the shared cookie jar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".into()
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            expires: None,
            secure: true,
            http_only: false,
        }
    }

    /// Whether this cookie belongs to `scope` (the scope itself or any subdomain of it).
    pub fn matches_domain(&self, scope: &str) -> bool {
        let cookie_domain = normalize_domain(&self.domain);
        let scope = normalize_domain(scope);
        if scope.is_empty() {
            return false;
        }
        cookie_domain == scope || cookie_domain.ends_with(&format!(".{scope}"))
    }

    pub fn is_expired(&self) -> bool {
        self.expires.map(|ts| Utc::now() >= ts).unwrap_or(false)
    }

    pub(crate) fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name
            && normalize_domain(&self.domain) == normalize_domain(&other.domain)
            && self.path == other.path
    }
}

pub(crate) fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Authentication material for one linked account. Exactly one variant is populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthKind {
    #[serde(rename = "oauth1")]
    OAuth1 {
        consumer_key: String,
        consumer_secret: String,
        token: String,
        token_secret: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    Cookie {
        session_id: String,
        csrf_token: String,
        cookies: Vec<Cookie>,
        cookies_domain: String,
        session_cookie_field: String,
    },
}

impl AuthKind {
    pub fn empty_oauth1(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        AuthKind::OAuth1 {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: String::new(),
            token_secret: String::new(),
        }
    }

    pub fn empty_oauth2() -> Self {
        AuthKind::OAuth2 {
            access_token: String::new(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn empty_cookie(
        cookies_domain: impl Into<String>,
        session_cookie_field: impl Into<String>,
    ) -> Self {
        AuthKind::Cookie {
            session_id: String::new(),
            csrf_token: String::new(),
            cookies: vec![],
            cookies_domain: cookies_domain.into(),
            session_cookie_field: session_cookie_field.into(),
        }
    }

    /// Pure function of the populated variant's required fields.
    pub fn is_authorized(&self) -> bool {
        match self {
            AuthKind::OAuth1 {
                consumer_key,
                consumer_secret,
                token,
                token_secret,
            } => {
                !consumer_key.is_empty()
                    && !consumer_secret.is_empty()
                    && !token.is_empty()
                    && !token_secret.is_empty()
            }
            AuthKind::OAuth2 { access_token, .. } => !access_token.is_empty(),
            AuthKind::Cookie {
                session_id,
                csrf_token,
                ..
            } => !session_id.is_empty() && !csrf_token.is_empty(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthKind::OAuth1 { .. } => "oauth1",
            AuthKind::OAuth2 { .. } => "oauth2",
            AuthKind::Cookie { .. } => "cookie",
        }
    }

    pub fn cookies_domain(&self) -> Option<&str> {
        match self {
            AuthKind::Cookie { cookies_domain, .. } => Some(cookies_domain),
            _ => None,
        }
    }
}

/// A persisted linked account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub account_id: String,
    pub provider: String,
    pub auth: AuthKind,
    pub browser: BrowserIdentity,
    pub app_id: Option<String>,
    pub username: Option<String>,
}

impl Credential {
    pub fn new(account_id: impl Into<String>, provider: impl Into<String>, auth: AuthKind) -> Self {
        Self {
            account_id: account_id.into(),
            provider: provider.into(),
            auth,
            browser: BrowserIdentity::default(),
            app_id: None,
            username: None,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.auth.is_authorized()
    }

    /// OAuth2 access token expiry; `None` for other kinds or tokens without expiry.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match &self.auth {
            AuthKind::OAuth2 { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        match self.expires_at() {
            Some(ts) => Utc::now() + window >= ts,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_requires_every_field() {
        let mut auth = AuthKind::empty_oauth1("key", "secret");
        assert!(!auth.is_authorized());
        if let AuthKind::OAuth1 { token, .. } = &mut auth {
            *token = "token".into();
        }
        assert!(!auth.is_authorized());
        if let AuthKind::OAuth1 { token_secret, .. } = &mut auth {
            *token_secret = "token-secret".into();
        }
        assert!(auth.is_authorized());

        let cookie = AuthKind::Cookie {
            session_id: "abc".into(),
            csrf_token: String::new(),
            cookies: vec![],
            cookies_domain: ".instagram.com".into(),
            session_cookie_field: "sessionid".into(),
        };
        assert!(!cookie.is_authorized());
    }

    #[test]
    fn oauth2_expiry_detection() {
        let credential = Credential::new(
            "acct",
            "reddit",
            AuthKind::OAuth2 {
                access_token: "token".into(),
                refresh_token: Some("refresh".into()),
                expires_at: Some(Utc::now() + Duration::minutes(1)),
            },
        );
        assert!(credential.is_authorized());
        assert!(credential.will_expire_within(Duration::minutes(2)));
        assert!(!credential.will_expire_within(Duration::seconds(0)));
    }

    #[test]
    fn cookie_domain_matching_is_scoped() {
        let cookie = Cookie::new("sessionid", "v", ".instagram.com");
        assert!(cookie.matches_domain("instagram.com"));
        assert!(cookie.matches_domain(".instagram.com"));
        assert!(Cookie::new("a", "b", "www.instagram.com").matches_domain(".instagram.com"));
        assert!(!Cookie::new("a", "b", "notinstagram.com").matches_domain("instagram.com"));
        assert!(!cookie.matches_domain("facebook.com"));
        assert!(!cookie.matches_domain(""));
    }

    #[test]
    fn browser_mode_parse() {
        assert_eq!("Desktop".parse::<BrowserMode>().unwrap(), BrowserMode::Desktop);
        assert_eq!("default".parse::<BrowserMode>().unwrap(), BrowserMode::Device);
        assert_eq!("tablet".parse::<BrowserMode>().unwrap_err().0, "tablet");
    }
}

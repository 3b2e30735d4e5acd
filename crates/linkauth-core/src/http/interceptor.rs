//! Request adaptation and single-retry recovery around an [`AuthStrategy`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthStrategy, Authorizer, BrowserIdentity, BrowserMode, Credential, CredentialStore};
use crate::providers::ProviderDescriptor;

use super::{ParameterEncoding, RequestContext};

/// One credential value shared by the login flow and the interceptor. The login flow
/// writes it while signing in, the interceptor only while refreshing.
pub type SharedCredential = Arc<RwLock<Credential>>;

pub const DEVICE_USER_AGENT: &str = concat!("linkauth/", env!("CARGO_PKG_VERSION"));
const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15";
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

pub fn user_agent_for(mode: BrowserMode) -> &'static str {
    match mode {
        BrowserMode::Device => DEVICE_USER_AGENT,
        BrowserMode::Desktop => DESKTOP_USER_AGENT,
        BrowserMode::Mobile => MOBILE_USER_AGENT,
    }
}

/// User agent presented for a browser identity.
pub fn user_agent(identity: &BrowserIdentity) -> &str {
    if identity.keep_device_settings {
        return DEVICE_USER_AGENT;
    }
    match identity.custom_user_agent.as_deref() {
        Some(custom) if !custom.trim().is_empty() => custom,
        _ => user_agent_for(identity.mode),
    }
}

/// `Accept-Language` value with descending quality factors: `en-US, fr-FR;q=0.9, de;q=0.8`.
pub fn accept_language(locales: &[String]) -> Option<String> {
    let tags: Vec<String> = locales
        .iter()
        .map(|locale| locale.trim().replace('_', "-"))
        .filter(|locale| !locale.is_empty())
        .take(10)
        .enumerate()
        .map(|(index, tag)| {
            if index == 0 {
                tag
            } else {
                format!("{tag};q=0.{}", 10 - index)
            }
        })
        .collect();
    (!tags.is_empty()).then(|| tags.join(", "))
}

/// Provider extras applied around the strategy's `attach`: fixed parameters before
/// signing, identity and fixed headers after.
#[derive(Debug, Clone, Default)]
pub struct ProviderHeaders {
    fixed_headers: Vec<(String, String)>,
    fixed_params: Vec<(String, String)>,
    app_id_header: Option<String>,
}

impl ProviderHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_provider(provider: &ProviderDescriptor) -> Self {
        let mut headers = Self::new();
        for (name, value) in provider.fixed_headers {
            headers = headers.with_header(*name, *value);
        }
        for (key, value) in provider.fixed_params {
            headers = headers.with_param(*key, *value);
        }
        if let Some(name) = provider.app_id_header {
            headers = headers.with_app_id_header(name);
        }
        headers
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed_params.push((key.into(), value.into()));
        self
    }

    pub fn with_app_id_header(mut self, name: impl Into<String>) -> Self {
        self.app_id_header = Some(name.into());
        self
    }

    /// Add the fixed parameters, replacing caller-supplied values of the same key.
    pub fn prepare(&self, request: &RequestContext) -> RequestContext {
        let mut prepared = request.clone();
        for (key, value) in &self.fixed_params {
            match prepared.encoding {
                ParameterEncoding::Query => prepared.set_query_param(key, value),
                ParameterEncoding::FormBody | ParameterEncoding::JsonBody => {
                    prepared.params.retain(|(existing, _)| existing != key);
                    prepared.params.push((key.clone(), value.clone()));
                }
            }
        }
        prepared
    }

    pub fn decorate(&self, credential: &Credential, mut request: RequestContext) -> RequestContext {
        request.set_header("User-Agent", user_agent(&credential.browser));
        if let Some(languages) = accept_language(&credential.browser.locale_identifiers) {
            request.set_header("Accept-Language", languages);
        }
        for (name, value) in &self.fixed_headers {
            request.set_header(name.as_str(), value.as_str());
        }
        if let (Some(header), Some(app_id)) = (&self.app_id_header, &credential.app_id) {
            request.set_header(header.as_str(), app_id.as_str());
        }
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Valid,
    Refreshing,
    /// Terminal until a new interactive login replaces the credential.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    DoNotRetry,
}

/// Applies an [`AuthStrategy`] plus provider extras to outgoing requests and recovers from
/// a single 401 by refreshing.
pub struct RequestInterceptor {
    strategy: AuthStrategy,
    credential: SharedCredential,
    headers: ProviderHeaders,
    store: Option<Arc<dyn CredentialStore + Send + Sync>>,
    state: Mutex<SessionState>,
    /// Bumped whenever the shared credential is replaced or refreshed.
    generation: AtomicU64,
}

impl fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("strategy", &self.strategy.kind_name())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RequestInterceptor {
    pub fn new(strategy: AuthStrategy, credential: SharedCredential) -> Self {
        Self {
            strategy,
            credential,
            headers: ProviderHeaders::default(),
            store: None,
            state: Mutex::new(SessionState::Valid),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_headers(mut self, headers: ProviderHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Persist refreshed credentials through `store`.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore + Send + Sync>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn strategy(&self) -> &AuthStrategy {
        &self.strategy
    }

    pub fn credential(&self) -> SharedCredential {
        Arc::clone(&self.credential)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn is_authorized(&self) -> bool {
        let credential = self.credential.read().await;
        self.strategy.is_authorized(&credential)
    }

    /// Install credentials from a fresh login and leave the expired state.
    pub async fn replace_credential(&self, credential: Credential) {
        let mut state = self.state.lock().await;
        *self.credential.write().await = credential;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *state = SessionState::Valid;
    }

    /// Authorize and decorate an outgoing request. Side-effect free.
    pub async fn adapt(&self, request: &RequestContext) -> Result<RequestContext, AuthError> {
        if *self.state.lock().await == SessionState::Expired {
            return Err(AuthError::SessionExpired(
                "session expired; sign in again".into(),
            ));
        }
        let credential = self.credential.read().await;
        let prepared = self.headers.prepare(request);
        let mut attached = self.strategy.attach(&credential, &prepared)?;
        attached.credential_generation = self.generation.load(Ordering::SeqCst);
        Ok(self.headers.decorate(&credential, attached))
    }

    /// Decide what to do with a failed response to `sent`, the adapted request. `attempt`
    /// is zero for the first send.
    ///
    /// Only a 401 on the first attempt triggers a refresh; a request is re-sent at most
    /// once whatever its method. A credential refreshed since `sent` was authorized is
    /// reused instead of refreshed again.
    pub async fn retry(
        &self,
        sent: &RequestContext,
        status: StatusCode,
        attempt: u32,
    ) -> Result<RetryDecision, AuthError> {
        if status != StatusCode::UNAUTHORIZED {
            return Ok(RetryDecision::DoNotRetry);
        }
        if attempt >= 1 {
            warn!(strategy = self.strategy.kind_name(), "request rejected after token refresh");
            return Err(AuthError::SessionExpired(
                "unauthorized after token refresh".into(),
            ));
        }

        self.refresh_since(Some(sent.credential_generation)).await?;
        info!(strategy = self.strategy.kind_name(), "retrying request with refreshed credential");
        Ok(RetryDecision::Retry)
    }

    /// Refresh the shared credential through the strategy and persist the result. A
    /// refresh that needs a new login leaves the session expired.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        self.refresh_since(None).await
    }

    async fn refresh_since(&self, seen: Option<u64>) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        if *state == SessionState::Expired {
            return Err(AuthError::SessionExpired(
                "session expired; sign in again".into(),
            ));
        }
        if seen.is_some_and(|seen| seen != self.generation.load(Ordering::SeqCst)) {
            debug!(strategy = self.strategy.kind_name(), "credential already refreshed");
            return Ok(());
        }
        *state = SessionState::Refreshing;

        let mut credential = self.credential.write().await;
        let mut refreshed = credential.clone();
        debug!(account = %refreshed.account_id, "refreshing credential");
        match self.strategy.refresh(&mut refreshed).await {
            Ok(()) => {
                if let Some(store) = &self.store {
                    if let Err(err) = store.save(&refreshed) {
                        warn!(account = %refreshed.account_id, error = %err, "failed to persist refreshed credential");
                    }
                }
                *credential = refreshed;
                self.generation.fetch_add(1, Ordering::SeqCst);
                *state = SessionState::Valid;
                Ok(())
            }
            Err(err) if err.requires_login() => {
                warn!(account = %credential.account_id, error = %err, "session expired");
                *state = SessionState::Expired;
                Err(err)
            }
            Err(err) => {
                *state = SessionState::Valid;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthKind, CookieStrategy, OAuth2Strategy, TokenLocation};
    use crate::http::Method;
    use std::borrow::Cow;
    use url::Url;

    fn shared(credential: Credential) -> SharedCredential {
        Arc::new(RwLock::new(credential))
    }

    fn foursquare_credential() -> Credential {
        Credential::new(
            "fsq",
            "foursquare",
            AuthKind::OAuth2 {
                access_token: "TOKEN123".into(),
                refresh_token: None,
                expires_at: None,
            },
        )
    }

    #[test]
    fn accept_language_quality_values() {
        let locales = vec!["en_US".to_string(), "fr-FR".to_string(), "de".to_string()];
        assert_eq!(
            accept_language(&locales).as_deref(),
            Some("en-US, fr-FR;q=0.9, de;q=0.8")
        );
        assert!(accept_language(&[]).is_none());
    }

    #[test]
    fn user_agent_selection() {
        let mut identity = BrowserIdentity {
            mode: BrowserMode::Desktop,
            custom_user_agent: Some("Custom/1.0".into()),
            ..Default::default()
        };
        assert_eq!(user_agent(&identity), "Custom/1.0");
        identity.custom_user_agent = None;
        assert_eq!(user_agent(&identity), DESKTOP_USER_AGENT);
        identity.custom_user_agent = Some("Custom/1.0".into());
        identity.keep_device_settings = true;
        assert_eq!(user_agent(&identity), DEVICE_USER_AGENT);
    }

    #[tokio::test]
    async fn foursquare_search_carries_token_and_version_once() {
        let provider = crate::providers::find("foursquare").unwrap();
        let interceptor = RequestInterceptor::new(provider.strategy(None), shared(foursquare_credential()))
            .with_headers(ProviderHeaders::for_provider(provider));
        let request = RequestContext::new(
            Method::GET,
            Url::parse("https://api.foursquare.com/v2/venues/search?near=SF&v=19990101").unwrap(),
        );

        let adapted = interceptor.adapt(&request).await.unwrap();
        let url = adapted.final_url();
        let keys: Vec<String> = url.query_pairs().map(|(key, _)| key.into_owned()).collect();
        assert_eq!(keys.iter().filter(|key| *key == "v").count(), 1);
        assert_eq!(keys.iter().filter(|key| *key == "oauth_token").count(), 1);
        assert_eq!(adapted.query_param("v").as_deref(), Some("20231010"));
        assert_eq!(adapted.query_param("oauth_token").as_deref(), Some("TOKEN123"));
        assert_eq!(adapted.query_param("near").as_deref(), Some("SF"));
        assert_eq!(adapted.header("User-Agent"), Some(DEVICE_USER_AGENT));
    }

    #[tokio::test]
    async fn app_id_header_and_fixed_headers() {
        let provider = crate::providers::find("twitch").unwrap();
        let mut credential = Credential::new(
            "tw",
            "twitch",
            AuthKind::OAuth2 {
                access_token: "abc".into(),
                refresh_token: None,
                expires_at: None,
            },
        );
        credential.app_id = Some("client-42".into());
        let interceptor = RequestInterceptor::new(provider.strategy(None), shared(credential))
            .with_headers(ProviderHeaders::for_provider(provider).with_header("X-Trace", "1"));
        let request = RequestContext::new(Method::GET, Url::parse("https://api.twitch.tv/helix/users").unwrap());
        let adapted = interceptor.adapt(&request).await.unwrap();
        assert_eq!(adapted.header("Client-Id"), Some("client-42"));
        assert_eq!(adapted.header("Authorization"), Some("Bearer abc"));
        assert_eq!(adapted.header("X-Trace"), Some("1"));
    }

    #[tokio::test]
    async fn non_401_failures_are_not_retried() {
        let interceptor = RequestInterceptor::new(
            AuthStrategy::OAuth2(OAuth2Strategy {
                location: TokenLocation::Query(Cow::Borrowed("oauth_token")),
                oauth: None,
            }),
            shared(foursquare_credential()),
        );
        let request = RequestContext::new(Method::GET, Url::parse("https://api.foursquare.com/v2/users/self").unwrap());
        let decision = interceptor
            .retry(&request, StatusCode::INTERNAL_SERVER_ERROR, 0)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::DoNotRetry);
        assert_eq!(interceptor.state().await, SessionState::Valid);
    }

    #[tokio::test]
    async fn cookie_session_401_expires_until_replaced() {
        let credential = Credential::new(
            "ig",
            "instagram",
            AuthKind::Cookie {
                session_id: "sess".into(),
                csrf_token: "csrf".into(),
                cookies: vec![],
                cookies_domain: ".instagram.com".into(),
                session_cookie_field: "sessionid".into(),
            },
        );
        let interceptor = RequestInterceptor::new(
            AuthStrategy::Cookie(CookieStrategy { csrf_header: None }),
            shared(credential.clone()),
        );
        let request = RequestContext::new(Method::GET, Url::parse("https://i.instagram.com/api/v1/").unwrap());
        let sent = interceptor.adapt(&request).await.unwrap();
        let err = interceptor.retry(&sent, StatusCode::UNAUTHORIZED, 0).await.unwrap_err();
        assert!(err.requires_login());
        assert_eq!(interceptor.state().await, SessionState::Expired);

        assert!(interceptor.adapt(&request).await.unwrap_err().requires_login());

        interceptor.replace_credential(credential).await;
        assert!(interceptor.adapt(&request).await.is_ok());
    }

    #[tokio::test]
    async fn second_401_surfaces_session_expired() {
        let interceptor = RequestInterceptor::new(
            AuthStrategy::OAuth2(OAuth2Strategy {
                location: TokenLocation::Header,
                oauth: None,
            }),
            shared(foursquare_credential()),
        );
        let request = RequestContext::new(Method::GET, Url::parse("https://api.foursquare.com/v2/users/self").unwrap());
        let err = interceptor
            .retry(&request, StatusCode::UNAUTHORIZED, 1)
            .await
            .unwrap_err();
        assert!(err.requires_login());
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::AccountOptions;
use crate::http::{ApiClient, ApiError, ProviderHeaders, RequestInterceptor, SharedCredential};
use crate::providers::{AuthScheme, ProviderDescriptor};

use super::cookies::{CookieJar, ScopedCookieJar};
use super::oauth1::TemporaryCredentials;
use super::retry::PollPolicy;
use super::web_flow::{
    AuthPayload, CookieSessionRule, WebAuthFlowController, WebAuthRequest, WebView,
};
use super::{
    utils, AuthError, AuthKind, Credential, CredentialStore, OAuth1Client, OAuthClient, PkcePair,
};

/// Per-attempt secrets that must survive between opening the login page and handling
/// its result.
#[derive(Debug, Clone)]
pub enum LoginSecret {
    OAuth2 {
        pkce: Option<PkcePair>,
        state: String,
    },
    OAuth1 {
        temporary: TemporaryCredentials,
    },
    Cookie,
}

/// A prepared interactive login: what to show in the web view plus the attempt's secrets.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub request: WebAuthRequest,
    pub secret: LoginSecret,
}

/// Coordinates login, persistence, cookie synchronization, and refresh for one linked
/// account.
pub struct AccountManager<S> {
    store: Arc<S>,
    provider: &'static ProviderDescriptor,
    account_id: String,
    credential: SharedCredential,
    jar: Option<Arc<dyn CookieJar>>,
    oauth: Option<OAuthClient>,
    oauth1: Option<OAuth1Client>,
    poll: PollPolicy,
    refresh_window: Duration,
    interceptor: OnceLock<Arc<RequestInterceptor>>,
}

impl<S> AccountManager<S>
where
    S: CredentialStore + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        provider: &'static ProviderDescriptor,
        account_id: impl Into<String>,
    ) -> Self {
        let account_id = account_id.into();
        let credential = Credential::new(account_id.clone(), provider.id, empty_auth(provider));
        Self {
            store: Arc::new(store),
            provider,
            account_id,
            credential: Arc::new(RwLock::new(credential)),
            jar: None,
            oauth: None,
            oauth1: None,
            poll: PollPolicy::default(),
            refresh_window: Duration::minutes(5),
            interceptor: OnceLock::new(),
        }
    }

    /// Shared cookie jar of the platform web view. Access is always scoped to the
    /// account's cookies domain.
    pub fn with_cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.jar = Some(jar);
        self
    }

    pub fn with_oauth(mut self, oauth: OAuthClient) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn with_oauth1(mut self, oauth1: OAuth1Client) -> Self {
        self.oauth1 = Some(oauth1);
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn provider(&self) -> &'static ProviderDescriptor {
        self.provider
    }

    pub fn credential(&self) -> SharedCredential {
        Arc::clone(&self.credential)
    }

    pub async fn snapshot(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Interceptor bound to this account's shared credential.
    pub fn interceptor(&self) -> Arc<RequestInterceptor> {
        Arc::clone(self.interceptor.get_or_init(|| {
            let store: Arc<dyn CredentialStore + Send + Sync> = self.store.clone();
            Arc::new(
                RequestInterceptor::new(
                    self.provider.strategy(self.oauth.clone()),
                    Arc::clone(&self.credential),
                )
                .with_headers(ProviderHeaders::for_provider(self.provider))
                .with_store(store),
            )
        }))
    }

    pub fn api_client(&self) -> Result<ApiClient, ApiError> {
        ApiClient::for_provider(self.provider, self.interceptor())
    }

    fn scoped_jar(&self, credential: &Credential) -> Option<ScopedCookieJar> {
        let domain = credential.auth.cookies_domain()?;
        self.jar
            .as_ref()
            .map(|jar| ScopedCookieJar::new(Arc::clone(jar), domain))
    }

    async fn install(&self, credential: Credential) {
        match self.interceptor.get() {
            Some(interceptor) => interceptor.replace_credential(credential).await,
            None => *self.credential.write().await = credential,
        }
    }

    /// Load the stored credential, re-injecting its session cookies into the jar before
    /// anything is sent with it.
    pub async fn load(&self) -> Result<Option<Credential>, AuthError> {
        let Some(credential) = self.store.load(&self.account_id)? else {
            debug!(account = %self.account_id, "no stored credential");
            return Ok(None);
        };

        if let (AuthKind::Cookie { cookies, .. }, Some(jar)) =
            (&credential.auth, self.scoped_jar(&credential))
        {
            let restored = jar.inject(cookies).await;
            debug!(account = %self.account_id, restored, "restored session cookies");
        }
        self.install(credential.clone()).await;
        Ok(Some(credential))
    }

    /// Save the current credential. Cookie sessions first pick up the scoped jar
    /// contents, so cookies rotated by the provider are kept.
    pub async fn persist(&self) -> Result<Credential, AuthError> {
        let mut credential = self.credential.write().await;
        if let Some(jar) = self.scoped_jar(&credential) {
            let current = jar.cookies().await;
            if let AuthKind::Cookie { cookies, .. } = &mut credential.auth {
                if !current.is_empty() {
                    *cookies = current;
                }
            }
        }
        self.store.save(&credential)?;
        Ok(credential.clone())
    }

    /// Prepare the web view request for an interactive login.
    pub async fn begin_login(&self) -> Result<LoginAttempt, AuthError> {
        match &self.provider.scheme {
            AuthScheme::OAuth2 { .. } => {
                let oauth = self.oauth.as_ref().ok_or_else(|| {
                    AuthError::Misconfigured(format!("{} needs an OAuth2 client", self.provider.name))
                })?;
                let pkce = oauth.config().use_pkce.then(PkcePair::generate);
                let state = utils::random_token(32);
                let url = oauth.authorization_url(pkce.as_ref(), &state);
                let request = WebAuthRequest::new(url)
                    .with_redirect(oauth.config().redirect_uri.as_str())
                    .with_expected_state(state.clone());
                Ok(LoginAttempt {
                    request,
                    secret: LoginSecret::OAuth2 { pkce, state },
                })
            }
            AuthScheme::OAuth1 { .. } => {
                let oauth1 = self.oauth1.as_ref().ok_or_else(|| {
                    AuthError::Misconfigured(format!("{} needs an OAuth1 client", self.provider.name))
                })?;
                let temporary = oauth1.request_token().await?;
                let request = WebAuthRequest::new(oauth1.authorization_url(&temporary))
                    .with_redirect(oauth1.callback_url().as_str());
                Ok(LoginAttempt {
                    request,
                    secret: LoginSecret::OAuth1 { temporary },
                })
            }
            AuthScheme::Cookie {
                login_url,
                csrf_cookie,
                success_pages,
                ..
            } => {
                let credential = self.snapshot().await;
                let jar = self.scoped_jar(&credential).ok_or_else(|| {
                    AuthError::Misconfigured(format!("{} needs a cookie jar", self.provider.name))
                })?;
                let session_cookie = match &credential.auth {
                    AuthKind::Cookie {
                        session_cookie_field,
                        ..
                    } => session_cookie_field.clone(),
                    other => return Err(kind_mismatch(self.provider, other)),
                };
                let rule = CookieSessionRule {
                    jar,
                    session_cookie,
                    csrf_cookie: csrf_cookie.map(str::to_owned),
                    success_pages: success_pages.iter().map(|p| p.to_string()).collect(),
                    poll: self.poll,
                };
                let url = url::Url::parse(login_url)?;
                Ok(LoginAttempt {
                    request: WebAuthRequest::new(url).with_cookie_session(rule),
                    secret: LoginSecret::Cookie,
                })
            }
        }
    }

    /// Turn a completed web login into a persisted credential.
    pub async fn complete_login(
        &self,
        attempt: LoginAttempt,
        payload: AuthPayload,
    ) -> Result<Credential, AuthError> {
        let (auth, username) = match (attempt.secret, payload) {
            (LoginSecret::OAuth2 { pkce, .. }, AuthPayload::Parameters(params)) => {
                (self.oauth2_auth(pkce.as_ref(), &params).await?, None)
            }
            (LoginSecret::OAuth1 { temporary }, AuthPayload::Parameters(params)) => {
                self.oauth1_auth(&temporary, &params).await?
            }
            (
                LoginSecret::Cookie,
                AuthPayload::SessionCookies {
                    session_id,
                    csrf_token,
                    cookies,
                },
            ) => {
                let (cookies_domain, session_cookie_field) = match self.snapshot().await.auth {
                    AuthKind::Cookie {
                        cookies_domain,
                        session_cookie_field,
                        ..
                    } => (cookies_domain, session_cookie_field),
                    other => return Err(kind_mismatch(self.provider, &other)),
                };
                let auth = AuthKind::Cookie {
                    session_id,
                    csrf_token: csrf_token.unwrap_or_default(),
                    cookies,
                    cookies_domain,
                    session_cookie_field,
                };
                (auth, None)
            }
            _ => {
                return Err(AuthError::Misconfigured(
                    "login result does not match the provider's scheme".into(),
                ))
            }
        };
        self.link(auth, username).await
    }

    /// Drive `web` through a complete login.
    pub async fn login<W: WebView>(&self, web: W) -> Result<Credential, AuthError> {
        let attempt = self.begin_login().await?;
        let payload = WebAuthFlowController::new(web, attempt.request.clone())
            .run()
            .await?;
        self.complete_login(attempt, payload).await
    }

    /// Store already-obtained auth material for this account (e.g. a personal token).
    pub async fn link(
        &self,
        auth: AuthKind,
        username: Option<String>,
    ) -> Result<Credential, AuthError> {
        if auth.kind_name() != self.provider.kind_name() {
            return Err(kind_mismatch(self.provider, &auth));
        }
        let mut credential = self.snapshot().await;
        credential.auth = auth;
        if username.is_some() {
            credential.username = username;
        }
        self.store.save(&credential)?;
        self.install(credential.clone()).await;
        info!(account = %self.account_id, provider = self.provider.id, "account linked");
        Ok(credential)
    }

    async fn oauth2_auth(
        &self,
        pkce: Option<&PkcePair>,
        params: &BTreeMap<String, String>,
    ) -> Result<AuthKind, AuthError> {
        if let Some(access_token) = params.get("access_token") {
            let expires_at = params
                .get("expires_in")
                .and_then(|value| value.parse::<i64>().ok())
                .map(|seconds| Utc::now() + Duration::seconds(seconds));
            return Ok(AuthKind::OAuth2 {
                access_token: access_token.clone(),
                refresh_token: params.get("refresh_token").cloned(),
                expires_at,
            });
        }

        let code = params.get("code").ok_or_else(|| {
            AuthError::Failed("callback carried neither a code nor an access token".into())
        })?;
        let oauth = self.oauth.as_ref().ok_or_else(|| {
            AuthError::Misconfigured(format!("{} needs an OAuth2 client", self.provider.name))
        })?;
        let grant = oauth.exchange_code(code, pkce).await?;
        Ok(AuthKind::OAuth2 {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
        })
    }

    async fn oauth1_auth(
        &self,
        temporary: &TemporaryCredentials,
        params: &BTreeMap<String, String>,
    ) -> Result<(AuthKind, Option<String>), AuthError> {
        let oauth1 = self.oauth1.as_ref().ok_or_else(|| {
            AuthError::Misconfigured(format!("{} needs an OAuth1 client", self.provider.name))
        })?;
        if let Some(token) = params.get("oauth_token") {
            if token != &temporary.token {
                return Err(AuthError::Failed("callback token does not match the request token".into()));
            }
        }
        let verifier = params
            .get("oauth_verifier")
            .ok_or_else(|| AuthError::Failed("callback is missing oauth_verifier".into()))?;

        let tokens = oauth1.access_token(temporary, verifier).await?;
        let username = tokens
            .extra
            .get("screen_name")
            .or_else(|| tokens.extra.get("username"))
            .cloned();
        let auth = AuthKind::OAuth1 {
            consumer_key: oauth1.consumer_key().to_owned(),
            consumer_secret: oauth1.consumer_secret().to_owned(),
            token: tokens.token,
            token_secret: tokens.token_secret,
        };
        Ok((auth, username))
    }

    /// Refresh an OAuth2 token that expires within the refresh window.
    pub async fn ensure_fresh(&self) -> Result<Credential, AuthError> {
        let credential = self.snapshot().await;
        if credential.will_expire_within(self.refresh_window) {
            let interceptor = self.interceptor();
            if interceptor.strategy().supports_refresh() {
                debug!(account = %self.account_id, "access token near expiry");
                interceptor.refresh().await?;
                return Ok(self.snapshot().await);
            }
        }
        Ok(credential)
    }

    /// Apply an options bundle and persist the result.
    pub async fn configure(&self, options: &AccountOptions) -> Result<Credential, AuthError> {
        let mut credential = self.credential.write().await;
        options.apply(&mut credential);
        self.store.save(&credential)?;
        Ok(credential.clone())
    }

    /// Forget the account: delete the stored record and the provider's cookies.
    pub async fn unlink(&self) -> Result<(), AuthError> {
        let credential = self.snapshot().await;
        self.store.clear(&self.account_id)?;
        if let Some(jar) = self.scoped_jar(&credential) {
            jar.clear().await;
        }
        let mut empty = Credential::new(self.account_id.clone(), self.provider.id, empty_auth(self.provider));
        empty.browser = credential.browser;
        if let AuthKind::Cookie { cookies_domain, session_cookie_field, .. } = credential.auth {
            empty.auth = AuthKind::empty_cookie(cookies_domain, session_cookie_field);
        }
        self.install(empty).await;
        info!(account = %self.account_id, "account unlinked");
        Ok(())
    }
}

fn empty_auth(provider: &ProviderDescriptor) -> AuthKind {
    match &provider.scheme {
        AuthScheme::OAuth1 { .. } => AuthKind::empty_oauth1("", ""),
        AuthScheme::OAuth2 { .. } => AuthKind::empty_oauth2(),
        AuthScheme::Cookie {
            cookies_domain,
            session_cookie,
            ..
        } => AuthKind::empty_cookie(*cookies_domain, *session_cookie),
    }
}

fn kind_mismatch(provider: &ProviderDescriptor, auth: &AuthKind) -> AuthError {
    AuthError::Misconfigured(format!(
        "{} uses {} credentials, got {}",
        provider.name,
        provider.kind_name(),
        auth.kind_name()
    ))
}

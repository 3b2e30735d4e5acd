//! Drives an embedded web view through a provider login until it yields an
//! authorization payload, fails, or is canceled.
//!
//! The controller consumes itself in [`WebAuthFlowController::run`], so every attempt
//! resolves exactly once. Cancellation goes through a [`CancelHandle`] and stops any
//! pending polling.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::cookies::ScopedCookieJar;
use super::retry::PollPolicy;
use super::{AuthError, Cookie};

/// Navigation notifications reported by the web view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    /// The view is about to load `url`, redirects included.
    Requested(Url),
    Finished {
        url: Url,
        content_type: Option<String>,
    },
    Failed {
        url: Option<Url>,
        reason: String,
    },
}

/// Platform web view capability. Implementations are driven from a single task.
#[async_trait]
pub trait WebView: Send {
    async fn load(&mut self, url: &Url) -> Result<(), AuthError>;
    /// `None` once the user has dismissed the view.
    async fn next_event(&mut self) -> Option<NavigationEvent>;
    /// Text of the rendered document, if it can be read yet.
    async fn document_text(&mut self) -> Option<String>;
}

/// Completion rule for providers that sign in with session cookies instead of a redirect.
#[derive(Debug, Clone)]
pub struct CookieSessionRule {
    pub jar: ScopedCookieJar,
    pub session_cookie: String,
    pub csrf_cookie: Option<String>,
    pub success_pages: Vec<String>,
    pub poll: PollPolicy,
}

/// Inputs of one login attempt.
#[derive(Debug, Clone)]
pub struct WebAuthRequest {
    pub auth_url: Url,
    /// Prefix of the callback URL. `None` means completion is detected from cookies.
    pub redirect_url: Option<String>,
    pub expected_state: Option<String>,
    pub cookie_session: Option<CookieSessionRule>,
}

impl WebAuthRequest {
    pub fn new(auth_url: Url) -> Self {
        Self {
            auth_url,
            redirect_url: None,
            expected_state: None,
            cookie_session: None,
        }
    }

    pub fn with_redirect(mut self, prefix: impl Into<String>) -> Self {
        self.redirect_url = Some(prefix.into());
        self
    }

    pub fn with_expected_state(mut self, state: impl Into<String>) -> Self {
        self.expected_state = Some(state.into());
        self
    }

    pub fn with_cookie_session(mut self, rule: CookieSessionRule) -> Self {
        self.cookie_session = Some(rule);
        self
    }
}

/// What a completed login produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPayload {
    /// Merged query and fragment parameters of the callback URL.
    Parameters(BTreeMap<String, String>),
    SessionCookies {
        session_id: String,
        csrf_token: Option<String>,
        cookies: Vec<Cookie>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebAuthState {
    Idle,
    Loading,
    AwaitingRedirect,
    Verifying,
    Completed(AuthPayload),
    Failed(String),
    Canceled,
}

impl WebAuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WebAuthState::Completed(_) | WebAuthState::Failed(_) | WebAuthState::Canceled
        )
    }
}

/// Query and fragment pairs of `url` in one map; fragment values win.
pub fn parse_callback_parameters(url: &Url) -> BTreeMap<String, String> {
    let mut params: BTreeMap<String, String> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if let Some(fragment) = url.fragment() {
        // Percent-decoding only; a literal `+` stays a `+`.
        params.extend(
            fragment
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                .map(|(key, value)| (percent_decode(key), percent_decode(value))),
        );
    }
    params
}

/// `page` matches `url` exactly, ignoring query and fragment; a trailing `*` matches by prefix.
pub fn matches_success_page(url: &Url, page: &str) -> bool {
    if let Some(prefix) = page.strip_suffix('*') {
        return url.as_str().starts_with(prefix);
    }
    let mut bare = url.clone();
    bare.set_query(None);
    bare.set_fragment(None);
    bare.as_str() == page
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_owned())
}

/// Outcome for a navigated URL, or `None` when it is not the callback.
pub fn evaluate_redirect(
    url: &Url,
    redirect_prefix: &str,
    expected_state: Option<&str>,
) -> Option<Result<AuthPayload, AuthError>> {
    if !url.as_str().starts_with(redirect_prefix) {
        return None;
    }
    let params = parse_callback_parameters(url);
    if let Some(error) = params.get("error") {
        let reason = params
            .get("error_description")
            .filter(|description| !description.is_empty())
            .unwrap_or(error);
        return Some(Err(AuthError::Failed(reason.clone())));
    }
    if let Some(expected) = expected_state {
        if params.get("state").map(String::as_str) != Some(expected) {
            return Some(Err(AuthError::Failed(
                "authorization state mismatch".into(),
            )));
        }
    }
    Some(Ok(AuthPayload::Parameters(params)))
}

/// Error message carried by a JSON page rendered during login, if any.
pub fn extract_flow_error(json: &Value) -> Option<String> {
    let text = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .filter(|message| !message.trim().is_empty())
            .map(str::to_owned)
    };

    text(json.pointer("/meta/error_message"))
        .or_else(|| text(json.get("error_message")))
        .or_else(|| match json.get("error") {
            Some(Value::Object(error)) => text(error.get("message")),
            other => text(other),
        })
        .or_else(|| {
            (json.get("status").and_then(Value::as_str) == Some("failure"))
                .then(|| text(json.get("message")))
                .flatten()
        })
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Cancels a running flow from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

pub struct WebAuthFlowController<W: WebView> {
    web: W,
    request: WebAuthRequest,
    json_poll: PollPolicy,
    state: watch::Sender<WebAuthState>,
    cancel: Arc<watch::Sender<bool>>,
}

impl<W: WebView> WebAuthFlowController<W> {
    pub fn new(web: W, request: WebAuthRequest) -> Self {
        let (state, _) = watch::channel(WebAuthState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            web,
            request,
            json_poll: PollPolicy::default(),
            state,
            cancel: Arc::new(cancel),
        }
    }

    /// Bound on re-reading a JSON document that is not parseable yet.
    pub fn with_json_poll(mut self, policy: PollPolicy) -> Self {
        self.json_poll = policy;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: Arc::clone(&self.cancel),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WebAuthState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WebAuthState {
        self.state.borrow().clone()
    }

    /// Run the flow to its single terminal outcome.
    pub async fn run(mut self) -> Result<AuthPayload, AuthError> {
        let mut canceled = self.cancel.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = wait_for_cancel(&mut canceled) => Err(AuthError::Canceled),
            result = self.drive() => result,
        };

        let terminal = match &outcome {
            Ok(payload) => WebAuthState::Completed(payload.clone()),
            Err(AuthError::Canceled) => WebAuthState::Canceled,
            Err(err) => WebAuthState::Failed(err.to_string()),
        };
        match &outcome {
            Ok(_) => info!("web login completed"),
            Err(AuthError::Canceled) => info!("web login canceled"),
            Err(err) => warn!(error = %err, "web login failed"),
        }
        self.state.send_replace(terminal);
        outcome
    }

    fn set_state(&self, state: WebAuthState) {
        debug!(state = ?state, "web login state");
        self.state.send_replace(state);
    }

    async fn drive(&mut self) -> Result<AuthPayload, AuthError> {
        self.set_state(WebAuthState::Loading);
        self.web.load(&self.request.auth_url).await?;
        self.set_state(WebAuthState::AwaitingRedirect);

        loop {
            let Some(event) = self.web.next_event().await else {
                return Err(AuthError::Canceled);
            };
            match event {
                NavigationEvent::Requested(url) => {
                    if let Some(outcome) = self.check_redirect(&url) {
                        return outcome;
                    }
                }
                NavigationEvent::Finished { url, content_type } => {
                    if let Some(outcome) = self.check_redirect(&url) {
                        return outcome;
                    }
                    if is_json(content_type.as_deref()) {
                        if let Some(message) = self.json_error().await? {
                            return Err(AuthError::Failed(message));
                        }
                    }
                    if let Some(rule) = self.success_rule(&url).cloned() {
                        self.set_state(WebAuthState::Verifying);
                        return verify_session_cookies(&rule).await;
                    }
                }
                NavigationEvent::Failed { url, reason } => {
                    // Custom-scheme callbacks often fail to load; they still carry the result.
                    if let Some(outcome) = url.as_ref().and_then(|url| self.check_redirect(url)) {
                        return outcome;
                    }
                    return Err(AuthError::Connection(reason));
                }
            }
        }
    }

    fn check_redirect(&self, url: &Url) -> Option<Result<AuthPayload, AuthError>> {
        let prefix = self.request.redirect_url.as_deref()?;
        evaluate_redirect(url, prefix, self.request.expected_state.as_deref())
    }

    /// The cookie rule to verify when `url` looks like a signed-in page.
    fn success_rule(&self, url: &Url) -> Option<&CookieSessionRule> {
        let rule = self.request.cookie_session.as_ref()?;
        if url.as_str().starts_with(self.request.auth_url.as_str()) {
            return None;
        }
        let signed_in = if rule.success_pages.is_empty() {
            url.host_str().is_some_and(|host| rule.jar.covers_host(host))
        } else {
            rule.success_pages
                .iter()
                .any(|page| matches_success_page(url, page))
        };
        signed_in.then_some(rule)
    }

    /// Read the rendered JSON document, retrying while it is not parseable yet.
    async fn json_error(&mut self) -> Result<Option<String>, AuthError> {
        let policy = self.json_poll;
        for attempt in policy.attempts() {
            policy.pause_before(attempt).await;
            let Some(text) = self.web.document_text().await else {
                continue;
            };
            if let Ok(json) = serde_json::from_str::<Value>(text.trim()) {
                return Ok(extract_flow_error(&json));
            }
        }
        Err(AuthError::Unknown)
    }
}

/// Poll the scoped jar until the session (and CSRF) cookies show up.
async fn verify_session_cookies(rule: &CookieSessionRule) -> Result<AuthPayload, AuthError> {
    let found = rule
        .poll
        .run(|attempt| {
            let jar = rule.jar.clone();
            async move {
                let cookies = jar.cookies().await;
                let value_of = |name: &str| {
                    cookies
                        .iter()
                        .find(|cookie| cookie.name == name && !cookie.value.is_empty())
                        .map(|cookie| cookie.value.clone())
                };
                let session_id = value_of(rule.session_cookie.as_str());
                let csrf_token = match &rule.csrf_cookie {
                    Some(name) => value_of(name.as_str()).map(Some),
                    None => Some(None),
                };
                debug!(attempt, found = session_id.is_some(), "checking session cookies");
                match (session_id, csrf_token) {
                    (Some(session_id), Some(csrf_token)) => Some(AuthPayload::SessionCookies {
                        session_id,
                        csrf_token,
                        cookies,
                    }),
                    _ => None,
                }
            }
        })
        .await;

    found.ok_or_else(|| {
        AuthError::SessionExpired(format!(
            "session cookies for {} not found after login",
            rule.jar.domain()
        ))
    })
}

async fn wait_for_cancel(receiver: &mut watch::Receiver<bool>) {
    let canceled = receiver.wait_for(|canceled| *canceled).await.is_ok();
    if !canceled {
        std::future::pending::<()>().await;
    }
}

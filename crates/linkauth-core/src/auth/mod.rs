mod cookies;
mod credential;
mod credential_store;
mod error;
mod oauth;
mod oauth1;
mod orchestrator;
mod pkce;
mod retry;
mod strategy;
pub(crate) mod utils;
mod web_flow;

pub use cookies::{CookieJar, CookieJarError, MemoryCookieJar, ScopedCookieJar};
pub use credential::{AuthKind, BrowserIdentity, BrowserMode, Cookie, Credential, InvalidBrowserMode};
pub use credential_store::{CredentialStore, FileCredentialStore};
pub use error::{AuthError, StorageError};
pub use oauth::{OAuthClient, OAuthConfig, OAuthEndpoints, TokenGrant};
pub use oauth1::{
    authorization_header, normalized_parameters, normalized_url, percent_encode,
    signature_base_string, AccessTokenResponse, OAuth1Client, OAuth1Endpoints, OAuth1Placement,
    OAuth1Signer, SignatureMethod, TemporaryCredentials,
};
pub use orchestrator::{AccountManager, LoginAttempt, LoginSecret};
pub use pkce::PkcePair;
pub use retry::PollPolicy;
pub use strategy::{
    AuthStrategy, Authorizer, CookieStrategy, OAuth1Strategy, OAuth2Strategy, TokenLocation,
};
pub use web_flow::{
    evaluate_redirect, extract_flow_error, parse_callback_parameters, AuthPayload, CancelHandle,
    CookieSessionRule, NavigationEvent, WebAuthFlowController, WebAuthRequest, WebAuthState,
    WebView,
};

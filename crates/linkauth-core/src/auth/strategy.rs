//! Per-kind authorization of outgoing requests.
//!
//! [`AuthStrategy`] is a closed set of variants, one per [`AuthKind`]. `attach` is a pure
//! transform of a [`RequestContext`]; only `refresh` mutates the credential.

use std::borrow::Cow;
use std::future::Future;

use tracing::{debug, info};

use crate::http::RequestContext;

use super::oauth1::{authorization_header, OAuth1Placement, OAuth1Signer, SignatureMethod};
use super::{AuthError, AuthKind, Credential, OAuthClient};

/// Capability shared by every strategy variant.
pub trait Authorizer {
    fn is_authorized(&self, credential: &Credential) -> bool;

    fn attach(
        &self,
        credential: &Credential,
        request: &RequestContext,
    ) -> Result<RequestContext, AuthError>;

    fn refresh(
        &self,
        credential: &mut Credential,
    ) -> impl Future<Output = Result<(), AuthError>> + Send;
}

#[derive(Debug, Clone)]
pub struct OAuth1Strategy {
    pub placement: OAuth1Placement,
    pub method: SignatureMethod,
}

impl Authorizer for OAuth1Strategy {
    fn is_authorized(&self, credential: &Credential) -> bool {
        matches!(credential.auth, AuthKind::OAuth1 { .. }) && credential.is_authorized()
    }

    fn attach(
        &self,
        credential: &Credential,
        request: &RequestContext,
    ) -> Result<RequestContext, AuthError> {
        let AuthKind::OAuth1 {
            consumer_key,
            consumer_secret,
            token,
            token_secret,
        } = &credential.auth
        else {
            return Err(mismatch("oauth1", &credential.auth));
        };
        if !credential.is_authorized() {
            return Err(not_linked(credential));
        }

        let mut signed = request.clone();
        let stale: Vec<String> = signed
            .url
            .query_pairs()
            .filter(|(key, _)| key.starts_with("oauth_"))
            .map(|(key, _)| key.into_owned())
            .collect();
        for key in stale {
            signed.remove_query_param(&key);
        }

        let signer = OAuth1Signer::new(consumer_key, consumer_secret)
            .with_token(token, token_secret)
            .with_method(self.method);
        let oauth = signer.sign(
            &signed.method,
            &signed.final_url(),
            body_params(&signed),
            &[],
            &signed.nonce,
            signed.timestamp,
        );

        match self.placement {
            OAuth1Placement::Header => {
                signed.set_header("Authorization", authorization_header(&oauth));
            }
            OAuth1Placement::Query => {
                for (key, value) in &oauth {
                    signed.set_query_param(key, value);
                }
            }
        }
        Ok(signed)
    }

    async fn refresh(&self, credential: &mut Credential) -> Result<(), AuthError> {
        Err(AuthError::SessionExpired(format!(
            "OAuth1 tokens for '{}' cannot be refreshed; sign in again",
            credential.account_id
        )))
    }
}

/// Form-encoded body parameters are signed; query parameters are already part of the
/// final URL handed to the signer.
fn body_params(request: &RequestContext) -> &[(String, String)] {
    match request.encoding {
        crate::http::ParameterEncoding::FormBody => request.signable_params(),
        _ => &[],
    }
}

/// Where an OAuth2 access token is presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLocation {
    Header,
    Query(Cow<'static, str>),
}

#[derive(Debug, Clone)]
pub struct OAuth2Strategy {
    pub location: TokenLocation,
    pub oauth: Option<OAuthClient>,
}

impl Authorizer for OAuth2Strategy {
    fn is_authorized(&self, credential: &Credential) -> bool {
        matches!(credential.auth, AuthKind::OAuth2 { .. }) && credential.is_authorized()
    }

    fn attach(
        &self,
        credential: &Credential,
        request: &RequestContext,
    ) -> Result<RequestContext, AuthError> {
        let AuthKind::OAuth2 { access_token, .. } = &credential.auth else {
            return Err(mismatch("oauth2", &credential.auth));
        };
        if access_token.is_empty() {
            return Err(not_linked(credential));
        }

        let mut authorized = request.clone();
        match &self.location {
            TokenLocation::Header => {
                authorized.set_header("Authorization", format!("Bearer {access_token}"));
            }
            TokenLocation::Query(param) => authorized.set_query_param(param, access_token),
        }
        Ok(authorized)
    }

    async fn refresh(&self, credential: &mut Credential) -> Result<(), AuthError> {
        let AuthKind::OAuth2 { refresh_token, .. } = &credential.auth else {
            return Err(mismatch("oauth2", &credential.auth));
        };
        let Some(refresh_token) = refresh_token.clone() else {
            return Err(AuthError::SessionExpired(
                "access token expired and no refresh token is stored".into(),
            ));
        };
        let Some(oauth) = &self.oauth else {
            return Err(AuthError::SessionExpired(
                "access token expired and no OAuth client is configured for refresh".into(),
            ));
        };

        debug!(account = %credential.account_id, "refreshing OAuth2 access token");
        let grant = oauth.refresh(&refresh_token).await.map_err(|err| match err {
            AuthError::Connection(reason) => AuthError::Connection(reason),
            other => AuthError::SessionExpired(format!("token refresh failed: {other}")),
        })?;

        credential.auth = AuthKind::OAuth2 {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
        };
        info!(account = %credential.account_id, "OAuth2 access token refreshed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CookieStrategy {
    pub csrf_header: Option<Cow<'static, str>>,
}

impl Authorizer for CookieStrategy {
    fn is_authorized(&self, credential: &Credential) -> bool {
        matches!(credential.auth, AuthKind::Cookie { .. }) && credential.is_authorized()
    }

    fn attach(
        &self,
        credential: &Credential,
        request: &RequestContext,
    ) -> Result<RequestContext, AuthError> {
        let AuthKind::Cookie {
            session_id,
            csrf_token,
            cookies,
            cookies_domain,
            session_cookie_field,
        } = &credential.auth
        else {
            return Err(mismatch("cookie", &credential.auth));
        };
        if session_id.is_empty() {
            return Err(not_linked(credential));
        }

        let mut pairs: Vec<String> = cookies
            .iter()
            .filter(|cookie| cookie.matches_domain(cookies_domain) && !cookie.is_expired())
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect();
        let has_session = cookies
            .iter()
            .any(|cookie| &cookie.name == session_cookie_field && !cookie.is_expired());
        if !has_session && !session_cookie_field.is_empty() {
            pairs.push(format!("{session_cookie_field}={session_id}"));
        }

        let mut authorized = request.clone();
        authorized.set_header("Cookie", pairs.join("; "));
        if let Some(header) = &self.csrf_header {
            if !csrf_token.is_empty() {
                authorized.set_header(header.as_ref(), csrf_token.as_str());
            }
        }
        Ok(authorized)
    }

    async fn refresh(&self, credential: &mut Credential) -> Result<(), AuthError> {
        Err(AuthError::SessionExpired(format!(
            "cookie session for '{}' expired; sign in again",
            credential.account_id
        )))
    }
}

/// The closed set of authorization strategies.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    OAuth1(OAuth1Strategy),
    OAuth2(OAuth2Strategy),
    Cookie(CookieStrategy),
}

impl AuthStrategy {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthStrategy::OAuth1(_) => "oauth1",
            AuthStrategy::OAuth2(_) => "oauth2",
            AuthStrategy::Cookie(_) => "cookie",
        }
    }

    /// Only OAuth2 can recover from an authorization failure without a new login.
    pub fn supports_refresh(&self) -> bool {
        matches!(self, AuthStrategy::OAuth2(strategy) if strategy.oauth.is_some())
    }
}

impl Authorizer for AuthStrategy {
    fn is_authorized(&self, credential: &Credential) -> bool {
        match self {
            AuthStrategy::OAuth1(strategy) => strategy.is_authorized(credential),
            AuthStrategy::OAuth2(strategy) => strategy.is_authorized(credential),
            AuthStrategy::Cookie(strategy) => strategy.is_authorized(credential),
        }
    }

    fn attach(
        &self,
        credential: &Credential,
        request: &RequestContext,
    ) -> Result<RequestContext, AuthError> {
        match self {
            AuthStrategy::OAuth1(strategy) => strategy.attach(credential, request),
            AuthStrategy::OAuth2(strategy) => strategy.attach(credential, request),
            AuthStrategy::Cookie(strategy) => strategy.attach(credential, request),
        }
    }

    async fn refresh(&self, credential: &mut Credential) -> Result<(), AuthError> {
        match self {
            AuthStrategy::OAuth1(strategy) => strategy.refresh(credential).await,
            AuthStrategy::OAuth2(strategy) => strategy.refresh(credential).await,
            AuthStrategy::Cookie(strategy) => strategy.refresh(credential).await,
        }
    }
}

fn mismatch(expected: &str, actual: &AuthKind) -> AuthError {
    AuthError::Misconfigured(format!(
        "{expected} strategy cannot use a {} credential",
        actual.kind_name()
    ))
}

fn not_linked(credential: &Credential) -> AuthError {
    AuthError::SessionExpired(format!(
        "account '{}' is not authorized",
        credential.account_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Cookie, OAuthConfig, OAuthEndpoints};
    use crate::http::Method;
    use httpmock::prelude::*;
    use url::Url;

    fn get(url: &str) -> RequestContext {
        RequestContext::new(Method::GET, Url::parse(url).unwrap())
    }

    fn oauth1_credential() -> Credential {
        Credential::new(
            "tw",
            "twitter",
            AuthKind::OAuth1 {
                consumer_key: "ck".into(),
                consumer_secret: "cs".into(),
                token: "tk".into(),
                token_secret: "ts".into(),
            },
        )
    }

    fn oauth2_credential(refresh: Option<&str>) -> Credential {
        Credential::new(
            "fsq",
            "foursquare",
            AuthKind::OAuth2 {
                access_token: "TOKEN123".into(),
                refresh_token: refresh.map(Into::into),
                expires_at: None,
            },
        )
    }

    #[test]
    fn oauth1_header_attach_is_idempotent() {
        let strategy = AuthStrategy::OAuth1(OAuth1Strategy {
            placement: OAuth1Placement::Header,
            method: SignatureMethod::HmacSha1,
        });
        let credential = oauth1_credential();
        let request = get("https://api.twitter.com/1.1/account/verify_credentials.json?skip_status=1");

        let first = strategy.attach(&credential, &request).unwrap();
        let second = strategy.attach(&credential, &request).unwrap();
        assert_eq!(first, second);
        let header = first.header("Authorization").unwrap();
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_signature=\""));
        assert!(header.contains("oauth_token=\"tk\""));
        assert_eq!(first.url, request.url);
    }

    #[test]
    fn oauth1_query_attach_does_not_accumulate() {
        let strategy = AuthStrategy::OAuth1(OAuth1Strategy {
            placement: OAuth1Placement::Query,
            method: SignatureMethod::HmacSha1,
        });
        let credential = oauth1_credential();
        let request = get("https://api.flickr.com/services/rest?method=flickr.test.login");

        let once = strategy.attach(&credential, &request).unwrap();
        let twice = strategy.attach(&credential, &once).unwrap();
        assert_eq!(once.final_url(), twice.final_url());
        let signatures = twice
            .final_url()
            .query_pairs()
            .filter(|(key, _)| key == "oauth_signature")
            .count();
        assert_eq!(signatures, 1);
    }

    #[test]
    fn oauth2_query_token_alongside_existing_params() {
        let strategy = AuthStrategy::OAuth2(OAuth2Strategy {
            location: TokenLocation::Query(Cow::Borrowed("oauth_token")),
            oauth: None,
        });
        let request = get("https://api.foursquare.com/v2/venues/search?near=SF&oauth_token=stale");
        let attached = strategy
            .attach(&oauth2_credential(None), &request)
            .unwrap();
        let url = attached.final_url();
        let tokens: Vec<_> = url
            .query_pairs()
            .filter(|(key, _)| key == "oauth_token")
            .map(|(_, value)| value.into_owned())
            .collect();
        assert_eq!(tokens, vec!["TOKEN123"]);
        assert_eq!(attached.query_param("near").as_deref(), Some("SF"));
        assert!(attached.header("Authorization").is_none());
    }

    #[test]
    fn oauth2_header_bearer() {
        let strategy = AuthStrategy::OAuth2(OAuth2Strategy {
            location: TokenLocation::Header,
            oauth: None,
        });
        let attached = strategy
            .attach(&oauth2_credential(None), &get("https://api.github.com/user"))
            .unwrap();
        assert_eq!(attached.header("authorization"), Some("Bearer TOKEN123"));
    }

    #[test]
    fn cookie_attach_sets_cookie_and_csrf_headers() {
        let strategy = AuthStrategy::Cookie(CookieStrategy {
            csrf_header: Some(Cow::Borrowed("X-CSRFToken")),
        });
        let credential = Credential::new(
            "ig",
            "instagram",
            AuthKind::Cookie {
                session_id: "sess".into(),
                csrf_token: "csrf".into(),
                cookies: vec![
                    Cookie::new("csrftoken", "csrf", ".instagram.com"),
                    Cookie::new("foreign", "x", ".example.com"),
                ],
                cookies_domain: ".instagram.com".into(),
                session_cookie_field: "sessionid".into(),
            },
        );
        let attached = strategy
            .attach(&credential, &get("https://i.instagram.com/api/v1/accounts/current_user/"))
            .unwrap();
        assert_eq!(attached.header("Cookie"), Some("csrftoken=csrf; sessionid=sess"));
        assert_eq!(attached.header("X-CSRFToken"), Some("csrf"));
    }

    #[test]
    fn mismatched_or_unlinked_credentials_fail() {
        let strategy = AuthStrategy::OAuth2(OAuth2Strategy {
            location: TokenLocation::Header,
            oauth: None,
        });
        let err = strategy
            .attach(&oauth1_credential(), &get("https://api.github.com/user"))
            .unwrap_err();
        assert!(matches!(err, AuthError::Misconfigured(_)));

        let empty = Credential::new("gh", "github", AuthKind::empty_oauth2());
        assert!(!strategy.is_authorized(&empty));
        let err = strategy
            .attach(&empty, &get("https://api.github.com/user"))
            .unwrap_err();
        assert!(err.requires_login());
    }

    #[tokio::test]
    async fn non_oauth2_refresh_requires_login() {
        let cookie = AuthStrategy::Cookie(CookieStrategy { csrf_header: None });
        let mut credential = Credential::new("ig", "instagram", AuthKind::empty_cookie(".instagram.com", "sessionid"));
        assert!(cookie.refresh(&mut credential).await.unwrap_err().requires_login());

        let oauth1 = AuthStrategy::OAuth1(OAuth1Strategy {
            placement: OAuth1Placement::Header,
            method: SignatureMethod::HmacSha1,
        });
        let mut credential = oauth1_credential();
        assert!(oauth1.refresh(&mut credential).await.unwrap_err().requires_login());
    }

    #[tokio::test]
    async fn oauth2_refresh_updates_credential() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("refresh_token=R1");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "NEW",
                "refresh_token": "R2",
                "token_type": "bearer",
                "expires_in": 3600
            }));
        });
        let oauth = OAuthClient::new(
            OAuthConfig::new("client", Url::parse("linkauth://cb").unwrap()),
            OAuthEndpoints {
                authorization_url: Url::parse("https://provider.example/auth").unwrap(),
                token_url: Url::parse(&server.url("/token")).unwrap(),
            },
        )
        .unwrap();
        let strategy = AuthStrategy::OAuth2(OAuth2Strategy {
            location: TokenLocation::Header,
            oauth: Some(oauth),
        });
        let mut credential = oauth2_credential(Some("R1"));
        strategy.refresh(&mut credential).await.unwrap();
        mock.assert();
        match credential.auth {
            AuthKind::OAuth2 {
                access_token,
                refresh_token,
                expires_at,
            } => {
                assert_eq!(access_token, "NEW");
                assert_eq!(refresh_token.as_deref(), Some("R2"));
                assert!(expires_at.is_some());
            }
            other => panic!("unexpected auth kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oauth2_refresh_without_refresh_token_expires_session() {
        let strategy = AuthStrategy::OAuth2(OAuth2Strategy {
            location: TokenLocation::Header,
            oauth: None,
        });
        let mut credential = oauth2_credential(None);
        let err = strategy.refresh(&mut credential).await.unwrap_err();
        assert!(err.requires_login());
    }
}

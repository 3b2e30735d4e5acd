use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{AuthError, PkcePair};

const DEFAULT_USER_AGENT: &str = concat!("linkauth/", env!("CARGO_PKG_VERSION"));

/// OAuth2 client registration supplied by the application.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub use_pkce: bool,
}

impl OAuthConfig {
    pub fn new<S: Into<String>>(client_id: S, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri,
            scopes: vec![],
            use_pkce: true,
        }
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_pkce(mut self) -> Self {
        self.use_pkce = false;
        self
    }
}

/// Provider endpoints for the authorization-code flow.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
}

/// Tokens issued by a token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Vec<String>,
}

/// Performs OAuth2 authorization-code exchanges and refreshes against one provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OAuthConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig, endpoints: OAuthEndpoints) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(DEFAULT_USER_AGENT).build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub fn authorization_url(&self, pkce: Option<&PkcePair>, state: &str) -> Url {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            if !self.config.scopes.is_empty() {
                pairs.append_pair("scope", &self.config.scopes.join(" "));
            }
            if let Some(pkce) = pkce {
                pairs.append_pair("code_challenge", pkce.challenge());
                pairs.append_pair("code_challenge_method", pkce.method());
            }
            pairs.append_pair("state", state);
        }
        url
    }

    /// Exchange an authorization code for access/refresh tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce: Option<&PkcePair>,
    ) -> Result<TokenGrant, AuthError> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_owned()),
            (
                "redirect_uri".to_string(),
                self.config.redirect_uri.to_string(),
            ),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];

        if let Some(pkce) = pkce {
            form.push(("code_verifier".to_string(), pkce.verifier().to_owned()));
        }

        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret".to_string(), secret.clone()));
        }

        self.token_request(form, None).await
    }

    /// Obtain a new access token with a refresh token. Providers that do not rotate the
    /// refresh token keep the one that was sent.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_owned()),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];

        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret".to_string(), secret.clone()));
        }

        let mut grant = self
            .token_request(form, Some(StdDuration::from_secs(30)))
            .await?;
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_owned());
        }
        Ok(grant)
    }

    async fn token_request(
        &self,
        form: Vec<(String, String)>,
        timeout: Option<StdDuration>,
    ) -> Result<TokenGrant, AuthError> {
        debug!(endpoint = %self.endpoints.token_url, "requesting OAuth2 token");
        let mut request = self
            .http
            .post(self.endpoints.token_url.clone())
            .header("Accept", "application/json")
            .form(&form);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        let status = response.status();
        let received_at = Utc::now();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::Failed(format!("malformed token response: {err}")))?;
        payload.into_grant(received_at)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn into_grant(self, received_at: DateTime<Utc>) -> Result<TokenGrant, AuthError> {
        // Some providers report failures with a 200 status and an `error` field.
        if let Some(error) = self.error {
            return Err(AuthError::Failed(self.error_description.unwrap_or(error)));
        }

        if let Some(token_type) = &self.token_type {
            if !token_type.eq_ignore_ascii_case("bearer") {
                return Err(AuthError::Failed(format!(
                    "unsupported token type '{token_type}'"
                )));
            }
        }

        let access_token = self
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::Failed("token response missing access_token".into()))?;

        let expires_at = self
            .expires_in
            .map(|seconds| received_at + Duration::seconds(seconds));

        let scope = self
            .scope
            .unwrap_or_default()
            .split(|c: char| c == ' ' || c == ',')
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        Ok(TokenGrant {
            access_token,
            refresh_token: self.refresh_token,
            expires_at,
            scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::StatusCode;

    fn client(server: &MockServer) -> OAuthClient {
        let config = OAuthConfig::new(
            "client-id",
            Url::parse("linkauth://oauth/callback").unwrap(),
        )
        .with_scopes(["read", "history"]);
        let endpoints = OAuthEndpoints {
            authorization_url: Url::parse("https://provider.example/authorize").unwrap(),
            token_url: Url::parse(&server.url("/oauth/token")).unwrap(),
        };
        OAuthClient::new(config, endpoints).unwrap()
    }

    #[tokio::test]
    async fn authorization_url_carries_state_and_pkce() {
        let server = MockServer::start();
        let pkce = PkcePair::generate();
        let url = client(&server).authorization_url(Some(&pkce), "xyz");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        assert!(pairs.contains(&("state".into(), "xyz".into())));
        assert!(pairs.contains(&("scope".into(), "read history".into())));
        assert!(pairs.contains(&("code_challenge".into(), pkce.challenge().into())));
        assert!(pairs.contains(&("redirect_uri".into(), "linkauth://oauth/callback".into())));
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains("grant_type=authorization_code")
                .body_contains("code_verifier=");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "refresh_token": "refresh456",
                "token_type": "bearer",
                "expires_in": 3600,
                "scope": "read history"
            }));
        });

        let pkce = PkcePair::generate();
        let grant = client(&server)
            .exchange_code("code123", Some(&pkce))
            .await
            .unwrap();
        mock.assert();
        assert_eq!(grant.access_token, "abc123");
        assert_eq!(grant.refresh_token.as_deref(), Some("refresh456"));
        assert_eq!(grant.scope, vec!["read", "history"]);
        assert!(grant.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_keeps_existing_refresh_token_when_not_rotated() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=refresh456");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "new-access",
                "token_type": "bearer",
                "expires_in": 7200
            }));
        });

        let grant = client(&server).refresh("refresh456").await.unwrap();
        mock.assert();
        assert_eq!(grant.access_token, "new-access");
        assert_eq!(grant.refresh_token.as_deref(), Some("refresh456"));
    }

    #[tokio::test]
    async fn token_endpoint_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(400).body("invalid_grant");
        });

        let err = client(&server).exchange_code("bad", None).await.unwrap_err();
        mock.assert();
        match err {
            AuthError::TokenEndpoint { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_in_successful_response_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "error": "bad_verification_code",
                "error_description": "The code passed is incorrect or expired."
            }));
        });

        let err = client(&server).exchange_code("stale", None).await.unwrap_err();
        assert!(
            matches!(err, AuthError::Failed(reason) if reason == "The code passed is incorrect or expired.")
        );
    }
}

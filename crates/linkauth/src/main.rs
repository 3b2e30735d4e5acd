use std::env;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use linkauth_core::auth::{
    AccountManager, AuthKind, Credential, FileCredentialStore, MemoryCookieJar, OAuthClient,
    OAuthConfig,
};
use linkauth_core::config::AccountOptions;
use linkauth_core::http::Method;
use linkauth_core::providers::{self, AuthScheme, ProviderDescriptor};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:9000/callback";

#[derive(Parser, Debug)]
#[command(author, version, about = "Linked social accounts and signed API calls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported providers
    Providers,
    /// Stored account management
    #[command(subcommand)]
    Account(AccountCommand),
    /// Send an authenticated request and print the JSON body
    Request(RequestArgs),
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Show the stored credential summary for an account
    Show(AccountArgs),
    /// Forget the stored credential for an account
    Unlink(AccountArgs),
    /// Apply an options bundle (JSON object) to an account
    Configure(ConfigureArgs),
    /// Link an account from tokens obtained elsewhere
    AddToken(AddTokenArgs),
}

#[derive(Args, Debug)]
struct AccountArgs {
    /// Provider id (e.g. github, foursquare)
    provider: String,
    /// Account name for stored credentials
    #[arg(long, default_value = DEFAULT_ACCOUNT)]
    account: String,
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    #[command(flatten)]
    target: AccountArgs,
    /// Options as a JSON object, e.g. '{"browser_mode":"desktop"}'
    options: String,
}

#[derive(Args, Debug)]
struct AddTokenArgs {
    #[command(flatten)]
    target: AccountArgs,
    /// Access token (OAuth1/OAuth2) or session id (cookie providers)
    #[arg(long)]
    token: String,
    /// OAuth1 token secret
    #[arg(long = "token-secret")]
    token_secret: Option<String>,
    /// OAuth2 refresh token
    #[arg(long = "refresh-token")]
    refresh_token: Option<String>,
    /// CSRF token for cookie providers
    #[arg(long = "csrf-token")]
    csrf_token: Option<String>,
    /// Account username to record
    #[arg(long)]
    username: Option<String>,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[command(flatten)]
    target: AccountArgs,
    /// Path relative to the provider API base, or an absolute URL
    path: String,
    /// HTTP method
    #[arg(long, short = 'X', default_value = "GET")]
    method: String,
    /// Request parameters as key=value (repeatable)
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Providers => list_providers(),
        Commands::Account(cmd) => match cmd {
            AccountCommand::Show(args) => account_show(args).await?,
            AccountCommand::Unlink(args) => account_unlink(args).await?,
            AccountCommand::Configure(args) => account_configure(args).await?,
            AccountCommand::AddToken(args) => account_add_token(args).await?,
        },
        Commands::Request(args) => request(args).await?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = env::var("LINKAUTH_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list_providers() {
    for provider in providers::all() {
        println!(
            "{:<12} {:<8} {}",
            provider.id,
            provider.kind_name(),
            provider.api_base_url
        );
    }
}

fn resolve_provider(id: &str) -> Result<&'static ProviderDescriptor> {
    providers::find(id).ok_or_else(|| {
        anyhow!("unknown provider '{id}'; run `linkauth providers` for the supported list")
    })
}

fn env_value(provider: &ProviderDescriptor, suffix: &str) -> Option<String> {
    env::var(format!("{}_{suffix}", provider.env_prefix()))
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn build_oauth_client(provider: &ProviderDescriptor) -> Result<Option<OAuthClient>> {
    let Some(endpoints) = provider
        .oauth_endpoints()
        .context("invalid provider OAuth endpoints")?
    else {
        return Ok(None);
    };
    let Some(client_id) = env_value(provider, "CLIENT_ID") else {
        return Ok(None);
    };

    let redirect = match env_value(provider, "REDIRECT_URI") {
        Some(raw) => Url::parse(&raw)
            .with_context(|| format!("invalid {}_REDIRECT_URI", provider.env_prefix()))?,
        None => Url::parse(DEFAULT_REDIRECT_URI)?,
    };
    let mut config = OAuthConfig::new(client_id, redirect)
        .with_scopes(provider.default_scopes().iter().copied());
    if let Some(secret) = env_value(provider, "CLIENT_SECRET") {
        config = config.with_secret(secret);
    }
    Ok(Some(
        OAuthClient::new(config, endpoints).context("failed to build OAuth client")?,
    ))
}

async fn open_account(
    args: &AccountArgs,
) -> Result<AccountManager<FileCredentialStore>> {
    let provider = resolve_provider(&args.provider)?;
    let store = FileCredentialStore::with_default_locator()
        .context("unable to initialise credential store")?;
    let mut manager = AccountManager::new(store, provider, args.account.as_str())
        .with_cookie_jar(Arc::new(MemoryCookieJar::new()));
    if let Some(oauth) = build_oauth_client(provider)? {
        manager = manager.with_oauth(oauth);
    }
    manager
        .load()
        .await
        .context("failed to load stored credential")?;
    Ok(manager)
}

async fn account_show(args: AccountArgs) -> Result<()> {
    let manager = open_account(&args).await?;
    let credential = manager.snapshot().await;
    render_credential(&credential);
    Ok(())
}

fn render_credential(credential: &Credential) {
    println!("Account   : {}", credential.account_id);
    println!("Provider  : {}", credential.provider);
    println!("Kind      : {}", credential.auth.kind_name());
    println!(
        "Linked    : {}",
        if credential.is_authorized() { "yes" } else { "no" }
    );
    if let Some(username) = &credential.username {
        println!("Username  : {}", username);
    }
    if let Some(expiry) = credential.expires_at() {
        println!("Expires   : {} (UTC)", expiry.to_rfc3339());
    }
    if let Some(domain) = credential.auth.cookies_domain() {
        println!("Cookies   : {}", domain);
    }
    println!("Browser   : {}", credential.browser.mode);
    if credential.browser.keep_device_settings {
        println!("            keeping device settings");
    } else if let Some(agent) = &credential.browser.custom_user_agent {
        println!("UserAgent : {}", agent);
    }
}

async fn account_unlink(args: AccountArgs) -> Result<()> {
    let manager = open_account(&args).await?;
    manager
        .unlink()
        .await
        .context("failed to remove stored credentials")?;
    println!(
        "Unlinked {} account '{}'.",
        manager.provider().name,
        args.account
    );
    Ok(())
}

async fn account_configure(args: ConfigureArgs) -> Result<()> {
    let raw: Value = serde_json::from_str(&args.options).context("options must be valid JSON")?;
    let options = AccountOptions::from_json(&raw)?;
    let manager = open_account(&args.target).await?;
    let credential = manager
        .configure(&options)
        .await
        .context("failed to store account options")?;
    render_credential(&credential);
    Ok(())
}

async fn account_add_token(args: AddTokenArgs) -> Result<()> {
    let manager = open_account(&args.target).await?;
    let provider = manager.provider();

    let auth = match &provider.scheme {
        AuthScheme::OAuth1 { .. } => {
            let consumer_key = env_value(provider, "CLIENT_ID").ok_or_else(|| {
                anyhow!("{}_CLIENT_ID must hold the consumer key", provider.env_prefix())
            })?;
            let consumer_secret = env_value(provider, "CLIENT_SECRET").ok_or_else(|| {
                anyhow!(
                    "{}_CLIENT_SECRET must hold the consumer secret",
                    provider.env_prefix()
                )
            })?;
            let token_secret = args
                .token_secret
                .clone()
                .ok_or_else(|| anyhow!("--token-secret is required for OAuth1 providers"))?;
            AuthKind::OAuth1 {
                consumer_key,
                consumer_secret,
                token: args.token.clone(),
                token_secret,
            }
        }
        AuthScheme::OAuth2 { .. } => AuthKind::OAuth2 {
            access_token: args.token.clone(),
            refresh_token: args.refresh_token.clone(),
            expires_at: None,
        },
        AuthScheme::Cookie {
            cookies_domain,
            session_cookie,
            ..
        } => {
            let Some(csrf_token) = args.csrf_token.clone() else {
                bail!("--csrf-token is required for cookie-session providers");
            };
            let stored = manager.snapshot().await;
            AuthKind::Cookie {
                session_id: args.token.clone(),
                csrf_token,
                cookies: vec![],
                cookies_domain: stored
                    .auth
                    .cookies_domain()
                    .unwrap_or(*cookies_domain)
                    .to_owned(),
                session_cookie_field: (*session_cookie).to_owned(),
            }
        }
    };

    let credential = manager
        .link(auth, args.username.clone())
        .await
        .context("failed to store credential")?;
    println!(
        "Linked {} account '{}'.",
        provider.name, credential.account_id
    );
    Ok(())
}

async fn request(args: RequestArgs) -> Result<()> {
    let manager = open_account(&args.target).await?;
    if !manager.snapshot().await.is_authorized() {
        bail!(
            "account '{}' is not linked; run `linkauth account add-token {}`",
            args.target.account,
            manager.provider().id
        );
    }
    manager
        .ensure_fresh()
        .await
        .context("failed to refresh access token")?;

    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method '{}'", args.method))?;
    let params = args
        .params
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| anyhow!("parameter '{pair}' must be key=value"))
        })
        .collect::<Result<Vec<_>>>()?;

    let client = manager.api_client().context("failed to build API client")?;
    let response = client
        .perform(&args.path, method, params, vec![])
        .await
        .context("request failed")?;

    match serde_json::from_slice::<Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }

    // Keep refreshed tokens and rotated cookies.
    manager
        .persist()
        .await
        .context("failed to store updated credential")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_request_params() {
        let cli = Cli::parse_from([
            "linkauth",
            "request",
            "github",
            "/user",
            "--account",
            "work",
            "-p",
            "per_page=5",
        ]);
        let Commands::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.target.provider, "github");
        assert_eq!(args.target.account, "work");
        assert_eq!(args.method, "GET");
        assert_eq!(args.params, vec!["per_page=5".to_owned()]);
    }

    #[test]
    fn unknown_provider_is_reported() {
        let err = resolve_provider("myspace").unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }
}

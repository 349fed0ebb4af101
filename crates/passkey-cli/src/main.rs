use anyhow::{anyhow, bail, Context, Result};
use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand};
use passkey_core::auth::{
    parse_redirect, AuthError, AuthFlow, AuthManager, CallbackOutcome, FileSessionStore,
    FlowPreference, OAuthClient, PasskeyAction, TokenSet,
};
use passkey_core::config::OidcConfig;
use passkey_core::credentials::{CredentialClient, WebAuthnCredential};
use serde_json::json;
use tokio::task;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_SESSION: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about = "Passkey-enabled OAuth 2.0 / OIDC login client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in through the hosted login page
    Login(LoginArgs),
    /// Start a login attempt and print the authorization URL
    AuthorizeUrl(AuthorizeUrlArgs),
    /// Complete a login attempt from the redirect the provider sent back
    Callback(CallbackArgs),
    /// Show whether the session holds tokens
    Status(StatusArgs),
    /// Forget the session tokens and sign out at the provider
    Logout(LogoutArgs),
    /// Manage registered passkeys
    #[command(subcommand)]
    Passkeys(PasskeysCommand),
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Session name for stored login state
    #[arg(long, env = "PASSKEY_SESSION", default_value = DEFAULT_SESSION)]
    session: String,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Use manual copy/paste flow instead of the loopback listener
    #[arg(long)]
    manual: bool,
    /// Print the authorization URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
    /// Value for the `prompt` authorization parameter (e.g. login)
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(Args, Debug)]
struct AuthorizeUrlArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Value for the `prompt` authorization parameter (e.g. login)
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(Args, Debug)]
struct CallbackArgs {
    /// Redirect URL (or its query string) the provider sent the browser to
    redirect: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct LogoutArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Print the logout URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
}

#[derive(Subcommand, Debug)]
enum PasskeysCommand {
    /// List passkeys registered to the signed-in user
    List(PasskeyListArgs),
    /// Delete a registered passkey
    Delete(PasskeyDeleteArgs),
    /// Open the hosted page for registering a new passkey
    Add(PasskeyAddArgs),
}

#[derive(Args, Debug)]
struct PasskeyListArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PasskeyDeleteArgs {
    /// Credential id as shown by `passkeys list`
    credential_id: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct PasskeyAddArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Print the URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Login(args) => login(args).await?,
        Commands::AuthorizeUrl(args) => authorize_url(args)?,
        Commands::Callback(args) => callback(args).await?,
        Commands::Status(args) => status(args)?,
        Commands::Logout(args) => logout(args)?,
        Commands::Passkeys(cmd) => match cmd {
            PasskeysCommand::List(args) => passkeys_list(args).await?,
            PasskeysCommand::Delete(args) => passkeys_delete(args).await?,
            PasskeysCommand::Add(args) => passkeys_add(args)?,
        },
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager(session: &SessionArgs) -> Result<AuthManager<FileSessionStore>> {
    let config = OidcConfig::from_env().context("invalid login configuration")?;
    let store = FileSessionStore::with_default_locator(&session.session)
        .context("unable to initialise session store")?;
    tracing::debug!(path = %store.path().display(), "using session store");
    let oauth = OAuthClient::new(config).context("failed to build OAuth client")?;
    Ok(AuthManager::new(store, oauth))
}

/// Attach the generic restart-login message, keeping the detailed cause underneath.
fn auth_failure(err: AuthError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

async fn login(args: LoginArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let prompt = args.prompt.as_deref();

    let mut preference = FlowPreference::detect(manager.oauth().config().redirect_uri());
    if args.manual {
        preference = preference.force_manual();
    }
    if args.no_browser {
        preference = preference.without_browser();
    }

    let outcome = match preference.flow() {
        AuthFlow::Manual => manual_login(&manager, preference.open_browser(), prompt).await,
        AuthFlow::Loopback => {
            match manager
                .authenticate_browser(preference.open_browser(), prompt, print_authorization_url)
                .await
            {
                Ok(outcome) => Ok(outcome),
                Err(AuthError::BrowserLaunch(reason)) => {
                    eprintln!(
                        "Failed to launch browser ({reason}); falling back to manual copy/paste flow."
                    );
                    manual_login(&manager, false, prompt).await
                }
                Err(other) => Err(other),
            }
        }
    }
    .map_err(auth_failure)?;

    report_outcome(&outcome, &args.session.session);
    Ok(())
}

async fn manual_login(
    manager: &AuthManager<FileSessionStore>,
    open_browser: bool,
    prompt: Option<&str>,
) -> Result<CallbackOutcome, AuthError> {
    manager
        .authenticate_manual(open_browser, prompt, print_authorization_url, || async {
            prompt_for_redirect().await
        })
        .await
}

fn authorize_url(args: AuthorizeUrlArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let url = manager
        .begin_login(args.prompt.as_deref())
        .map_err(auth_failure)?;
    println!("{url}");
    Ok(())
}

async fn callback(args: CallbackArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let params = parse_redirect(&args.redirect).map_err(auth_failure)?;
    let outcome = manager
        .complete_callback(&params)
        .await
        .map_err(auth_failure)?;
    report_outcome(&outcome, &args.session.session);
    Ok(())
}

fn report_outcome(outcome: &CallbackOutcome, session: &str) {
    match outcome {
        CallbackOutcome::Committed(tokens) => {
            println!("Login succeeded. Tokens stored for session '{session}'.");
            if let Ok(claims) = tokens.claims() {
                println!(
                    "Logged in as {}",
                    claims.email.as_deref().unwrap_or(&claims.subject)
                );
            }
            if let Some(expiry) = tokens.expires_at() {
                println!(
                    "Token expires at {} (UTC).",
                    expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
                );
            }
        }
        CallbackOutcome::OperationCompleted => {
            println!("Operation completed.");
        }
    }
}

fn status(args: StatusArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let description = manager.describe().context("failed to read session")?;
    let tokens = manager.current_tokens().context("failed to read session")?;
    let claims = manager.current_claims().context("failed to read session")?;

    if args.json {
        let expires_at = tokens
            .as_ref()
            .and_then(TokenSet::expires_at)
            .map(|expiry| expiry.to_rfc3339_opts(SecondsFormat::Secs, true));
        let value = json!({
            "session": args.session.session,
            "status": description,
            "subject": claims.as_ref().map(|c| c.subject.clone()),
            "email": claims.as_ref().and_then(|c| c.email.clone()),
            "expires_at": expires_at,
            "expired": tokens.as_ref().map(TokenSet::is_expired),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Session '{}': {}", args.session.session, description);
    if let Some(claims) = claims {
        println!("Subject   : {}", claims.subject);
        if let Some(email) = claims.email {
            println!("Email     : {}", email);
        }
    }
    if let Some(tokens) = tokens {
        if let Some(expiry) = tokens.expires_at() {
            let suffix = if tokens.is_expired() { " (expired)" } else { "" };
            println!(
                "Expires   : {}{}",
                expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
                suffix
            );
        }
    }
    Ok(())
}

fn logout(args: LogoutArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let url = manager.logout().map_err(auth_failure)?;
    println!("Cleared tokens for session '{}'.", args.session.session);
    open_or_print("Finish signing out at the provider by visiting", &url, !args.no_browser)
}

fn passkeys_add(args: PasskeyAddArgs) -> Result<()> {
    let manager = build_manager(&args.session)?;
    let url = manager
        .passkey_url(PasskeyAction::Add)
        .map_err(auth_failure)?;
    open_or_print("Register a new passkey by visiting", &url, !args.no_browser)
}

async fn passkeys_list(args: PasskeyListArgs) -> Result<()> {
    let client = credential_client(&args.session)?;
    let credentials = client
        .list_credentials()
        .await
        .context("failed to list passkeys")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&credentials)?);
    } else if credentials.is_empty() {
        println!("No passkeys registered.");
    } else {
        render_credentials(&credentials);
    }
    Ok(())
}

async fn passkeys_delete(args: PasskeyDeleteArgs) -> Result<()> {
    let client = credential_client(&args.session)?;
    client
        .delete_credential(&args.credential_id)
        .await
        .with_context(|| format!("failed to delete passkey '{}'", args.credential_id))?;
    println!("Deleted passkey '{}'.", args.credential_id);
    Ok(())
}

fn credential_client(session: &SessionArgs) -> Result<CredentialClient> {
    let manager = build_manager(session)?;
    let tokens = manager
        .current_tokens()
        .context("failed to read session")?
        .ok_or_else(|| anyhow!("not logged in; run `passkey login` first"))?;
    if tokens.is_expired() {
        eprintln!("Stored access token has expired; the request will likely be rejected.");
    }
    let Some(region) = manager.oauth().config().region() else {
        bail!("unable to determine the provider region; set COGNITO_REGION");
    };
    CredentialClient::from_tokens(&tokens, region).context("failed to build credential client")
}

fn render_credentials(credentials: &[WebAuthnCredential]) {
    println!("{:<44} {:<24} {:<20}", "ID", "NAME", "CREATED");
    println!("{}", "-".repeat(90));
    for credential in credentials {
        let created = credential
            .created_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<44} {:<24} {:<20}",
            credential.credential_id,
            credential.friendly_name.as_deref().unwrap_or("-"),
            created
        );
    }
}

fn open_or_print(label: &str, url: &Url, launch: bool) -> Result<()> {
    println!("\n{label}:\n  {url}\n");
    if launch && FlowPreference::detect(url).open_browser() {
        if let Err(err) = open::that(url.as_str()) {
            eprintln!("Failed to launch browser ({err}); open the URL above manually.");
        }
    }
    Ok(())
}

async fn prompt_for_redirect() -> Result<String, AuthError> {
    task::spawn_blocking(|| {
        use std::io::{self, Write};
        print!("Paste the URL your browser was redirected to: ");
        io::stdout().flush().map_err(AuthError::Io)?;
        let mut input = String::new();
        io::stdin().read_line(&mut input).map_err(AuthError::Io)?;
        Ok(input.trim().to_owned())
    })
    .await
    .map_err(|_| AuthError::Cancelled)?
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nAuthorize the application by visiting:\n  {}\n", url);
    Ok(())
}

use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const ENV_DOMAIN: &str = "COGNITO_DOMAIN";
pub const ENV_CLIENT_ID: &str = "COGNITO_CLIENT_ID";
pub const ENV_REDIRECT_URI: &str = "COGNITO_REDIRECT_URI";
pub const ENV_LOGOUT_URI: &str = "COGNITO_LOGOUT_URI";
pub const ENV_SCOPES: &str = "COGNITO_SCOPES";
pub const ENV_REGION: &str = "COGNITO_REGION";
pub const ENV_LANG: &str = "COGNITO_LANG";

/// Static OpenID Connect parameters shared by every stage of the login flow.
///
/// Values are validated once at construction and never change afterwards, so the
/// fields are only exposed through accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcConfig {
    domain: String,
    client_id: String,
    redirect_uri: Url,
    logout_uri: Url,
    scopes: Vec<String>,
    region: Option<String>,
    lang: Option<String>,
}

impl OidcConfig {
    /// Resolve the configuration from `COGNITO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve the configuration from an arbitrary key/value source.
    ///
    /// Blank values count as missing. The domain may be given as a bare host or as a
    /// full URL; only the host (and a non-default port) is kept.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let optional = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let domain = normalize_domain(&required(ENV_DOMAIN)?)?;
        let client_id = required(ENV_CLIENT_ID)?;
        let redirect_uri = parse_uri(ENV_REDIRECT_URI, &required(ENV_REDIRECT_URI)?)?;
        let logout_uri = parse_uri(ENV_LOGOUT_URI, &required(ENV_LOGOUT_URI)?)?;
        let scopes = required(ENV_SCOPES)?
            .split_whitespace()
            .map(str::to_owned)
            .collect::<Vec<_>>();

        let region = optional(ENV_REGION).or_else(|| infer_region(&domain));
        let lang = optional(ENV_LANG);

        Ok(Self {
            domain,
            client_id,
            redirect_uri,
            logout_uri,
            scopes,
            region,
            lang,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn logout_uri(&self) -> &Url {
        &self.logout_uri
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Space separated scope list as sent in the `scope` parameter.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// Region of the user pool, either configured or inferred from a prefix domain.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// UI locale forwarded to the hosted login and logout pages.
    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    /// Base URL of the provider's hosted endpoints.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&format!("https://{}/", self.domain))
            .map_err(|_| ConfigError::InvalidDomain(self.domain.clone()))
    }
}

/// Reduce a domain given as a bare host or a full URL to `host[:port]`.
pub fn normalize_domain(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    let invalid = || ConfigError::InvalidDomain(value.to_owned());

    let host = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?;
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    } else {
        trimmed.split('/').next().unwrap_or_default().to_owned()
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Url::parse(&format!("https://{host}/")).map_err(|_| invalid())?;
    Ok(host)
}

/// Prefix domains look like `<prefix>.auth.<region>.amazoncognito.com`.
fn infer_region(domain: &str) -> Option<String> {
    let host = domain.split(':').next()?;
    let labels: Vec<&str> = host.split('.').collect();
    match labels.as_slice() {
        [_, .., "auth", region, "amazoncognito", "com"] => Some((*region).to_owned()),
        _ => None,
    }
}

fn parse_uri(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUri { name, source })
}

/// Locates the directory holding per-session state.
///
/// The runtime directory is used so that stored attempts and tokens disappear when
/// the user session ends, the same lifetime a browser gives `sessionStorage`.
#[derive(Debug, Clone)]
pub struct SessionLocator {
    root: PathBuf,
}

impl SessionLocator {
    /// Discover the session directory, creating it with owner-only permissions.
    ///
    /// Platforms without a runtime directory (macOS, Windows) fall back to the OS temp
    /// directory, which is not guaranteed to be emptied by a restart.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "passkey", "passkey-rs")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let root = session_root(dirs.runtime_dir());
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the state file for a named session.
    pub fn session_file(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConfigError::InvalidSessionName(name.to_owned()));
        }
        Ok(self.root.join(format!("session-{name}.json")))
    }
}

fn session_root(runtime_dir: Option<&Path>) -> PathBuf {
    match runtime_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let root = env::temp_dir().join(fallback_dir_name());
            tracing::warn!(
                path = %root.display(),
                "no per-session runtime directory; session state may outlive a restart"
            );
            root
        }
    }
}

fn fallback_dir_name() -> String {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_default();
    if user.is_empty() {
        "passkey-rs".to_owned()
    } else {
        format!("passkey-rs-{user}")
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Fatal configuration problems, raised before any login attempt can begin.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value {0}")]
    Missing(&'static str),
    #[error("invalid provider domain '{0}'")]
    InvalidDomain(String),
    #[error("invalid URL in {name}: {source}")]
    InvalidUri {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid session name '{0}'")]
    InvalidSessionName(String),
    #[error("unable to determine session directory for passkey-rs")]
    MissingProjectDirs,
    #[error("failed to create session directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> OidcConfig {
    OidcConfig::from_lookup(|key| {
        let value = match key {
            ENV_DOMAIN => "demo.auth.ap-northeast-1.amazoncognito.com",
            ENV_CLIENT_ID => "client-id",
            ENV_REDIRECT_URI => "http://localhost:5173/callback",
            ENV_LOGOUT_URI => "http://localhost:5173/",
            ENV_SCOPES => "openid email profile",
            _ => return None,
        };
        Some(value.to_owned())
    })
    .unwrap()
}

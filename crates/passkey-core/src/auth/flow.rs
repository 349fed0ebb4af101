use std::env;

use url::{Host, Url};

pub const ENV_AUTH_FLOW: &str = "PASSKEY_AUTH_FLOW";
pub const ENV_NO_BROWSER: &str = "PASSKEY_NO_BROWSER";

/// Ways of delivering the provider redirect back to the callback validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Receive the redirect on a loopback listener bound to the redirect URI.
    Loopback,
    /// Print the authorization URL and read the pasted redirect URL.
    Manual,
}

/// Decides how a login is driven on this machine.
#[derive(Debug, Clone, Copy)]
pub struct FlowPreference {
    flow: AuthFlow,
    open_browser: bool,
}

impl FlowPreference {
    /// Pick a flow from `PASSKEY_AUTH_FLOW`, the redirect URI and the terminal environment.
    ///
    /// The loopback flow is only possible when the registered redirect URI points at
    /// this machine over plain `http`.
    pub fn detect(redirect_uri: &Url) -> Self {
        let loopback_possible = is_loopback_redirect(redirect_uri);
        let open_browser = browser_available();

        let requested = env::var(ENV_AUTH_FLOW)
            .ok()
            .and_then(|value| value.parse::<AuthFlow>().ok());

        let flow = match requested {
            Some(AuthFlow::Loopback) if loopback_possible => AuthFlow::Loopback,
            Some(_) => AuthFlow::Manual,
            None if loopback_possible => AuthFlow::Loopback,
            None => AuthFlow::Manual,
        };

        Self { flow, open_browser }
    }

    pub fn flow(&self) -> AuthFlow {
        self.flow
    }

    /// Whether the system browser should be launched automatically.
    pub fn open_browser(&self) -> bool {
        self.open_browser
    }

    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    pub fn force_manual(mut self) -> Self {
        self.flow = AuthFlow::Manual;
        self
    }
}

pub fn is_loopback_redirect(redirect_uri: &Url) -> bool {
    if redirect_uri.scheme() != "http" {
        return false;
    }
    match redirect_uri.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn browser_available() -> bool {
    if env::var_os(ENV_NO_BROWSER).is_some() {
        return false;
    }

    if env::var_os("SSH_CONNECTION").is_some() && env::var_os("DISPLAY").is_none() {
        return false;
    }

    if env::var_os("DISPLAY").is_some() || env::var_os("WAYLAND_DISPLAY").is_some() {
        return true;
    }

    cfg!(target_os = "windows") || cfg!(target_os = "macos")
}

impl std::str::FromStr for AuthFlow {
    type Err = InvalidFlow;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loopback" | "browser" => Ok(AuthFlow::Loopback),
            "manual" | "paste" => Ok(AuthFlow::Manual),
            other => Err(InvalidFlow(other.to_owned())),
        }
    }
}

impl std::fmt::Display for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            AuthFlow::Loopback => "loopback",
            AuthFlow::Manual => "manual",
        };
        write!(f, "{value}")
    }
}

/// Error reported when parsing an unsupported flow.
#[derive(Debug, thiserror::Error)]
#[error("invalid auth flow '{0}'")]
pub struct InvalidFlow(pub String);

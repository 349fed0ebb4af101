use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use url::{Host, Url};

use super::flow::is_loopback_redirect;
use super::orchestrator::begin_login;
use super::{AuthError, CallbackOutcome, CallbackParams, CallbackValidator, OAuthClient, SessionStore};

const RECEIVED_HTML: &str = r#"<html><body><h1>Sign-in response received</h1><p>You may close this window and return to the terminal.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;
const BAD_REQUEST_HTML: &str = r#"<html><body><h1>Bad request</h1></body></html>"#;

/// Bind a listener on the host and port of a loopback `http` redirect URI.
pub async fn bind_redirect_listener(redirect_uri: &Url) -> Result<TcpListener, AuthError> {
    let unsupported = || AuthError::UnsupportedRedirect(redirect_uri.to_string());
    if !is_loopback_redirect(redirect_uri) {
        return Err(unsupported());
    }
    let addr = match redirect_uri.host() {
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        Some(Host::Domain(_)) => "127.0.0.1".to_owned(),
        None => return Err(unsupported()),
    };
    let port = redirect_uri.port_or_known_default().ok_or_else(unsupported)?;
    Ok(TcpListener::bind((addr.as_str(), port)).await?)
}

/// Run the browser flow, receiving the redirect on an already bound listener.
pub async fn run_loopback_flow<S, F>(
    client: &OAuthClient,
    store: &S,
    listener: TcpListener,
    open_browser: bool,
    prompt: Option<&str>,
    notify_authorization_url: F,
) -> Result<CallbackOutcome, AuthError>
where
    S: SessionStore + ?Sized,
    F: Fn(&Url) -> Result<(), AuthError>,
{
    let callback_path = client.config().redirect_uri().path().to_owned();
    let auth_url = begin_login(client, store, prompt)?;

    notify_authorization_url(&auth_url)?;

    if open_browser {
        open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
    }

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = wait_for_callback(listener, &callback_path).await;
        let _ = tx.send(result);
    });

    let params = rx.await.map_err(|_| AuthError::ListenerClosed)??;
    CallbackValidator::new(client, store).validate(&params).await
}

/// Accept connections until one targets `callback_path`, then return its parameters.
///
/// Connections that send nothing or an unparseable request are dropped and the
/// listener keeps waiting; only a failure of the listener itself ends the wait.
pub async fn wait_for_callback(
    listener: TcpListener,
    callback_path: &str,
) -> Result<CallbackParams, AuthError> {
    loop {
        let (mut stream, _addr) = listener.accept().await?;
        let mut buffer = [0u8; 8192];
        let n = match stream.read(&mut buffer).await {
            Ok(0) => {
                tracing::debug!("ignoring connection closed without a request");
                continue;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring unreadable connection");
                continue;
            }
        };
        let request = String::from_utf8_lossy(&buffer[..n]);
        let parsed = parse_request_target(&request).and_then(|target| {
            Url::parse(&format!("http://localhost{target}")).map_err(AuthError::from)
        });
        let url = match parsed {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed request");
                let _ = respond(&mut stream, 400, BAD_REQUEST_HTML).await;
                continue;
            }
        };

        if url.path() != callback_path {
            tracing::debug!(path = url.path(), "ignoring request outside the callback path");
            let _ = respond(&mut stream, 404, NOT_FOUND_HTML).await;
            continue;
        }

        respond(&mut stream, 200, RECEIVED_HTML).await?;
        let _ = stream.shutdown().await;
        return Ok(CallbackParams::from_url(&url));
    }
}

fn parse_request_target(request: &str) -> Result<&str, AuthError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing path".into()))?;
    if !target.starts_with('/') {
        return Err(AuthError::InvalidAuthorizationResponse(format!(
            "unexpected request target {target}"
        )));
    }
    Ok(target)
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::id_token::encode_test_token;
    use crate::auth::oauth::test_endpoints;
    use crate::auth::MemorySessionStore;
    use crate::config::test_config;
    use httpmock::prelude::*;

    async fn send_request(port: u16, target: String) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request =
            format!("GET {target} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn query_value(url: &Url, key: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .expect("query parameter present")
    }

    #[tokio::test]
    async fn loopback_flow_commits_tokens() {
        let server = MockServer::start();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client =
            OAuthClient::with_endpoints(test_config(), test_endpoints(&server.base_url())).unwrap();
        let store = MemorySessionStore::new();

        let outcome = run_loopback_flow(&client, &store, listener, false, None, |url| {
            let state = query_value(url, "state");
            let id_token = encode_test_token(&serde_json::json!({
                "sub": "user-1",
                "nonce": query_value(url, "nonce")
            }));
            server.mock(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .x_www_form_urlencoded_tuple("code", "test-code");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "abc",
                    "id_token": id_token,
                    "token_type": "Bearer",
                    "expires_in": 3600
                }));
            });
            tokio::spawn(async move {
                send_request(port, "/favicon.ico".into()).await;
                send_request(port, format!("/callback?code=test-code&state={state}")).await;
            });
            Ok(())
        })
        .await
        .expect("loopback flow succeeded");

        let CallbackOutcome::Committed(tokens) = outcome else {
            panic!("expected committed outcome");
        };
        assert_eq!(tokens.access_token, "abc");
        assert_eq!(store.read_tokens().unwrap(), Some(tokens));
        assert!(store.read_attempt().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loopback_flow_state_mismatch() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(500);
        });
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client =
            OAuthClient::with_endpoints(test_config(), test_endpoints(&server.base_url())).unwrap();
        let store = MemorySessionStore::new();

        let err = run_loopback_flow(&client, &store, listener, false, None, |_url| {
            tokio::spawn(async move {
                send_request(port, "/callback?code=test-code&state=wrong".into()).await;
            });
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AuthError::StateMismatch));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn wait_for_callback_returns_provider_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client_task = tokio::spawn(async move {
            send_request(port, "/callback?error=access_denied".into()).await
        });
        let params = wait_for_callback(listener, "/callback").await.unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        let response = client_task.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn empty_and_malformed_connections_do_not_end_the_wait() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client_task = tokio::spawn(async move {
            drop(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
            let garbage = {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                stream.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            };
            let callback = send_request(port, "/callback?code=c&state=s".into()).await;
            (garbage, callback)
        });

        let params = wait_for_callback(listener, "/callback").await.unwrap();
        assert_eq!(params.code.as_deref(), Some("c"));
        assert_eq!(params.state.as_deref(), Some("s"));

        let (garbage, callback) = client_task.await.unwrap();
        assert!(garbage.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(callback.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn non_loopback_redirects_are_rejected() {
        for uri in [
            "https://localhost/callback",
            "http://app.example.com/callback",
        ] {
            let err = bind_redirect_listener(&Url::parse(uri).unwrap())
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::UnsupportedRedirect(_)));
        }
    }

    #[test]
    fn request_target_parsing() {
        assert_eq!(
            parse_request_target("GET /callback?code=1 HTTP/1.1\r\n").unwrap(),
            "/callback?code=1"
        );
        assert!(parse_request_target("").is_err());
        assert!(parse_request_target("GET").is_err());
        assert!(parse_request_target("GET http://evil/ HTTP/1.1").is_err());
    }
}

//! One-shot loopback listener for the OAuth redirect
//!
//! Binds 127.0.0.1 on the port picked by `find_available_port`, accepts a
//! single connection, reads the request line and answers with a tiny HTML
//! page. The listener never takes a second connection.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use url::Url;

use super::AuthError;

pub const CALLBACK_PATH: &str = "/callback";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REQUEST_BYTES: usize = 4096;

const SUCCESS_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h2>Success!</h2><p>You can close this tab.</p></body></html>";
const FAILURE_RESPONSE: &str = "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h2>Login failed</h2><p>You can close this tab.</p></body></html>";

/// Ask the OS for a free loopback port, then release it for reuse
pub fn find_available_port() -> Result<u16, AuthError> {
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(AuthError::BindFailed)?;
    let port = probe.local_addr().map_err(AuthError::BindFailed)?.port();
    drop(probe);
    Ok(port)
}

pub fn redirect_uri(port: u16) -> String {
    format!("http://localhost:{}{}", port, CALLBACK_PATH)
}

pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind(port: u16) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(AuthError::BindFailed)?;
        tracing::debug!("OAuth callback listener bound on 127.0.0.1:{}", port);
        Ok(Self { listener })
    }

    /// Wait for the redirect and return its `code`.
    ///
    /// Gives up at `timeout`, or at the next poll after `cancel` is set. The
    /// socket is closed on every exit path because `self` is consumed.
    pub async fn wait_for_code(
        self,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> Result<String, AuthError> {
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.load(Ordering::Acquire) {
                return Err(AuthError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("OAuth callback not received within {:?}", timeout);
                return Err(AuthError::Timeout);
            }

            let wait = POLL_INTERVAL.min(deadline - now);
            match tokio::time::timeout(wait, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    tracing::debug!("OAuth callback accept failed: {}", err);
                    continue;
                }
                Ok(Ok((stream, peer))) => {
                    tracing::debug!("OAuth callback connection from {}", peer);
                    drop(self.listener);
                    return handle_connection(stream, deadline).await;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, deadline: Instant) -> Result<String, AuthError> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let read = match tokio::time::timeout_at(deadline, stream.read(&mut buffer)).await {
        Ok(Ok(read)) => read,
        Ok(Err(err)) => {
            return Err(AuthError::MissingCode(format!("callback read failed: {}", err)));
        }
        Err(_) => return Err(AuthError::Timeout),
    };

    let request = String::from_utf8_lossy(&buffer[..read]);
    let result = parse_callback_request(&request);

    let response = if result.is_ok() {
        SUCCESS_RESPONSE
    } else {
        FAILURE_RESPONSE
    };
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        tracing::debug!("Failed to answer OAuth callback: {}", err);
    }
    let _ = stream.shutdown().await;

    result
}

/// Pull `code` out of `GET /callback?code=... HTTP/1.1`
pub fn parse_callback_request(request: &str) -> Result<String, AuthError> {
    let request_line = request.lines().next().unwrap_or_default();
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::MissingCode("malformed callback request".to_string()))?;

    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .map_err(|err| AuthError::MissingCode(format!("malformed callback target: {}", err)))?;

    code_from_url(&url)
}

/// The `code` query parameter of a callback URL
pub fn code_from_url(url: &Url) -> Result<String, AuthError> {
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => return Ok(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    Err(AuthError::MissingCode(match error {
        Some(error) => format!("authorization denied: {}", error),
        None => "callback carried no code".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_from_request_line() {
        let request = "GET /callback?code=abc%2D123&state=xyz HTTP/1.1\r\nHost: localhost:5555\r\n\r\n";
        assert_eq!(parse_callback_request(request).expect("code"), "abc-123");
    }

    #[test]
    fn reports_denied_and_empty_callbacks() {
        let denied = parse_callback_request("GET /callback?error=access_denied HTTP/1.1\r\n\r\n");
        match denied {
            Err(AuthError::MissingCode(message)) => assert!(message.contains("access_denied")),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(parse_callback_request("GET /callback?code= HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_callback_request("garbage").is_err());
        assert!(parse_callback_request("").is_err());
    }

    #[test]
    fn redirect_uri_uses_localhost() {
        assert_eq!(redirect_uri(4321), "http://localhost:4321/callback");
    }

    #[tokio::test]
    async fn listener_returns_code_and_answers_once() {
        let port = find_available_port().expect("port");
        let listener = CallbackListener::bind(port).await.expect("bind");
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = tokio::spawn(listener.wait_for_code(Duration::from_secs(5), cancel));

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.expect("connect");
        client
            .write_all(b"GET /callback?code=the-code HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        client.read_to_string(&mut response).await.expect("read");

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("You can close this tab."));
        assert_eq!(waiter.await.expect("join").expect("code"), "the-code");

        // The socket is gone once a callback has been handled
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn listener_times_out_without_callback() {
        let port = find_available_port().expect("port");
        let listener = CallbackListener::bind(port).await.expect("bind");
        let result = listener
            .wait_for_code(Duration::from_millis(250), Arc::new(AtomicBool::new(false)))
            .await;
        assert!(matches!(result, Err(AuthError::Timeout)));
    }

    #[tokio::test]
    async fn listener_stops_when_cancelled() {
        let port = find_available_port().expect("port");
        let listener = CallbackListener::bind(port).await.expect("bind");
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = tokio::spawn(listener.wait_for_code(Duration::from_secs(30), cancel.clone()));

        cancel.store(true, Ordering::Release);
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("stopped within a poll")
            .expect("join");
        assert!(matches!(result, Err(AuthError::Cancelled)));
    }

    #[tokio::test]
    async fn second_bind_on_taken_port_fails() {
        let port = find_available_port().expect("port");
        let _first = CallbackListener::bind(port).await.expect("bind");
        assert!(matches!(
            CallbackListener::bind(port).await,
            Err(AuthError::BindFailed(_))
        ));
    }
}

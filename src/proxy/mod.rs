//! The proxy chain: a local proxy the browser talks to, and a remote proxy
//! run by an upstream peer that egresses traffic to the open Internet.
//!
//! Both ends work on raw sockets: the request head is read and parsed just
//! far enough to route it, then the two sockets are spliced and bytes flow
//! untouched in both directions until either side closes. The splice itself
//! is deliberately unbounded - CONNECT tunnels stay up as long as the
//! browser keeps them open.

pub mod local;
pub mod remote;

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read/write timeout applied at the request layer (not to the splice).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the request head we are willing to buffer.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("timed out reading request head")]
    ReadTimeout,
    #[error("malformed request head")]
    Malformed,
    #[error("connection closed before a full request arrived")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed HTTP request head plus every raw byte read from the client so
/// far. `raw` may extend past the head (the start of a request body); it is
/// forwarded verbatim so nothing is lost when the splice takes over.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
    pub raw: Vec<u8>,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Case-insensitive single-valued header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The destination host with a port, defaulting to `:443` for CONNECT
    /// and `:80` otherwise.
    pub fn host_including_port(&self) -> Option<String> {
        let host = if self.is_connect() {
            self.target.clone()
        } else {
            match self.header("Host") {
                Some(host) => host.to_string(),
                // absolute-form target: scheme://host[:port]/path
                None => {
                    let rest = self.target.split("://").nth(1)?;
                    rest.split('/').next()?.to_string()
                }
            }
        };
        if host.is_empty() {
            return None;
        }
        if host.contains(':') {
            Some(host)
        } else if self.is_connect() {
            Some(format!("{}:443", host))
        } else {
            Some(format!("{}:80", host))
        }
    }
}

/// Read a request head from the stream, bounded by [`REQUEST_TIMEOUT`] and
/// [`MAX_HEAD_BYTES`].
pub async fn read_request_head<S>(stream: &mut S) -> Result<RequestHead, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::ReadTimeout)??;
        if n == 0 {
            return Err(ProxyError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            return parse_head(buf, end);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(raw: Vec<u8>, head_end: usize) -> Result<RequestHead, ProxyError> {
    let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| ProxyError::Malformed)?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ProxyError::Malformed)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ProxyError::Malformed)?.to_string();
    let target = parts.next().ok_or(ProxyError::Malformed)?.to_string();
    if parts.next().is_none() {
        return Err(ProxyError::Malformed);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(ProxyError::Malformed)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        headers,
        raw,
    })
}

/// Copy bytes in both directions until either end closes, then close the
/// other.
pub async fn pipe<A, B>(mut a: A, mut b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => debug!("Tunnel closed after {} bytes up, {} bytes down", up, down),
        Err(e) => debug!("Tunnel closed: {}", e),
    }
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}

/// Write a 502 with the given message and close the connection.
pub async fn respond_bad_gateway<S>(stream: &mut S, msg: String)
where
    S: AsyncWrite + Unpin,
{
    tracing::info!("{}", msg);
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        msg.len(),
        msg
    );
    let _ = tokio::time::timeout(REQUEST_TIMEOUT, stream.write_all(response.as_bytes())).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(bytes: &[u8]) -> RequestHead {
        let end = find_head_end(bytes).unwrap();
        parse_head(bytes.to_vec(), end).unwrap()
    }

    #[test]
    fn test_parse_plain_request() {
        let head = head_of(b"GET http://origin/path HTTP/1.1\r\nHost: origin\r\nAccept: */*\r\n\r\n");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://origin/path");
        assert_eq!(head.header("host"), Some("origin"));
        assert_eq!(head.host_including_port().unwrap(), "origin:80");
    }

    #[test]
    fn test_parse_connect_request() {
        let head = head_of(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
        assert!(head.is_connect());
        assert_eq!(head.host_including_port().unwrap(), "example.com:8443");

        let head = head_of(b"CONNECT example.com HTTP/1.1\r\n\r\n");
        assert_eq!(head.host_including_port().unwrap(), "example.com:443");
    }

    #[test]
    fn test_host_from_absolute_target_without_host_header() {
        let head = head_of(b"GET http://origin:8080/x HTTP/1.0\r\n\r\n");
        assert_eq!(head.host_including_port().unwrap(), "origin:8080");
    }

    #[test]
    fn test_raw_keeps_body_prefix() {
        let head = head_of(b"POST http://origin/ HTTP/1.1\r\nHost: origin\r\nContent-Length: 4\r\n\r\nbody");
        assert!(head.raw.ends_with(b"body"));
    }

    #[test]
    fn test_malformed_head() {
        let end = find_head_end(b"NONSENSE\r\n\r\n").unwrap();
        assert!(matches!(
            parse_head(b"NONSENSE\r\n\r\n".to_vec(), end),
            Err(ProxyError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_read_head_from_stream() {
        let (client, server) = tokio::io::duplex(256);
        let mut server = server;
        let mut client = client;
        tokio::spawn(async move {
            client
                .write_all(b"GET http://origin/ HTTP/1.1\r\nHost: origin\r\n\r\n")
                .await
                .unwrap();
        });
        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.method, "GET");
    }

    #[tokio::test]
    async fn test_get_and_connect_through_the_full_chain() {
        use crate::config::ConfigStore;
        use crate::keystore::Keystore;
        use crate::proxy::local::{LocalProxy, UpstreamSelector};
        use crate::proxy::remote::RemoteProxy;
        use crate::tls;
        use std::sync::Arc;
        use tokio::net::{TcpListener, TcpStream};

        struct FixedUpstream(String);
        impl UpstreamSelector for FixedUpstream {
            fn select(&self) -> Option<String> {
                Some(self.0.clone())
            }
        }

        // origin that answers any request with a fixed body
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = origin.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = read_request_head(&mut stream).await.unwrap();
                    stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                        .await
                        .unwrap();
                });
            }
        });

        // one keystore plays both peers: its self-signed cert anchors the tree
        let dir = tempfile::TempDir::new().unwrap();
        let config = ConfigStore::open(dir.path()).unwrap();
        let keystore = Arc::new(Keystore::open(dir.path(), true).unwrap());
        let der = keystore.self_signed_certificate_der().unwrap();
        keystore.install_certificate(&der).unwrap();

        let remote = Arc::new(RemoteProxy::new(
            config.clone(),
            keystore.clone(),
            Arc::new(tls::proxy_server_config(&keystore).unwrap()),
        ));
        let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote_listener.local_addr().unwrap();
        tokio::spawn(remote.serve(remote_listener));

        let local = Arc::new(LocalProxy::new(
            config,
            Arc::new(tls::proxy_client_config(&keystore).unwrap()),
            Arc::new(FixedUpstream(remote_addr.to_string())),
        ));
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();
        tokio::spawn(local.serve(local_listener));

        // plain GET through the chain comes back with the origin's body
        let mut browser = TcpStream::connect(local_addr).await.unwrap();
        browser
            .write_all(
                format!(
                    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
                    origin_addr, origin_addr
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        browser.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.ends_with("hi"), "{}", response);

        // CONNECT gets the established line back and then full-duplex bytes
        let mut browser = TcpStream::connect(local_addr).await.unwrap();
        browser
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", origin_addr).as_bytes())
            .await
            .unwrap();
        let mut established = [0u8; 19];
        browser.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.0 200 OK\r\n\r\n");
        browser
            .write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", origin_addr).as_bytes())
            .await
            .unwrap();
        let mut tunneled = Vec::new();
        browser.read_to_end(&mut tunneled).await.unwrap();
        assert!(String::from_utf8_lossy(&tunneled).ends_with("hi"));
    }

    #[tokio::test]
    async fn test_pipe_crosses_bytes() {
        let (a1, a2) = tokio::io::duplex(64);
        let (b1, b2) = tokio::io::duplex(64);
        tokio::spawn(pipe(a2, b1));

        let (mut a1_read, mut a1_write) = tokio::io::split(a1);
        let (mut b2_read, mut b2_write) = tokio::io::split(b2);
        a1_write.write_all(b"ping").await.unwrap();
        a1_write.shutdown().await.unwrap();
        let mut buf = [0u8; 4];
        b2_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b2_write.write_all(b"pong").await.unwrap();
        b2_write.shutdown().await.unwrap();
        let mut buf = [0u8; 4];
        a1_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}

//! Connection relaying between a client and the upstream endpoint
//!
//! Two interchangeable styles behind one seam, picked once at
//! configuration time: a protocol-agnostic raw byte relay, and an
//! HTTP-aware relay that reissues each request over the upstream as a
//! proxy hop. Nothing else in the crate assumes which one is active.

use crate::error::{FleetError, Result};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Upstream connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay buffer size
const CHUNK_SIZE: usize = 8192;

/// Forwarding style used by every forwarder in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Byte-for-byte bidirectional copy; works for any TCP-based
    /// protocol including CONNECT-tunneled TLS
    #[default]
    Raw,
    /// Parses inbound HTTP and reissues it over the upstream as a proxy
    /// hop; smaller per-connection footprint, HTTP only
    Http,
}

impl RelayMode {
    /// Serve one accepted client connection. The upstream connection is
    /// opened with a bounded timeout; on failure the client is dropped
    /// without retrying.
    pub async fn handle_client(self, client: TcpStream, upstream_addr: &str) -> Result<()> {
        let upstream = connect_upstream(upstream_addr).await?;
        match self {
            RelayMode::Raw => relay_raw(client, upstream).await,
            RelayMode::Http => relay_http(client, upstream).await,
        }
    }
}

/// Open the upstream connection with the bounded connect timeout
async fn connect_upstream(addr: &str) -> Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(FleetError::Connect {
            addr: addr.to_string(),
            source: e,
        }),
        Err(_) => Err(FleetError::Timeout(addr.to_string())),
    }
}

/// Raw relay: pump bytes both ways until either side finishes, then
/// close both.
async fn relay_raw(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    tokio::select! {
        _ = pump(client_read, upstream_write) => {}
        _ = pump(upstream_read, client_write) => {}
    }

    Ok(())
}

/// Copy fixed-size chunks from reader to writer until end-of-stream or
/// error, then half-close the write side.
async fn pump(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Relay read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(error = %e, "Relay write ended");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// HTTP-aware relay: one hyper client connection to the upstream proxy
/// serves every request arriving on the client connection.
async fn relay_http(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream))
        .await
        .map_err(|e| FleetError::UpstreamProvider(format!("upstream handshake: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed");
        }
    });

    let sender = Arc::new(Mutex::new(sender));
    let service = service_fn(move |req: Request<Incoming>| {
        let sender = Arc::clone(&sender);
        async move { forward_request(req, sender).await }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(client), service)
        .await
        .map_err(|e| FleetError::Connect {
            addr: "client".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;

    Ok(())
}

async fn forward_request(
    req: Request<Incoming>,
    sender: Arc<Mutex<hyper::client::conn::http1::SendRequest<Incoming>>>,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        return Ok(plain_response(
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT requires raw relay mode",
        ));
    }

    let mut sender = sender.lock().await;
    match sender.send_request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            debug!(error = %e, "Upstream request failed");
            Ok(plain_response(StatusCode::BAD_GATEWAY, "upstream request failed"))
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with static parts")
}

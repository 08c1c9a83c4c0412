//! HTTP proxy inbound handler.
//!
//! Two modes per request:
//! - CONNECT: reply `200 OK`, then tunnel raw bytes through the Ray.
//! - Plain HTTP: rewrite the absolute-form request to origin form, strip
//!   hop-by-hop headers, forward one request and one response, close.
//!
//! Keep-alive is not supported; every forwarded request carries
//! `Connection: close`. The handler surfaces exactly two synthetic
//! responses: 400 when a plain request has no URL host, 503 when the
//! upstream response cannot be parsed. Everything else is a dropped
//! connection and a log line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::{DefaultDispatcher, PacketDispatcher, Space, DISPATCHER_APP_ID, TRANSPORT_APP_ID};
use crate::common::{Address, Destination, Port, SessionInfo};
use crate::error::{Error, Result};
use crate::ray::pump;
use crate::transport::{Connection, ListenOptions, Listener, TransportRegistry};

use super::{InboundHandler, InboundHandlerFactory, InboundHandlerMeta};

/// Request parse buffer.
const REQUEST_BUFFER_SIZE: usize = 2048;

const RESPONSE_200: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
const RESPONSE_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\n";

/// Headers that must not cross a proxy hop.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// Protocol-specific settings of the HTTP inbound. Nothing configurable
/// yet; the read timeout comes from the stream settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpServerSettings {}

// ============================================================================
// Request model
// ============================================================================

/// Target of a request line, decomposed.
#[derive(Debug, Clone, Default)]
struct RequestUrl {
    scheme: String,
    host: String,
    path: String,
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    url: RequestUrl,
    /// Rewritten before forwarding; starts as the Host header value.
    host: String,
    headers: Vec<(String, String)>,
    body: BytesMut,
}

impl HttpRequest {
    fn is_connect(&self) -> bool {
        self.method.to_uppercase() == "CONNECT"
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn parse_target(target: &str) -> RequestUrl {
    for scheme in ["http", "https"] {
        if let Some(rest) = strip_prefix_ignore_case(target, &format!("{}://", scheme)) {
            let (host, path) = match rest.find('/') {
                Some(pos) => (&rest[..pos], &rest[pos..]),
                None => (rest, "/"),
            };
            return RequestUrl {
                scheme: scheme.to_string(),
                host: host.to_string(),
                path: path.to_string(),
            };
        }
    }
    if target.starts_with('/') {
        // origin form: no host information in the target
        return RequestUrl {
            scheme: String::new(),
            host: String::new(),
            path: target.to_string(),
        };
    }
    // authority form (CONNECT)
    RequestUrl {
        scheme: String::new(),
        host: target.to_string(),
        path: String::new(),
    }
}

/// Parse one HTTP/1.x request head from the buffered reader. Returns
/// `None` on a clean end-of-stream before any bytes.
async fn parse_request(reader: &mut BufReader<Connection>) -> Result<Option<HttpRequest>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m.to_string(), t.to_string()),
        _ => {
            return Err(Error::Protocol(format!(
                "invalid request line: {}",
                line.trim()
            )))
        }
    };

    let mut headers = Vec::new();
    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Protocol("unexpected end of headers".into()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Protocol(format!("malformed header: {}", line)));
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((name, value));
    }

    // Body bytes beyond what the request parse already buffered are not
    // pulled in; larger bodies are not forwarded by this handler.
    let buffered = reader.buffer().len();
    let take = content_length.min(buffered);
    let mut body = BytesMut::zeroed(take);
    if take > 0 {
        reader.read_exact(&mut body).await?;
    }

    let url = parse_target(&target);
    let host = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Host"))
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    Ok(Some(HttpRequest {
        method,
        url,
        host,
        headers,
        body,
    }))
}

// ============================================================================
// Destination extraction
// ============================================================================

/// Split `host[:port]`, bracketed IPv6 included. `Ok((host, None))` means
/// the port was missing.
fn split_host_port(raw: &str) -> Result<(&str, Option<Port>)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(raw.to_string()))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Ok((host, None));
        }
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidAddress(raw.to_string()))?;
        let port = port_str
            .parse()
            .map_err(|_| Error::InvalidAddress(raw.to_string()))?;
        return Ok((host, Some(port)));
    }
    match raw.matches(':').count() {
        0 => Ok((raw, None)),
        1 => {
            let (host, port_str) = raw.rsplit_once(':').expect("one colon present");
            let port = port_str
                .parse()
                .map_err(|_| Error::InvalidAddress(raw.to_string()))?;
            Ok((host, Some(port)))
        }
        _ => Err(Error::InvalidAddress(raw.to_string())),
    }
}

/// Parse a proxy host into a destination. A missing port is recovered by
/// falling back to `default_port`; a literal IP host yields an IP address,
/// anything else a domain.
fn parse_host(raw_host: &str, default_port: Port) -> Result<Destination> {
    let (host, port) = split_host_port(raw_host)?;
    Ok(Destination::tcp(
        Address::parse(host),
        port.unwrap_or(default_port),
    ))
}

// ============================================================================
// Header hygiene and serialization
// ============================================================================

/// Remove hop-by-hop headers and force `Connection: close`, deleting any
/// header named by the old `Connection` value's comma tokens.
fn strip_hop_by_hop_headers(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !HOP_BY_HOP_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
    });

    let old_connection = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Connection"))
        .map(|(_, value)| value.clone())
        .unwrap_or_default();
    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("Connection"));

    if !old_connection.is_empty() {
        for token in old_connection.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case(token));
        }
    }

    headers.push(("Connection".to_string(), "close".to_string()));
}

/// Serialize a rewritten request in origin form.
fn serialize_request(request: &HttpRequest) -> BytesMut {
    let path = if request.url.path.is_empty() {
        "/"
    } else {
        &request.url.path
    };
    let mut buf = BytesMut::new();
    buf.extend_from_slice(request.method.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(request.host.as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Host") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&request.body);
    buf
}

/// Read one response head (status line + headers) from the Ray and return
/// it re-serialized. The body is streamed separately.
async fn read_response_head<R>(reader: &mut BufReader<R>) -> Result<BytesMut>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut head = BytesMut::new();
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Protocol("empty upstream response".into()));
    }
    if !line.starts_with("HTTP/") {
        return Err(Error::Protocol(format!(
            "invalid status line: {}",
            line.trim()
        )));
    }
    head.extend_from_slice(line.as_bytes());
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Protocol("unexpected end of response headers".into()));
        }
        head.extend_from_slice(line.as_bytes());
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }
    Ok(head)
}

// ============================================================================
// Server
// ============================================================================

struct ServerContext {
    meta: InboundHandlerMeta,
    dispatcher: Arc<dyn PacketDispatcher>,
}

/// The HTTP proxy inbound handler.
pub struct HttpServer {
    context: Arc<ServerContext>,
    transports: Arc<TransportRegistry>,
    accepting: AtomicBool,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    pub fn new(
        meta: InboundHandlerMeta,
        dispatcher: Arc<dyn PacketDispatcher>,
        transports: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            context: Arc::new(ServerContext { meta, dispatcher }),
            transports,
            accepting: AtomicBool::new(false),
            listener: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bound listen address, once started. Useful when the configured
    /// port is 0.
    pub fn local_addr(&self) -> Option<Destination> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    async fn accept_loop(context: Arc<ServerContext>, listener: Arc<dyn Listener>) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let context = Arc::clone(&context);
                    tokio::spawn(async move {
                        handle_connection(context, conn).await;
                    });
                }
                Err(e) if e.is_lifecycle() => break,
                Err(e) => {
                    warn!("[{}] accept failed: {}", context.meta.tag, e);
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler for HttpServer {
    async fn start(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            return Ok(());
        }
        let listener: Arc<dyn Listener> = Arc::from(
            self.transports
                .listen(
                    self.context.meta.address.clone(),
                    self.context.meta.port,
                    ListenOptions {
                        stream: self.context.meta.stream_settings.clone(),
                    },
                )
                .await?,
        );
        info!(
            "[{}] HTTP proxy listening on {}",
            self.context.meta.tag,
            listener.local_addr()
        );
        let task = tokio::spawn(Self::accept_loop(
            Arc::clone(&self.context),
            Arc::clone(&listener),
        ));
        *self.listener.lock() = Some(listener);
        *self.accept_task.lock() = Some(task);
        self.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn port(&self) -> Port {
        self.context.meta.port
    }

    async fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.close().await;
        }
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ============================================================================
// Session handling
// ============================================================================

async fn handle_connection(context: Arc<ServerContext>, mut conn: Connection) {
    let timeout = context.meta.stream_settings.timeout;
    if timeout > 0 {
        conn.set_read_timeout(Duration::from_secs(timeout as u64));
    }
    let peer = conn.remote_addr().clone();
    let mut reader = BufReader::with_capacity(REQUEST_BUFFER_SIZE, conn);

    let request = match parse_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return, // clean end-of-stream, drop silently
        Err(e) => {
            warn!("[{}] failed to read request: {}", context.meta.tag, e);
            return;
        }
    };
    info!(
        "[{}] request {} {} from {}",
        context.meta.tag,
        request.method,
        if request.is_connect() {
            &request.url.host
        } else {
            &request.url.path
        },
        peer
    );

    let default_port = if request.url.scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    };
    let host = if !request.host.is_empty() {
        request.host.clone()
    } else {
        request.url.host.clone()
    };
    let dest = if request.is_connect() || !request.url.host.is_empty() || !host.is_empty() {
        match parse_host(&host, default_port) {
            Ok(dest) => Some(dest),
            Err(e) => {
                warn!("[{}] malformed proxy host ({}): {}", context.meta.tag, host, e);
                None
            }
        }
    } else {
        None
    };

    if request.is_connect() {
        let Some(dest) = dest else { return };
        let session = SessionInfo::new(peer, dest).with_inbound_tag(context.meta.tag.clone());
        handle_connect(&context, session, reader).await;
    } else {
        handle_plain_http(&context, dest, peer, request, reader).await;
    }
}

async fn handle_connect(
    context: &ServerContext,
    session: SessionInfo,
    mut reader: BufReader<Connection>,
) {
    let conn = reader.get_mut();
    if conn.write_all(RESPONSE_200).await.is_err() {
        return;
    }
    let _ = conn.flush().await;

    let ray = context.dispatcher.dispatch_to_outbound(&context.meta, session);
    let (ray_input, ray_output) = ray.split();
    let (client_read, client_write) = tokio::io::split(reader);

    // Two copy pumps; the session ends when both halves finish.
    tokio::join!(pump(client_read, ray_input), pump(ray_output, client_write));
}

async fn handle_plain_http(
    context: &ServerContext,
    dest: Option<Destination>,
    peer: Destination,
    mut request: HttpRequest,
    reader: BufReader<Connection>,
) {
    let (_client_read, mut client_write) = tokio::io::split(reader);

    if request.url.host.is_empty() {
        let _ = client_write.write_all(RESPONSE_400).await;
        let _ = client_write.flush().await;
        return;
    }
    let Some(dest) = dest else { return };

    request.host = request.url.host.clone();
    strip_hop_by_hop_headers(&mut request.headers);

    let session = SessionInfo::new(peer, dest).with_inbound_tag(context.meta.tag.clone());
    let ray = context.dispatcher.dispatch_to_outbound(&context.meta, session);
    let (mut ray_input, ray_output) = ray.split();

    let tag = context.meta.tag.clone();
    let payload = serialize_request(&request);
    let write_request = async move {
        if let Err(e) = ray_input.write_all(&payload).await {
            warn!("[{}] failed to forward request: {}", tag, e);
            return ray_input;
        }
        let _ = ray_input.flush().await;
        // keep the write end open until the response side is done
        ray_input
    };

    let tag = context.meta.tag.clone();
    let read_response = async move {
        let mut resp_reader = BufReader::new(ray_output);
        match read_response_head(&mut resp_reader).await {
            Ok(head) => {
                if client_write.write_all(&head).await.is_ok() {
                    let _ = tokio::io::copy(&mut resp_reader, &mut client_write).await;
                }
            }
            Err(e) => {
                warn!("[{}] failed to read upstream response: {}", tag, e);
                let _ = client_write.write_all(RESPONSE_503).await;
            }
        }
        let _ = client_write.flush().await;
        let _ = client_write.shutdown().await;
    };

    let (ray_input, ()) = tokio::join!(write_request, read_response);
    drop(ray_input);
}

// ============================================================================
// Factory
// ============================================================================

pub struct HttpServerFactory;

impl InboundHandlerFactory for HttpServerFactory {
    fn create(
        &self,
        space: &Arc<Space>,
        raw_settings: &serde_json::Value,
        meta: InboundHandlerMeta,
    ) -> Result<Arc<dyn InboundHandler>> {
        if !space.has_app(DISPATCHER_APP_ID) {
            return Err(Error::Config("dispatcher app is required".into()));
        }
        let _settings: HttpServerSettings = if raw_settings.is_null() {
            HttpServerSettings::default()
        } else {
            serde_json::from_value(raw_settings.clone())
                .map_err(|e| Error::Config(format!("invalid http settings: {}", e)))?
        };
        let dispatcher = space
            .get_app::<DefaultDispatcher>(DISPATCHER_APP_ID)
            .ok_or_else(|| Error::Config("dispatcher app is required".into()))?;
        let transports = space
            .get_app::<TransportRegistry>(TRANSPORT_APP_ID)
            .ok_or_else(|| Error::Config("transport registry not bound".into()))?;
        Ok(Arc::new(HttpServer::new(meta, dispatcher, transports)))
    }
}

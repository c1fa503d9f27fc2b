//! Engine HTTP/1.1 reverse proxy.
//!
//! Fronts the container engine's socket on a fixed TCP port and unix socket.
//! One upstream connection per inbound client connection, no pooling, and
//! raw-byte body copies, so connection-reuse and close semantics survive the
//! hop. The proxy doubles as the engine machine's power button: a client
//! connection starts the machine, and every in-flight request holds a
//! freezer reference so the machine cannot idle-freeze mid-request.

pub mod http;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::watch;

use warden_shared::{WardenError, WardenResult};

use crate::machine::FreezerHold;

use http::{BodyFraming, RequestHead};

/// Buffered reader/writer size on both legs.
const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Largest request body a filter may buffer.
pub const MAX_FILTER_BODY: u64 = 15 * 1024 * 1024;

pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// The engine machine as the proxy sees it.
#[async_trait::async_trait]
pub trait EngineEndpoint: Send + Sync {
    /// Start the engine machine if it is not running. Synchronous with the
    /// caller; holds its own freezer reference for the duration.
    async fn ensure_started(&self) -> WardenResult<()>;

    /// Fresh connection to the engine's real socket.
    async fn dial(&self) -> WardenResult<Box<dyn ProxyStream>>;

    /// Per-request freezer reference; dropped when the request finishes.
    fn request_hold(&self) -> Option<FreezerHold>;
}

/// Hook point for request rewriting (e.g. bind-mount path translation in
/// create calls). When a filter claims a request via `wants_body`, the proxy
/// buffers the whole body (capped at `MAX_FILTER_BODY`; a claimed request
/// over the cap is an error), hands it to `filter`, and forwards the
/// rewritten bytes with corrected framing. Unclaimed requests stream
/// straight through.
pub trait RequestFilter: Send + Sync {
    /// Requests whose body the filter needs to inspect or rewrite.
    fn wants_body(&self, head: &RequestHead) -> bool;

    /// Rewrite the request before it is forwarded. `body` is present iff
    /// `wants_body` claimed the request and it actually carries a body; the
    /// filter may change its length freely.
    fn filter(&self, head: &mut RequestHead, body: Option<&mut Vec<u8>>) -> WardenResult<()>;
}

pub struct PassthroughFilter;

impl RequestFilter for PassthroughFilter {
    fn wants_body(&self, _head: &RequestHead) -> bool {
        false
    }

    fn filter(&self, _head: &mut RequestHead, _body: Option<&mut Vec<u8>>) -> WardenResult<()> {
        Ok(())
    }
}

pub struct EngineProxy {
    endpoint: Arc<dyn EngineEndpoint>,
    filter: Arc<dyn RequestFilter>,
}

impl EngineProxy {
    pub fn new(endpoint: Arc<dyn EngineEndpoint>, filter: Arc<dyn RequestFilter>) -> Self {
        Self { endpoint, filter }
    }

    /// Accept loop; exits when `early_stop` fires.
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        mut early_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "engine proxy connection");
                        let proxy = Arc::clone(&self);
                        tokio::spawn(async move { proxy.handle_connection(stream).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "engine proxy accept failed");
                    }
                },
                _ = early_stop.changed() => break,
            }
        }
    }

    pub async fn serve_unix(
        self: Arc<Self>,
        listener: tokio::net::UnixListener,
        mut early_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let proxy = Arc::clone(&self);
                        tokio::spawn(async move { proxy.handle_connection(stream).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "engine proxy accept failed");
                    }
                },
                _ = early_stop.changed() => break,
            }
        }
    }

    async fn handle_connection<S: ProxyStream>(&self, client: S) {
        if let Err(e) = serve_connection(&*self.endpoint, &*self.filter, client).await {
            // client-side broken pipe is business as usual
            if !e.to_string().contains("Broken pipe") {
                tracing::warn!(error = %e, "engine proxy connection error");
            }
        }
    }
}

/// Serve one client connection to completion.
pub async fn serve_connection<S: ProxyStream>(
    endpoint: &dyn EngineEndpoint,
    filter: &dyn RequestFilter,
    client: S,
) -> WardenResult<()> {
    let mut client = BufStream::with_capacity(STREAM_BUF_SIZE, STREAM_BUF_SIZE, client);

    // wake the engine and pair this client with one upstream connection
    let setup = async {
        endpoint.ensure_started().await?;
        endpoint.dial().await
    }
    .await;
    let upstream = match setup {
        Ok(upstream) => upstream,
        Err(e) => {
            // nothing has been written yet; the client gets the error
            let _ = write_bad_gateway(&mut client, &e).await;
            return Err(e);
        }
    };
    let mut upstream = BufStream::with_capacity(STREAM_BUF_SIZE, STREAM_BUF_SIZE, upstream);

    loop {
        let Some(mut request) = http::read_request_head(&mut client).await? else {
            return Ok(()); // client finished
        };
        let _hold = endpoint.request_hold();
        let client_wants_close = request.headers.has_token("Connection", "close");

        let result = proxy_one_request(&mut client, &mut upstream, &mut request, filter).await;
        match result {
            Ok(ExchangeEnd::KeepAlive) => {
                if client_wants_close {
                    return Ok(());
                }
            }
            Ok(ExchangeEnd::Close) => return Ok(()),
            Err(ExchangeError::BeforeResponse(e)) => {
                let _ = write_bad_gateway(&mut client, &e).await;
                return Err(e);
            }
            Err(ExchangeError::MidResponse(e)) => {
                // response already under way; nothing sane left to send
                return Err(e);
            }
        }
    }
}

enum ExchangeEnd {
    KeepAlive,
    Close,
}

enum ExchangeError {
    /// No response byte reached the client; a 502 can still be emitted.
    BeforeResponse(WardenError),
    MidResponse(WardenError),
}

async fn proxy_one_request<C, U>(
    client: &mut BufStream<C>,
    upstream: &mut BufStream<U>,
    request: &mut RequestHead,
    filter: &dyn RequestFilter,
) -> Result<ExchangeEnd, ExchangeError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let before = ExchangeError::BeforeResponse;

    let request_framing = http::request_framing(request).map_err(before)?;

    // a filter that claims this request gets the body buffered whole
    let mut buffered = if filter.wants_body(request) {
        match request_framing {
            BodyFraming::ContentLength(n) => Some(
                http::read_body_exact(client, n, MAX_FILTER_BODY)
                    .await
                    .map_err(before)?,
            ),
            BodyFraming::Chunked => Some(
                http::read_chunked_to_end(client, MAX_FILTER_BODY)
                    .await
                    .map_err(before)?,
            ),
            _ => None,
        }
    } else {
        None
    };
    filter.filter(request, buffered.as_mut()).map_err(before)?;

    // request head + body to upstream; a failed write is a hard error, a
    // response to a half-delivered request would not be well-formed
    match buffered {
        Some(body) => {
            // the rewrite may have changed the length; re-frame before
            // forwarding
            request.headers.remove("Transfer-Encoding");
            request
                .headers
                .set("Content-Length", &body.len().to_string());
            http::write_request_head(upstream, request)
                .await
                .map_err(before)?;
            upstream
                .write_all(&body)
                .await
                .map_err(|e| before(WardenError::Proxy(format!("write body: {}", e))))?;
        }
        None => {
            http::write_request_head(upstream, request)
                .await
                .map_err(before)?;
            match request_framing {
                BodyFraming::None => {}
                BodyFraming::ContentLength(n) => http::copy_exact(client, upstream, n)
                    .await
                    .map_err(before)?,
                BodyFraming::Chunked => {
                    http::copy_chunked(client, upstream).await.map_err(before)?
                }
                BodyFraming::UntilClose => {
                    return Err(before(WardenError::Proxy(
                        "request body without framing".into(),
                    )))
                }
            }
        }
    }
    upstream
        .flush()
        .await
        .map_err(|e| before(WardenError::Proxy(format!("flush upstream: {}", e))))?;

    // response head from upstream
    let mut response = http::read_response_head(upstream).await.map_err(before)?;
    let framing = http::response_framing(&request.method, &response).map_err(before)?;

    // a body delimited by EOF cannot keep the connection alive
    if framing == BodyFraming::UntilClose && response.status != 101 {
        response.headers.set("Connection", "close");
    }
    if request.headers.has_token("Connection", "close") {
        response.headers.set("Connection", "close");
    }

    // from here on, errors can no longer be surfaced as a 502
    let mid = ExchangeError::MidResponse;
    http::write_response_head(client, &response)
        .await
        .map_err(mid)?;

    if response.status == 101 {
        // switching protocols: drain buffers, then pump raw bytes both ways
        client
            .flush()
            .await
            .map_err(|e| mid(WardenError::Proxy(format!("flush client: {}", e))))?;
        upstream
            .flush()
            .await
            .map_err(|e| mid(WardenError::Proxy(format!("flush upstream: {}", e))))?;
        let _ = tokio::io::copy_bidirectional(client, upstream).await;
        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;
        return Ok(ExchangeEnd::Close);
    }

    let end = match framing {
        BodyFraming::None => ExchangeEnd::KeepAlive,
        BodyFraming::ContentLength(n) => {
            http::copy_exact(upstream, client, n).await.map_err(mid)?;
            ExchangeEnd::KeepAlive
        }
        BodyFraming::Chunked => {
            http::copy_chunked(upstream, client).await.map_err(mid)?;
            ExchangeEnd::KeepAlive
        }
        BodyFraming::UntilClose => {
            tokio::io::copy(upstream, client)
                .await
                .map_err(|e| mid(WardenError::Proxy(format!("copy body: {}", e))))?;
            ExchangeEnd::Close
        }
    };

    client
        .flush()
        .await
        .map_err(|e| mid(WardenError::Proxy(format!("flush client: {}", e))))?;

    if response.headers.has_token("Connection", "close") {
        return Ok(ExchangeEnd::Close);
    }
    Ok(end)
}

async fn write_bad_gateway<S>(client: &mut BufStream<S>, error: &WardenError) -> WardenResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let body = error.to_string();
    let head = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    client
        .write_all(head.as_bytes())
        .await
        .map_err(|e| WardenError::Proxy(format!("write 502: {}", e)))?;
    client
        .write_all(body.as_bytes())
        .await
        .map_err(|e| WardenError::Proxy(format!("write 502 body: {}", e)))?;
    client
        .flush()
        .await
        .map_err(|e| WardenError::Proxy(format!("flush 502: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Freezer;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Endpoint whose upstream is a scripted in-memory peer.
    struct FakeEndpoint {
        script: tokio::sync::Mutex<Option<DuplexStream>>,
        fail_dial: AtomicBool,
        freezer: Arc<Freezer>,
        holds_taken: AtomicUsize,
    }

    impl FakeEndpoint {
        fn new(upstream: DuplexStream) -> Self {
            Self {
                script: tokio::sync::Mutex::new(Some(upstream)),
                fail_dial: AtomicBool::new(false),
                freezer: Arc::new(Freezer::new()),
                holds_taken: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl EngineEndpoint for FakeEndpoint {
        async fn ensure_started(&self) -> WardenResult<()> {
            Ok(())
        }

        async fn dial(&self) -> WardenResult<Box<dyn ProxyStream>> {
            if self.fail_dial.load(Ordering::SeqCst) {
                return Err(WardenError::Proxy("engine unreachable".into()));
            }
            let stream = self
                .script
                .lock()
                .await
                .take()
                .expect("dial called once per connection");
            Ok(Box::new(stream))
        }

        fn request_hold(&self) -> Option<FreezerHold> {
            self.holds_taken.fetch_add(1, Ordering::SeqCst);
            Some(FreezerHold::acquire(Arc::clone(&self.freezer)))
        }
    }

    /// Upstream that answers each received request head with a canned reply.
    async fn scripted_upstream(stream: DuplexStream, replies: Vec<&'static [u8]>) {
        let mut stream = BufStream::new(stream);
        for reply in replies {
            // consume one request head
            loop {
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            stream.write_all(reply).await.unwrap();
            stream.flush().await.unwrap();
        }
    }

    async fn run_proxy(
        client_side: DuplexStream,
        endpoint: Arc<FakeEndpoint>,
    ) -> tokio::task::JoinHandle<WardenResult<()>> {
        tokio::spawn(async move {
            serve_connection(&*endpoint, &PassthroughFilter, client_side).await
        })
    }

    #[tokio::test]
    async fn test_chunked_get_is_byte_identical_and_reusable() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        const REPLY: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        tokio::spawn(scripted_upstream(upstream_peer, vec![REPLY, REPLY]));

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, Arc::clone(&endpoint)).await;

        let mut client = BufStream::new(client);
        for _ in 0..2 {
            client
                .write_all(b"GET /v1.0/events HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            client.flush().await.unwrap();

            let mut buf = vec![0u8; REPLY.len()];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, REPLY);
        }
        // both requests took a freezer hold, none outstanding
        assert_eq!(endpoint.holds_taken.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.freezer.count(), 0);
    }

    #[tokio::test]
    async fn test_content_length_response_keeps_connection() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        const REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        tokio::spawn(scripted_upstream(upstream_peer, vec![REPLY, REPLY]));

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        for _ in 0..2 {
            client
                .write_all(b"GET /v1.0/info HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            client.flush().await.unwrap();
            let mut buf = vec![0u8; REPLY.len()];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, REPLY);
        }
    }

    #[tokio::test]
    async fn test_head_with_content_length_has_no_body() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        tokio::spawn(scripted_upstream(
            upstream_peer,
            vec![
                b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            ],
        ));

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        client
            .write_all(b"HEAD /v1.0/info HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        // connection stays usable: pipeline a GET and expect its body next
        client
            .write_all(b"GET /v1.0/info HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut buf = Vec::new();
        let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        buf.resize(expected.len(), 0);
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_101_upgrade_pumps_both_directions() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let mut stream = BufStream::new(upstream_peer);
            // consume request head
            loop {
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: tcp\r\n\r\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            // raw echo after the upgrade
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
        });

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        client
            .write_all(b"POST /exec/start HTTP/1.1\r\nHost: x\r\nUpgrade: tcp\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut head = vec![0u8; b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: tcp\r\n\r\n".len()];
        client.read_exact(&mut head).await.unwrap();
        assert!(head.starts_with(b"HTTP/1.1 101"));

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_filter_rewrites_claimed_body() {
        struct CreateRewriter;

        impl RequestFilter for CreateRewriter {
            fn wants_body(&self, head: &RequestHead) -> bool {
                head.method == "POST" && head.target.ends_with("/containers/create")
            }

            fn filter(
                &self,
                _head: &mut RequestHead,
                body: Option<&mut Vec<u8>>,
            ) -> WardenResult<()> {
                if let Some(body) = body {
                    *body = b"{\"binds\":[\"/nfs/root/rw\"]}".to_vec();
                }
                Ok(())
            }
        }

        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        // upstream asserts it sees the rewritten body with matching framing
        tokio::spawn(async move {
            let mut stream = BufStream::new(upstream_peer);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .unwrap();
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(body, b"{\"binds\":[\"/nfs/root/rw\"]}");
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
        });

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = tokio::spawn(async move {
            serve_connection(&*endpoint, &CreateRewriter, proxy_client).await
        });

        let mut client = BufStream::new(client);
        client
            .write_all(
                b"POST /v1.0/containers/create HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}",
            )
            .await
            .unwrap();
        client.flush().await.unwrap();

        let expected = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);
    }

    #[tokio::test]
    async fn test_dial_failure_yields_502() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, _upstream_peer) = tokio::io::duplex(16 * 1024);

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        endpoint.fail_dial.store(true, Ordering::SeqCst);
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("engine unreachable"));
    }

    #[tokio::test]
    async fn test_connection_close_propagates() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        tokio::spawn(scripted_upstream(
            upstream_peer,
            vec![b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"],
        ));

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("ok"));
    }

    #[tokio::test]
    async fn test_until_eof_body_sets_connection_close() {
        let (client, proxy_client) = tokio::io::duplex(16 * 1024);
        let (upstream_proxy, upstream_peer) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let mut stream = BufStream::new(upstream_peer);
            loop {
                let mut line = String::new();
                tokio::io::AsyncBufReadExt::read_line(&mut stream, &mut line)
                    .await
                    .unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            // upstream closes; body is delimited by EOF
        });

        let endpoint = Arc::new(FakeEndpoint::new(upstream_proxy));
        let _task = run_proxy(proxy_client, endpoint).await;

        let mut client = BufStream::new(client);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("streamed"));
    }
}

/*
 * connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HTTP connection: one TCP or TLS stream, drives H1 or H2 parser, invokes ResponseHandler.
//! Supports ALPN (h2 / http/1.1), h2c upgrade, HTTP/2 stream multiplexing and flow control,
//! and Basic/Bearer/Digest/OAuth challenge-response retry on both protocol versions.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TokioTlsStream;

use crate::protocol::http::auth::{
    compute_challenge_response, oauth_refresh_needed, parse_www_authenticate, proactive_authorization,
    Credentials, DigestState,
};
use crate::protocol::http::config::{ClientConfig, PreferredVersion};
use crate::protocol::http::error::HttpError;
use crate::protocol::http::h1::{H1ResponseHandler, ParseState, ResponseParser};
use crate::protocol::http::h2::{
    error_to_string, H2FrameHandler, H2Parser, H2Writer, CONNECTION_PREFACE, ERROR_CANCEL,
    ERROR_COMPRESSION_ERROR, ERROR_REFUSED_STREAM, ERROR_STREAM_CLOSED, MAX_MAX_FRAME_SIZE,
    MIN_MAX_FRAME_SIZE, SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS,
    SETTINGS_MAX_FRAME_SIZE,
};
use crate::protocol::http::hpack::{encode_request_headers, Decoder as HpackDecoder, HeaderHandler};
use crate::protocol::http::request::{Method, RequestBuilder};
use crate::protocol::http::response::Response;
use crate::protocol::http::ResponseHandler;

/// The receive-side window we advertise; we never send a SETTINGS value that changes it,
/// so it stays at the RFC 7540 default for the lifetime of the connection.
const ADVERTISED_WINDOW: i64 = 65535;

/// Negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_1,
    Http2,
}

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
/// Under `#[cfg(test)]` an in-memory duplex pipe stands in for a socket.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(TokioTlsStream<TcpStream>),
    #[cfg(test)]
    Memory(tokio::io::DuplexStream),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(test)]
            HttpStream::Memory(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(test)]
            HttpStream::Memory(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(test)]
            HttpStream::Memory(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(test)]
            HttpStream::Memory(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Bridges H1 parser callbacks to the connection state and, unless `discard` is set
/// (draining a body we're about to replace with an auth retry), the user's handler.
struct H1Driver<'a> {
    h1_status: &'a mut Option<(u16, Option<String>)>,
    h1_headers: &'a mut Vec<(String, String)>,
    handler: &'a mut (dyn ResponseHandler + Send),
    discard: bool,
}

impl H1ResponseHandler for H1Driver<'_> {
    fn status(&mut self, code: u16, reason: Option<&str>) {
        *self.h1_status = Some((code, reason.map(|s| s.to_string())));
    }

    fn header(&mut self, name: &str, value: &str) {
        self.h1_headers.push((name.to_string(), value.to_string()));
    }

    fn start_body(&mut self) {
        if !self.discard {
            self.handler.start_body();
        }
    }

    fn body_chunk(&mut self, data: &[u8]) {
        if !self.discard {
            self.handler.body_chunk(data);
        }
    }

    fn end_body(&mut self) {
        if !self.discard {
            self.handler.end_body();
        }
    }

    fn trailer(&mut self, name: &str, value: &str) {
        if !self.discard {
            self.handler.header(name, value);
        }
    }

    fn complete(&mut self) {
        if !self.discard {
            self.handler.complete();
        }
    }
}

/// Outcome of reading one HTTP/1.1 response.
enum H1Outcome {
    Completed,
    Upgraded,
    Retry(RequestBuilder, Box<dyn ResponseHandler + Send>),
}

/// Which framing an HTTP/1.1 connection is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnMode {
    Http1,
    H2cUpgradePending,
    Http2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H2cUpgradeState {
    NotAttempted,
    InFlight,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    HalfClosedLocal,
    Closed,
    Reset,
}

/// Per-stream bookkeeping for an HTTP/2 request in flight.
struct StreamEntry {
    handler: Box<dyn ResponseHandler + Send>,
    method: Method,
    original: RequestBuilder,
    state: StreamState,
    auth_retried: bool,
    body_started: bool,
    discarding_for_auth_retry: bool,
    pending_retry_request: Option<RequestBuilder>,
    /// Set when `pending_retry_request` needs an OAuth token refresh before it can be
    /// resubmitted, rather than already carrying a computed Authorization header.
    pending_retry_needs_oauth_refresh: bool,
    send_window: i64,
    recv_window: i64,
}

impl StreamEntry {
    fn new(
        handler: Box<dyn ResponseHandler + Send>,
        method: Method,
        original: RequestBuilder,
        send_window: i64,
    ) -> Self {
        Self {
            handler,
            method,
            original,
            state: StreamState::Open,
            auth_retried: false,
            body_started: false,
            discarding_for_auth_retry: false,
            pending_retry_request: None,
            pending_retry_needs_oauth_refresh: false,
            send_window,
            recv_window: ADVERTISED_WINDOW,
        }
    }
}

/// Peer's last-announced SETTINGS values (defaults per RFC 7540 6.5.2 until changed).
#[derive(Debug, Clone)]
struct PeerSettings {
    header_table_size: usize,
    max_concurrent_streams: Option<u32>,
    initial_window_size: i64,
    max_frame_size: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_concurrent_streams: None,
            initial_window_size: ADVERTISED_WINDOW,
            max_frame_size: crate::protocol::http::h2::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Opaque handle to an in-flight HTTP/2 request, returned by `submit()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    id: u32,
}

fn parse_content_length(headers: &[(String, String)]) -> io::Result<Option<u64>> {
    match headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        None => Ok(None),
        Some((_, v)) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length header")),
    }
}

fn h2c_settings_header() -> String {
    // SETTINGS_ENABLE_PUSH (0x0002) = 0
    let payload: [u8; 6] = [0x00, 0x02, 0x00, 0x00, 0x00, 0x00];
    URL_SAFE_NO_PAD.encode(payload)
}

/// HTTP connection: holds stream, version, and drives read loop.
///
/// HTTP/1.1 requests go through `send()`, which owns the whole request/response
/// cycle (only one request is ever in flight on an HTTP/1.1 connection). HTTP/2
/// requests can be issued with `submit()` (returns immediately after the request
/// is written) and driven to completion with `drive_until()`, or simply sent with
/// `send()`, which does both in one call.
pub struct HttpConnection {
    stream: HttpStream,
    host: String,
    port: u16,
    secure: bool,
    version: HttpVersion,
    open: bool,
    config: ClientConfig,
    credentials: Option<Credentials>,
    digest_state: DigestState,

    read_buf: BytesMut,

    // HTTP/1.1 state
    h1_parser: ResponseParser,
    h1_status: Option<(u16, Option<String>)>,
    h1_headers: Vec<(String, String)>,
    h1_persistent: bool,

    mode: ConnMode,
    h2c_upgrade: H2cUpgradeState,

    // HTTP/2 state
    h2_parser: H2Parser,
    h2_writer: H2Writer,
    hpack_decoder: HpackDecoder,
    next_stream_id: u32,
    active_streams: HashMap<u32, StreamEntry>,
    /// Maps a stream id a caller still references to the id it now lives under
    /// (set when an auth retry re-submits a request under a fresh stream id).
    stream_aliases: HashMap<u32, u32>,
    h2_header_block: Option<BytesMut>,
    h2_header_stream_id: u32,
    h2_header_end_stream: bool,
    peer_settings: PeerSettings,
    conn_send_window: i64,
    conn_recv_window: i64,
    goaway_received: Option<u32>,
    /// Set synchronously from an H2FrameHandler callback when a stream needs to be
    /// re-submitted under a new id (auth retry); drained by the async driving loop,
    /// since frame callbacks cannot themselves perform the async submit.
    pending_h2_retry: Option<(u32, RequestBuilder, Box<dyn ResponseHandler + Send>)>,
    /// Same idea as `pending_h2_retry`, but for a challenge that first needs an
    /// async OAuth token refresh before the retry's Authorization header can be
    /// built; drained and resolved by `drain_pending_h2_retry`.
    pending_h2_oauth_refresh: Option<(u32, RequestBuilder, Box<dyn ResponseHandler + Send>)>,
}

impl HttpConnection {
    /// Create from an already-connected stream and negotiated version. Used by HttpClient.
    pub fn new(
        stream: HttpStream,
        host: String,
        port: u16,
        secure: bool,
        version: HttpVersion,
        config: ClientConfig,
    ) -> Self {
        let credentials = config.credentials.clone();
        let mode = if version == HttpVersion::Http2 {
            ConnMode::H2cUpgradePending
        } else {
            ConnMode::Http1
        };
        Self {
            stream,
            host,
            port,
            secure,
            version,
            open: true,
            config,
            credentials,
            digest_state: DigestState::new(),
            read_buf: BytesMut::with_capacity(8192),
            h1_parser: ResponseParser::new(),
            h1_status: None,
            h1_headers: Vec::new(),
            h1_persistent: true,
            mode,
            h2c_upgrade: H2cUpgradeState::NotAttempted,
            h2_parser: H2Parser::new(),
            h2_writer: H2Writer::new(),
            hpack_decoder: HpackDecoder::new(4096),
            next_stream_id: 1,
            active_streams: HashMap::new(),
            stream_aliases: HashMap::new(),
            h2_header_block: None,
            h2_header_stream_id: 0,
            h2_header_end_stream: false,
            peer_settings: PeerSettings::default(),
            conn_send_window: ADVERTISED_WINDOW,
            conn_recv_window: ADVERTISED_WINDOW,
            goaway_received: None,
            pending_h2_retry: None,
            pending_h2_oauth_refresh: None,
        }
    }

    /// Write the HTTP/2 connection preface and an initial empty SETTINGS frame.
    /// Must be called once, before any request, on a connection established either
    /// by ALPN negotiating "h2" or by prior-knowledge cleartext HTTP/2.
    ///
    /// Unlike the h2c-upgrade path (where the connection must wait for the 101
    /// response before it even knows the upgrade was accepted), a direct HTTP/2
    /// connection already speaks the framed protocol from the first byte: per
    /// RFC 7540 3.5 the client may send HEADERS/DATA immediately after its own
    /// preface and SETTINGS, without waiting for the server's SETTINGS frame.
    /// So `mode` goes straight to `Http2`, ready for `send()`/`submit()`; the
    /// peer's real settings (window size, frame size, ...) are applied in
    /// `settings_frame_received` whenever that frame actually arrives.
    pub async fn start_http2(&mut self) -> io::Result<()> {
        self.stream.write_all(CONNECTION_PREFACE).await?;
        self.h2_writer.write_settings(&[]).ok();
        self.flush_h2_writer().await?;
        self.mode = ConnMode::Http2;
        Ok(())
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build a request (method, path). Use send() or submit() to execute it.
    pub fn request(&mut self, method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path.into())
    }

    fn authority_header(&self) -> String {
        if (self.secure && self.port != 443) || (!self.secure && self.port != 80) {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }

    fn apply_proactive_auth(&self, request: &mut RequestBuilder) {
        if request.has_header("Authorization") {
            return;
        }
        if let Some(creds) = &self.credentials {
            if let Some(value) = proactive_authorization(creds) {
                request.set_header("Authorization", value);
            }
        }
    }

    /// Send the request and run until the response is complete. For HTTP/1.1 this
    /// owns the whole request/response cycle; for HTTP/2 it submits a new stream
    /// and drives the connection until that stream resolves.
    pub async fn send(
        &mut self,
        request: RequestBuilder,
        handler: impl ResponseHandler + Send + 'static,
    ) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"));
        }
        let handler: Box<dyn ResponseHandler + Send> = Box::new(handler);
        match self.mode {
            ConnMode::Http1 => self.send_http1(request, handler).await,
            ConnMode::H2cUpgradePending => Err(io::Error::new(
                io::ErrorKind::Other,
                "h2c upgrade is still in progress; cannot submit a new request yet",
            )),
            ConnMode::Http2 => {
                if let Some(last) = self.goaway_received {
                    return Err(HttpError::ServerShutdown { last_stream_id: last }.into());
                }
                let handle = self.submit_http2(request, handler).await?;
                self.drive_until(handle).await
            }
        }
    }

    /// Submit a request over an already-established HTTP/2 connection without
    /// blocking for the response. Drive it to completion with `drive_until()`.
    pub async fn submit(
        &mut self,
        request: RequestBuilder,
        handler: impl ResponseHandler + Send + 'static,
    ) -> io::Result<StreamHandle> {
        if self.mode != ConnMode::Http2 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "submit() requires an established HTTP/2 connection; use send() for HTTP/1.1",
            ));
        }
        self.submit_http2(request, Box::new(handler)).await
    }

    /// Cancel an in-flight HTTP/2 request: sends RST_STREAM and fails the handler.
    pub fn cancel(&mut self, handle: StreamHandle) {
        let resolved = self.resolve_alias(handle.id);
        if let Some(mut entry) = self.active_streams.remove(&resolved) {
            if self.mode != ConnMode::Http1 {
                let _ = self.h2_writer.write_rst_stream(resolved, ERROR_CANCEL);
            }
            let err: io::Error = HttpError::Cancelled.into();
            entry.handler.failed(&err);
        }
    }

    /// Close the connection, failing any in-flight requests. The underlying
    /// socket is left for the caller (or this value's drop) to tear down.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.fail_all_streams(HttpError::Transport("connection closed by caller".into()));
    }

    // ---------------------------------------------------------------- HTTP/1.1

    fn maybe_apply_h2c_upgrade_headers(&mut self, request: &mut RequestBuilder) -> bool {
        if self.secure || !self.config.h2c_upgrade_enabled || self.config.h2_with_prior_knowledge {
            return false;
        }
        if self.h2c_upgrade != H2cUpgradeState::NotAttempted {
            return false;
        }
        self.h2c_upgrade = H2cUpgradeState::InFlight;
        request.set_header("Connection", "Upgrade, HTTP2-Settings");
        request.set_header("Upgrade", "h2c");
        request.set_header("HTTP2-Settings", h2c_settings_header());
        true
    }

    async fn send_http1(
        &mut self,
        mut request: RequestBuilder,
        mut handler: Box<dyn ResponseHandler + Send>,
    ) -> io::Result<()> {
        let mut already_retried = false;
        loop {
            self.apply_proactive_auth(&mut request);
            let attempted_h2c = self.maybe_apply_h2c_upgrade_headers(&mut request);

            self.h1_parser.reset();
            self.h1_status = None;
            self.h1_headers.clear();
            self.write_http1_request(&request).await?;

            match self
                .read_http1_response(&request, handler, attempted_h2c, already_retried)
                .await?
            {
                H1Outcome::Completed => {
                    if !self.h1_persistent {
                        self.open = false;
                    }
                    return Ok(());
                }
                H1Outcome::Upgraded => {
                    return self.drive_until(StreamHandle { id: 1 }).await;
                }
                H1Outcome::Retry(retry_request, returned_handler) => {
                    if self.h2c_upgrade == H2cUpgradeState::InFlight {
                        self.h2c_upgrade = H2cUpgradeState::Declined;
                    }
                    request = retry_request;
                    handler = returned_handler;
                    already_retried = true;
                    continue;
                }
            }
        }
    }

    /// Compute the Authorization header value for a 401/407 retry, if one of our
    /// credentials can satisfy the challenge. Falls back to an OAuth token refresh
    /// (via the caller-supplied `OAuthRefresh` callback) when the challenge is a
    /// Bearer `invalid_token`/`expired` and we hold a refresh token.
    async fn compute_auth_retry(
        &mut self,
        original: &RequestBuilder,
        headers: &[(String, String)],
    ) -> io::Result<Option<String>> {
        let creds = match self.credentials.clone() {
            Some(c) => c,
            None => return Ok(None),
        };
        let challenge_value = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("www-authenticate") || k.eq_ignore_ascii_case("proxy-authenticate"))
            .map(|(_, v)| v.clone());
        let challenge = match challenge_value.as_deref().and_then(parse_www_authenticate) {
            Some(c) => c,
            None => return Ok(None),
        };
        if let Some(value) = compute_challenge_response(
            &creds,
            &mut self.digest_state,
            original.method.as_str(),
            &original.path,
            &challenge,
        ) {
            return Ok(Some(value));
        }
        if oauth_refresh_needed(&creds, &challenge, self.config.oauth_refresh.is_some()) {
            return self.refresh_oauth_and_build_header(&creds).await;
        }
        Ok(None)
    }

    /// Invoke the configured `OAuthRefresh` callback with the credentials' refresh
    /// token, store the new access/refresh tokens, and return the new `Authorization`
    /// header value. Returns `Ok(None)` if `credentials` isn't OAuth with a refresh
    /// token or no callback is configured (callers should treat that the same as an
    /// unsatisfiable challenge).
    async fn refresh_oauth_and_build_header(&mut self, credentials: &Credentials) -> io::Result<Option<String>> {
        let refresh_token = match credentials {
            Credentials::OAuth { refresh_token: Some(t), .. } => t.clone(),
            _ => return Ok(None),
        };
        let refresher = match self.config.oauth_refresh.clone() {
            Some(r) => r,
            None => return Ok(None),
        };
        let (access_token, new_refresh_token) = refresher.refresh(&refresh_token).await.map_err(io::Error::from)?;
        self.credentials = Some(Credentials::OAuth {
            access_token: access_token.clone(),
            refresh_token: new_refresh_token.or(Some(refresh_token)),
        });
        Ok(Some(format!("Bearer {}", access_token)))
    }

    async fn read_http1_response(
        &mut self,
        original: &RequestBuilder,
        mut handler: Box<dyn ResponseHandler + Send>,
        attempted_h2c: bool,
        already_retried: bool,
    ) -> io::Result<H1Outcome> {
        let mut discard = false;
        let mut pending_retry_header: Option<String> = None;

        loop {
            {
                let mut driver = H1Driver {
                    h1_status: &mut self.h1_status,
                    h1_headers: &mut self.h1_headers,
                    handler: handler.as_mut(),
                    discard,
                };
                self.h1_parser.receive(&mut self.read_buf, &mut driver)?;
            }

            if self.h1_parser.state() == ParseState::HeadersComplete {
                let (code, reason) = self.h1_status.take().unwrap_or((0, None));
                let headers = mem::take(&mut self.h1_headers);

                if code == 101 && attempted_h2c {
                    let accepted = headers
                        .iter()
                        .any(|(k, v)| k.eq_ignore_ascii_case("upgrade") && v.eq_ignore_ascii_case("h2c"));
                    if accepted {
                        self.begin_h2_after_upgrade(original.clone(), handler).await?;
                        return Ok(H1Outcome::Upgraded);
                    }
                    eprintln!("[http] 101 Switching Protocols did not accept h2c; continuing as HTTP/1.1");
                    self.h1_parser.reset();
                    continue;
                }

                if (100..200).contains(&code) {
                    self.h1_parser.reset();
                    continue;
                }

                let content_length = parse_content_length(&headers)?;
                let chunked = headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));
                let no_body_status = matches!(code, 204 | 304);
                let is_head = original.method == Method::Head;

                if !already_retried && (code == 401 || code == 407) && self.credentials.is_some() {
                    if let Some(value) = self.compute_auth_retry(original, &headers).await? {
                        discard = true;
                        self.h1_parser.set_body_mode(
                            if no_body_status || is_head { Some(0) } else { content_length },
                            !no_body_status && !is_head && chunked,
                        );
                        if self.h1_parser.state() == ParseState::Idle {
                            let mut retry = original.clone();
                            retry.set_header("Authorization", value);
                            return Ok(H1Outcome::Retry(retry, handler));
                        }
                        pending_retry_header = Some(value);
                        continue;
                    }
                }

                let explicit_close = headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.to_ascii_lowercase().contains("close"));
                let explicit_keepalive = headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.to_ascii_lowercase().contains("keep-alive"));
                self.h1_persistent = if self.config.preferred_version == PreferredVersion::Http10 {
                    explicit_keepalive
                } else {
                    !explicit_close
                };

                let response = match reason {
                    Some(r) => Response::with_reason(code, r),
                    None => Response::new(code),
                };
                if (200..300).contains(&code) {
                    handler.ok(response);
                } else {
                    handler.error(response);
                }
                for (name, value) in &headers {
                    handler.header(name, value);
                }

                let has_body = !no_body_status
                    && !is_head
                    && (chunked || content_length.map(|cl| cl > 0).unwrap_or(true));
                self.h1_parser.set_body_mode(
                    if no_body_status || is_head { Some(0) } else { content_length },
                    !no_body_status && !is_head && chunked,
                );
                if self.h1_parser.state() == ParseState::Idle {
                    // set_body_mode resolved straight to Idle (no body to read): the
                    // parser only emits end_body/complete from within receive(), so
                    // we dispatch completion here ourselves.
                    handler.complete();
                } else if has_body {
                    handler.start_body();
                }
            }

            if self.h1_parser.state() == ParseState::Idle {
                if discard {
                    if let Some(value) = pending_retry_header.take() {
                        let mut retry = original.clone();
                        retry.set_header("Authorization", value);
                        return Ok(H1Outcome::Retry(retry, handler));
                    }
                }
                return Ok(H1Outcome::Completed);
            }

            let mut tmp = [0u8; 8192];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                self.open = false;
                if self.h1_parser.is_reading_until_close() {
                    self.h1_parser.finish_read_until_close();
                    if discard {
                        // The body we were draining belonged to the challenge response, not
                        // the retried request; there is no live connection left to retry on.
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed while draining response body for auth retry",
                        ));
                    }
                    self.h1_persistent = false;
                    handler.end_body();
                    handler.complete();
                    return Ok(H1Outcome::Completed);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "HTTP connection closed"));
            }
            self.read_buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn begin_h2_after_upgrade(
        &mut self,
        original: RequestBuilder,
        handler: Box<dyn ResponseHandler + Send>,
    ) -> io::Result<()> {
        self.h2c_upgrade = H2cUpgradeState::Accepted;
        self.mode = ConnMode::H2cUpgradePending;
        self.version = HttpVersion::Http2;
        self.next_stream_id = 3;
        self.active_streams.insert(
            1,
            StreamEntry::new(handler, original.method, original, self.peer_settings.initial_window_size),
        );
        self.stream.write_all(CONNECTION_PREFACE).await?;
        self.h2_writer.write_settings(&[]).ok();
        self.flush_h2_writer().await?;
        Ok(())
    }

    async fn write_http1_request(&mut self, request: &RequestBuilder) -> io::Result<()> {
        let host_header = self.authority_header();
        let use_chunked = request.body.is_some()
            && !request.has_header("Content-Length")
            && !request.has_header("Transfer-Encoding");
        let http_version = if self.config.preferred_version == PreferredVersion::Http10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };
        let attempting_upgrade = request.has_header("Upgrade");

        let mut req = format!(
            "{} {} {}\r\nHost: {}\r\n",
            request.method.as_str(),
            request.path,
            http_version,
            host_header
        );
        for (k, v) in &request.headers {
            req.push_str(k);
            req.push_str(": ");
            req.push_str(v);
            req.push_str("\r\n");
        }
        if !request.has_header("Connection") && !attempting_upgrade {
            req.push_str("Connection: keep-alive\r\n");
        }
        if use_chunked {
            req.push_str("Transfer-Encoding: chunked\r\n");
        }
        req.push_str("\r\n");
        self.stream.write_all(req.as_bytes()).await?;
        if let Some(body) = &request.body {
            if use_chunked {
                let hex_len = format!("{:x}\r\n", body.len());
                self.stream.write_all(hex_len.as_bytes()).await?;
                self.stream.write_all(body).await?;
                self.stream.write_all(b"\r\n").await?;
                self.stream.write_all(b"0\r\n\r\n").await?;
            } else {
                self.stream.write_all(body).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------ HTTP/2

    async fn submit_http2(
        &mut self,
        mut request: RequestBuilder,
        handler: Box<dyn ResponseHandler + Send>,
    ) -> io::Result<StreamHandle> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"));
        }
        if let Some(last) = self.goaway_received {
            return Err(HttpError::ServerShutdown { last_stream_id: last }.into());
        }
        self.apply_proactive_auth(&mut request);
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        let send_window = self.peer_settings.initial_window_size;
        self.active_streams.insert(
            stream_id,
            StreamEntry::new(handler, request.method, request.clone(), send_window),
        );
        self.write_http2_request(stream_id, &request).await?;
        Ok(StreamHandle { id: stream_id })
    }

    async fn write_http2_request(&mut self, stream_id: u32, request: &RequestBuilder) -> io::Result<()> {
        let authority = self.authority_header();
        let mut pairs: Vec<(String, String)> = Vec::with_capacity(request.headers.len() + 4);
        pairs.push((":method".to_string(), request.method.as_str().to_string()));
        pairs.push((":scheme".to_string(), if self.secure { "https".to_string() } else { "http".to_string() }));
        pairs.push((":authority".to_string(), authority));
        pairs.push((":path".to_string(), request.path.clone()));
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            if matches!(lower.as_str(), "connection" | "transfer-encoding" | "upgrade" | "host" | "http2-settings") {
                continue;
            }
            pairs.push((lower, value.clone()));
        }
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let mut block = BytesMut::new();
        encode_request_headers(&refs, &mut block)?;

        let has_body = request.body.is_some();
        let end_stream_on_headers = !has_body;
        let max_frame = self.peer_settings.max_frame_size;

        if block.len() <= max_frame {
            self.h2_writer.write_headers(stream_id, &block, end_stream_on_headers, true)?;
        } else {
            let (first, mut remaining) = block.split_at(max_frame);
            self.h2_writer.write_headers(stream_id, first, end_stream_on_headers, false)?;
            while remaining.len() > max_frame {
                let (chunk, rest) = remaining.split_at(max_frame);
                self.h2_writer.write_continuation(stream_id, chunk, false)?;
                remaining = rest;
            }
            self.h2_writer.write_continuation(stream_id, remaining, true)?;
        }
        self.flush_h2_writer().await?;

        if let Some(body) = request.body.clone() {
            self.write_h2_body(stream_id, &body).await?;
        }
        Ok(())
    }

    async fn write_h2_body(&mut self, stream_id: u32, body: &[u8]) -> io::Result<()> {
        if body.is_empty() {
            self.h2_writer.write_data(stream_id, &[], true)?;
            self.flush_h2_writer().await?;
            return Ok(());
        }
        let mut offset = 0;
        while offset < body.len() {
            loop {
                if !self.active_streams.contains_key(&stream_id) {
                    return Err(io::Error::new(io::ErrorKind::Other, "stream closed while writing body"));
                }
                let conn_ok = self.conn_send_window > 0;
                let stream_ok = self.active_streams.get(&stream_id).map(|e| e.send_window > 0).unwrap_or(false);
                if conn_ok && stream_ok {
                    break;
                }
                self.pump_for_window_credit().await?;
            }
            let max_frame = self.peer_settings.max_frame_size;
            let stream_window = self.active_streams.get(&stream_id).map(|e| e.send_window).unwrap_or(0).max(0) as usize;
            let conn_window = self.conn_send_window.max(0) as usize;
            let allowed = max_frame.min(conn_window).min(stream_window).max(1);
            let chunk_len = allowed.min(body.len() - offset);
            let end_stream = offset + chunk_len >= body.len();
            self.h2_writer.write_data(stream_id, &body[offset..offset + chunk_len], end_stream)?;
            self.conn_send_window -= chunk_len as i64;
            if let Some(entry) = self.active_streams.get_mut(&stream_id) {
                entry.send_window -= chunk_len as i64;
            }
            self.flush_h2_writer().await?;
            offset += chunk_len;
        }
        Ok(())
    }

    async fn pump_for_window_credit(&mut self) -> io::Result<()> {
        let mut tmp = [0u8; 8192];
        let n = self.stream.read(&mut tmp).await?;
        if n == 0 {
            self.open = false;
            self.fail_all_streams(HttpError::Transport("connection closed while waiting for flow-control credit".into()));
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
        }
        self.read_buf.extend_from_slice(&tmp[..n]);
        self.pump_h2()?;
        self.flush_h2_writer().await?;
        self.drain_pending_h2_retry().await?;
        Ok(())
    }

    async fn drain_pending_h2_retry(&mut self) -> io::Result<()> {
        if let Some((old_id, retry_request, handler)) = self.pending_h2_retry.take() {
            let handle = self.submit_http2(retry_request, handler).await?;
            self.stream_aliases.insert(old_id, handle.id);
        }
        if let Some((old_id, mut retry_request, mut handler)) = self.pending_h2_oauth_refresh.take() {
            let creds = self.credentials.clone();
            let refreshed = match creds {
                Some(creds) => self.refresh_oauth_and_build_header(&creds).await,
                None => Ok(None),
            };
            match refreshed {
                Ok(Some(value)) => {
                    retry_request.set_header("Authorization", value);
                    let handle = self.submit_http2(retry_request, handler).await?;
                    self.stream_aliases.insert(old_id, handle.id);
                }
                Ok(None) => {
                    let err = io::Error::from(HttpError::AuthenticationFailed(
                        "OAuth token refresh unavailable for invalid_token/expired challenge".into(),
                    ));
                    handler.failed(&err);
                }
                Err(err) => {
                    handler.failed(&err);
                }
            }
        }
        Ok(())
    }

    /// Read and process frames until the stream `handle` refers to (following any
    /// auth-retry alias) is no longer active.
    pub async fn drive_until(&mut self, handle: StreamHandle) -> io::Result<()> {
        loop {
            let resolved = self.resolve_alias(handle.id);
            if !self.active_streams.contains_key(&resolved) {
                return Ok(());
            }
            let mut tmp = [0u8; 8192];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                self.open = false;
                self.fail_all_streams(HttpError::Transport("connection closed".into()));
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "HTTP connection closed"));
            }
            self.read_buf.extend_from_slice(&tmp[..n]);
            self.pump_h2()?;
            self.flush_h2_writer().await?;
            self.drain_pending_h2_retry().await?;
        }
    }

    /// Feed `read_buf` through the H2 parser, dispatching callbacks to `self`.
    /// Uses `mem::take` so `self` can be passed to `H2FrameHandler` methods while
    /// the parser and buffer it reads from are also fields of `self`.
    fn pump_h2(&mut self) -> io::Result<()> {
        let mut parser = mem::take(&mut self.h2_parser);
        let mut buf = mem::take(&mut self.read_buf);
        let result = parser.receive(&mut buf, self);
        self.h2_parser = parser;
        self.read_buf = buf;
        result
    }

    async fn flush_h2_writer(&mut self) -> io::Result<()> {
        if self.h2_writer.is_empty() {
            return Ok(());
        }
        let bytes = self.h2_writer.take_buffer();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn resolve_alias(&self, id: u32) -> u32 {
        let mut current = id;
        while let Some(&next) = self.stream_aliases.get(&current) {
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn highest_known_stream_id(&self) -> u32 {
        self.active_streams.keys().copied().max().unwrap_or(0)
    }

    fn fail_all_streams(&mut self, cause: HttpError) {
        let message = cause.to_string();
        let io_err: io::Error = cause.into();
        let kind = io_err.kind();
        for (_, mut entry) in self.active_streams.drain() {
            let err = io::Error::new(kind, message.clone());
            entry.handler.failed(&err);
        }
    }

    /// Decode an accumulated header block (HEADERS + any CONTINUATIONs) and
    /// dispatch it, intercepting 401/407 for a possible auth retry.
    fn process_header_block(&mut self) {
        let stream_id = self.h2_header_stream_id;
        let end_stream = self.h2_header_end_stream;
        let block = match self.h2_header_block.take() {
            Some(b) => b,
            None => return,
        };
        let resolved = self.resolve_alias(stream_id);

        struct Collect(Vec<(String, String)>);
        impl HeaderHandler for Collect {
            fn header(&mut self, name: &str, value: &str) {
                self.0.push((name.to_string(), value.to_string()));
            }
        }
        let mut collector = Collect(Vec::new());
        let mut cursor = &block[..];
        if self.hpack_decoder.decode(&mut cursor, &mut collector).is_err() {
            eprintln!("[http] HPACK decode error on stream {}; closing connection", resolved);
            let last = self.highest_known_stream_id();
            let _ = self.h2_writer.write_goaway(last, ERROR_COMPRESSION_ERROR, b"HPACK decode error");
            self.open = false;
            self.fail_all_streams(HttpError::Protocol("HPACK decode error".into()));
            return;
        }
        let headers = collector.0;

        if !self.active_streams.contains_key(&resolved) {
            return;
        }

        let status: u16 = headers
            .iter()
            .find(|(k, _)| k == ":status")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);

        let already_retried = self.active_streams.get(&resolved).map(|e| e.auth_retried).unwrap_or(true);
        let mut retry_header = None;
        let mut needs_oauth_refresh = false;
        if (status == 401 || status == 407) && !already_retried {
            if let Some(creds) = self.credentials.clone() {
                if let Some((_, value)) = headers.iter().find(|(k, _)| {
                    k.eq_ignore_ascii_case("www-authenticate") || k.eq_ignore_ascii_case("proxy-authenticate")
                }) {
                    if let Some(challenge) = parse_www_authenticate(value) {
                        let (method_str, path) = {
                            let entry = self.active_streams.get(&resolved).unwrap();
                            (entry.method.as_str(), entry.original.path.clone())
                        };
                        retry_header =
                            compute_challenge_response(&creds, &mut self.digest_state, method_str, &path, &challenge);
                        if retry_header.is_none()
                            && oauth_refresh_needed(&creds, &challenge, self.config.oauth_refresh.is_some())
                        {
                            needs_oauth_refresh = true;
                        }
                    }
                }
            }
        }

        let entry = self.active_streams.get_mut(&resolved).unwrap();
        if let Some(value) = retry_header {
            entry.auth_retried = true;
            entry.discarding_for_auth_retry = true;
            let mut retry_request = entry.original.clone();
            retry_request.set_header("Authorization", value);
            entry.pending_retry_request = Some(retry_request);
            if end_stream {
                let entry = self.active_streams.remove(&resolved).unwrap();
                if let Some(retry_request) = entry.pending_retry_request {
                    self.pending_h2_retry = Some((resolved, retry_request, entry.handler));
                }
            }
            return;
        }
        if needs_oauth_refresh {
            entry.auth_retried = true;
            entry.discarding_for_auth_retry = true;
            entry.pending_retry_needs_oauth_refresh = true;
            entry.pending_retry_request = Some(entry.original.clone());
            if end_stream {
                let entry = self.active_streams.remove(&resolved).unwrap();
                if let Some(retry_request) = entry.pending_retry_request {
                    self.pending_h2_oauth_refresh = Some((resolved, retry_request, entry.handler));
                }
            }
            return;
        }

        let response = Response::new(status);
        if (200..300).contains(&status) {
            entry.handler.ok(response);
        } else {
            entry.handler.error(response);
        }
        for (name, value) in &headers {
            if !name.starts_with(':') {
                entry.handler.header(name, value);
            }
        }
        if end_stream {
            entry.handler.complete();
            self.active_streams.remove(&resolved);
        } else {
            entry.body_started = true;
            entry.handler.start_body();
        }
    }
}

impl H2FrameHandler for HttpConnection {
    fn data_frame_received(&mut self, stream_id: u32, end_stream: bool, data: Bytes) {
        let len = data.len() as i64;
        self.conn_recv_window -= len;
        if self.conn_recv_window <= ADVERTISED_WINDOW / 2 {
            let increment = (ADVERTISED_WINDOW - self.conn_recv_window) as u32;
            if self.h2_writer.write_window_update(0, increment).is_ok() {
                self.conn_recv_window = ADVERTISED_WINDOW;
            }
        }

        let resolved = self.resolve_alias(stream_id);
        if !self.active_streams.contains_key(&resolved) {
            let _ = self.h2_writer.write_rst_stream(stream_id, ERROR_STREAM_CLOSED);
            return;
        }

        {
            let entry = self.active_streams.get_mut(&resolved).unwrap();
            entry.recv_window -= len;
        }
        let recv_window = self.active_streams.get(&resolved).unwrap().recv_window;
        if recv_window <= ADVERTISED_WINDOW / 2 {
            let increment = (ADVERTISED_WINDOW - recv_window) as u32;
            if self.h2_writer.write_window_update(resolved, increment).is_ok() {
                if let Some(entry) = self.active_streams.get_mut(&resolved) {
                    entry.recv_window = ADVERTISED_WINDOW;
                }
            }
        }

        let entry = self.active_streams.get_mut(&resolved).unwrap();
        if entry.discarding_for_auth_retry {
            if end_stream {
                let entry = self.active_streams.remove(&resolved).unwrap();
                let needs_oauth_refresh = entry.pending_retry_needs_oauth_refresh;
                if let Some(retry_request) = entry.pending_retry_request {
                    if needs_oauth_refresh {
                        self.pending_h2_oauth_refresh = Some((resolved, retry_request, entry.handler));
                    } else {
                        self.pending_h2_retry = Some((resolved, retry_request, entry.handler));
                    }
                }
            }
            return;
        }

        if !entry.body_started {
            entry.body_started = true;
            entry.handler.start_body();
        }
        if !data.is_empty() {
            entry.handler.body_chunk(&data);
        }
        if end_stream {
            entry.handler.end_body();
            entry.handler.complete();
            self.active_streams.remove(&resolved);
        }
    }

    fn headers_frame_received(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        _stream_dependency: u32,
        _exclusive: bool,
        _weight: u8,
        header_block_fragment: Bytes,
    ) {
        let mut block = BytesMut::with_capacity(header_block_fragment.len());
        block.extend_from_slice(&header_block_fragment);
        self.h2_header_block = Some(block);
        self.h2_header_stream_id = stream_id;
        self.h2_header_end_stream = end_stream;
        if end_headers {
            self.process_header_block();
        }
    }

    fn priority_frame_received(&mut self, _stream_id: u32, _stream_dependency: u32, _exclusive: bool, _weight: u8) {
        // Priority scheduling is not modeled; the engine treats all streams equally.
    }

    fn rst_stream_frame_received(&mut self, stream_id: u32, error_code: u32) {
        let resolved = self.resolve_alias(stream_id);
        if let Some(mut entry) = self.active_streams.remove(&resolved) {
            let err: io::Error = HttpError::Stream {
                stream_id: resolved,
                reason: error_to_string(error_code).to_string(),
            }
            .into();
            entry.handler.failed(&err);
        }
    }

    fn settings_frame_received(&mut self, ack: bool, settings: Vec<(u16, u32)>) {
        if ack {
            return;
        }
        for (id, value) in settings {
            match id {
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    self.peer_settings.max_concurrent_streams = Some(value);
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    let new_value = value as i64;
                    let delta = new_value - self.peer_settings.initial_window_size;
                    for entry in self.active_streams.values_mut() {
                        entry.send_window += delta;
                    }
                    self.peer_settings.initial_window_size = new_value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    let size = value as usize;
                    if (MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                        self.peer_settings.max_frame_size = size;
                    }
                }
                id if id == crate::protocol::http::h2::SETTINGS_HEADER_TABLE_SIZE => {
                    self.peer_settings.header_table_size = value as usize;
                }
                _ => {}
            }
        }
        let _ = self.h2_writer.write_settings_ack();
        if self.mode == ConnMode::H2cUpgradePending {
            self.mode = ConnMode::Http2;
        }
    }

    fn push_promise_frame_received(
        &mut self,
        _stream_id: u32,
        promised_stream_id: u32,
        _end_headers: bool,
        _header_block_fragment: Bytes,
    ) {
        // Server push is rejected by default: no handler surface is offered for it.
        let _ = self.h2_writer.write_rst_stream(promised_stream_id, ERROR_REFUSED_STREAM);
    }

    fn ping_frame_received(&mut self, ack: bool, opaque_data: u64) {
        if !ack {
            let _ = self.h2_writer.write_ping(opaque_data, true);
        }
    }

    fn goaway_frame_received(&mut self, last_stream_id: u32, error_code: u32, _debug_data: Bytes) {
        eprintln!(
            "[http] GOAWAY received (last_stream_id={}, error={})",
            last_stream_id,
            error_to_string(error_code)
        );
        self.goaway_received = Some(last_stream_id);
        let to_fail: Vec<u32> = self
            .active_streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for id in to_fail {
            if let Some(mut entry) = self.active_streams.remove(&id) {
                let err: io::Error = HttpError::ServerShutdown { last_stream_id }.into();
                entry.handler.failed(&err);
            }
        }
    }

    fn window_update_frame_received(&mut self, stream_id: u32, window_size_increment: u32) {
        if stream_id == 0 {
            self.conn_send_window += window_size_increment as i64;
        } else {
            let resolved = self.resolve_alias(stream_id);
            if let Some(entry) = self.active_streams.get_mut(&resolved) {
                entry.send_window += window_size_increment as i64;
            }
        }
    }

    fn continuation_frame_received(&mut self, _stream_id: u32, end_headers: bool, header_block_fragment: Bytes) {
        if let Some(block) = self.h2_header_block.as_mut() {
            block.extend_from_slice(&header_block_fragment);
        }
        if end_headers {
            self.process_header_block();
        }
    }

    fn frame_error(&mut self, error_code: u32, stream_id: u32, message: String) {
        if stream_id == 0 {
            eprintln!("[http] connection-level frame error: {}; sending GOAWAY", message);
            let last = self.highest_known_stream_id();
            let _ = self.h2_writer.write_goaway(last, error_code, message.as_bytes());
            self.open = false;
            self.fail_all_streams(HttpError::Protocol(message));
        } else {
            let _ = self.h2_writer.write_rst_stream(stream_id, error_code);
            if let Some(mut entry) = self.active_streams.remove(&stream_id) {
                let err: io::Error = HttpError::Stream { stream_id, reason: message }.into();
                entry.handler.failed(&err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    #[derive(Default, Clone)]
    struct RecordedEvents(Arc<Mutex<Vec<String>>>);

    impl RecordedEvents {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().unwrap().push(s.into());
        }
        fn snapshot(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct RecordingHandler {
        events: RecordedEvents,
    }

    impl ResponseHandler for RecordingHandler {
        fn ok(&mut self, response: Response) {
            self.events.push(format!("ok({})", response.code()));
        }
        fn error(&mut self, response: Response) {
            self.events.push(format!("error({})", response.code()));
        }
        fn header(&mut self, name: &str, value: &str) {
            self.events.push(format!("header({}:{})", name, value));
        }
        fn start_body(&mut self) {
            self.events.push("start_body".to_string());
        }
        fn body_chunk(&mut self, data: &[u8]) {
            self.events.push(format!("body_chunk({})", String::from_utf8_lossy(data)));
        }
        fn end_body(&mut self) {
            self.events.push("end_body".to_string());
        }
        fn complete(&mut self) {
            self.events.push("complete".to_string());
        }
        fn failed(&mut self, error: &io::Error) {
            self.events.push(format!("failed({})", error));
        }
    }

    fn memory_connection(stream: tokio::io::DuplexStream) -> HttpConnection {
        HttpConnection::new(
            HttpStream::Memory(stream),
            "example.com".into(),
            80,
            false,
            HttpVersion::Http1_1,
            ClientConfig::default(),
        )
    }

    fn memory_connection_h2(stream: tokio::io::DuplexStream) -> HttpConnection {
        HttpConnection::new(
            HttpStream::Memory(stream),
            "example.com".into(),
            80,
            false,
            HttpVersion::Http2,
            ClientConfig {
                h2_with_prior_knowledge: true,
                ..ClientConfig::default()
            },
        )
    }

    // Regression test: a direct (prior-knowledge / ALPN-negotiated) HTTP/2 connection
    // must accept submit()/send() right after start_http2(), without first waiting for
    // the peer's SETTINGS frame to arrive (RFC 7540 3.5 permits sending immediately
    // after the client preface).
    #[tokio::test]
    async fn direct_http2_connection_sends_before_peer_settings_arrive() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection_h2(client);
        conn.start_http2().await.unwrap();

        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };
        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut preface_buf = vec![0u8; CONNECTION_PREFACE.len()];
        server.read_exact(&mut preface_buf).await.unwrap();
        assert_eq!(preface_buf, CONNECTION_PREFACE);

        let mut frame_header = [0u8; 9];
        server.read_exact(&mut frame_header).await.unwrap();
        assert_eq!(frame_header[3], 4); // client's initial (empty) SETTINGS frame

        // The client's HEADERS frame for stream 1 must show up without the server
        // ever having sent a SETTINGS frame of its own.
        let mut headers_frame_header = [0u8; 9];
        server.read_exact(&mut headers_frame_header).await.unwrap();
        assert_eq!(headers_frame_header[3], 1); // TYPE_HEADERS
        assert_eq!(u32::from_be_bytes(headers_frame_header[5..9].try_into().unwrap()), 1);
        let len = ((headers_frame_header[0] as usize) << 16)
            | ((headers_frame_header[1] as usize) << 8)
            | headers_frame_header[2] as usize;
        let mut headers_payload = vec![0u8; len];
        server.read_exact(&mut headers_payload).await.unwrap();

        let mut server_writer = H2Writer::new();
        server_writer.write_settings(&[]).unwrap();
        server_writer.write_headers(1, &[0x88], true, true).unwrap();
        let out = server_writer.take_buffer();
        server.write_all(&out).await.unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(events.snapshot(), vec!["ok(200)", "complete"]);
    }

    // Scenario 1 from the end-to-end test matrix: GET with a Content-Length body.
    #[tokio::test]
    async fn simple_get_dispatches_events_in_order() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection(client);
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(sent.contains("Host: example.com\r\n"));
        assert!(sent.ends_with("\r\n\r\n"));

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Y: z\r\n\r\nhello")
            .await
            .unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(
            events.snapshot(),
            vec![
                "ok(200)",
                "header(Content-Length:5)",
                "header(X-Y:z)",
                "start_body",
                "body_chunk(hello)",
                "end_body",
                "complete",
            ]
        );
    }

    // Scenario 2: chunked transfer encoding reassembles into the original bytes.
    #[tokio::test]
    async fn chunked_response_reassembles_body() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection(client);
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut buf = vec![0u8; 4096];
        server.read(&mut buf).await.unwrap();

        server
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await
            .unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        let seen = events.snapshot();
        assert_eq!(
            seen,
            vec![
                "ok(200)",
                "header(Transfer-Encoding:chunked)",
                "start_body",
                "body_chunk(hello)",
                "body_chunk( world)",
                "end_body",
                "complete",
            ]
        );
    }

    // Regression test: no Content-Length, no chunked encoding, status not in
    // {204, 304, 1xx} — body framing is read-until-close (RFC 7230 3.3.3 case 7),
    // and the transport closing must still resolve to end_body()/complete(), not
    // an UnexpectedEof error.
    #[tokio::test]
    async fn read_until_close_body_completes_on_eof() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection(client);
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        server.read(&mut vec![0u8; 4096]).await.unwrap();
        server.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello world").await.unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(
            events.snapshot(),
            vec!["ok(200)", "start_body", "body_chunk(hello world)", "end_body", "complete"]
        );
    }

    // Scenario 4: server accepts the h2c upgrade; the rest of the exchange runs over HTTP/2
    // framing on stream 1, and the stale 101 is never misrouted into the discard-informational
    // path (regression test for the ordering of the 101/h2c check vs. the 1xx discard).
    #[tokio::test]
    async fn h2c_upgrade_accepted_completes_over_http2() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection(client);
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(sent.to_lowercase().contains("upgrade: h2c\r\n"));
        assert!(sent.to_lowercase().contains("http2-settings:"));
        assert!(sent.to_lowercase().contains("connection: upgrade, http2-settings\r\n"));

        server
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")
            .await
            .unwrap();

        let mut preface_buf = vec![0u8; CONNECTION_PREFACE.len()];
        server.read_exact(&mut preface_buf).await.unwrap();
        assert_eq!(preface_buf, CONNECTION_PREFACE);

        // Client's initial SETTINGS frame header: length may vary, just consume a full frame.
        let mut frame_header = [0u8; 9];
        server.read_exact(&mut frame_header).await.unwrap();
        let settings_len =
            ((frame_header[0] as usize) << 16) | ((frame_header[1] as usize) << 8) | frame_header[2] as usize;
        let mut settings_payload = vec![0u8; settings_len];
        server.read_exact(&mut settings_payload).await.unwrap();
        assert_eq!(frame_header[3], 4); // TYPE_SETTINGS

        let mut server_writer = H2Writer::new();
        server_writer.write_settings(&[]).unwrap();
        server_writer.write_settings_ack().unwrap();
        // :status: 200, indexed static-table entry 8, encoded as a single HPACK byte.
        server_writer
            .write_headers(1, &[0x88], true, true)
            .unwrap();
        let out = server_writer.take_buffer();
        server.write_all(&out).await.unwrap();

        // Client must ack the server's SETTINGS frame.
        let mut ack_header = [0u8; 9];
        server.read_exact(&mut ack_header).await.unwrap();
        assert_eq!(ack_header[3], 4); // TYPE_SETTINGS
        assert_eq!(ack_header[4] & 0x1, 0x1); // FLAG_ACK

        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(events.snapshot(), vec!["ok(200)", "complete"]);
    }

    // Status codes with no body regardless of headers: 204/304/1xx and HEAD.
    #[tokio::test]
    async fn no_content_completes_without_body_events() {
        let (client, mut server) = duplex(8192);
        let mut conn = memory_connection(client);
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut buf = vec![0u8; 4096];
        server.read(&mut buf).await.unwrap();
        server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(events.snapshot(), vec!["ok(204)", "complete"]);
    }

    // SPEC_FULL 4.9: a Bearer challenge reporting invalid_token triggers the
    // configured OAuthRefresh callback, and the retried request carries the new
    // access token rather than the stale one.
    struct StubOAuthRefresh;

    impl crate::protocol::http::auth::OAuthRefresh for StubOAuthRefresh {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(String, Option<String>), HttpError>> + Send + 'a>,
        > {
            Box::pin(async move {
                assert_eq!(refresh_token, "r-token");
                Ok(("fresh-access-token".to_string(), Some("r-token-2".to_string())))
            })
        }
    }

    #[tokio::test]
    async fn invalid_token_challenge_refreshes_oauth_and_retries() {
        let (client, mut server) = duplex(8192);
        let config = ClientConfig {
            credentials: Some(Credentials::OAuth {
                access_token: "stale-access-token".into(),
                refresh_token: Some("r-token".into()),
            }),
            oauth_refresh: Some(std::sync::Arc::new(StubOAuthRefresh)),
            ..ClientConfig::default()
        };
        let mut conn = HttpConnection::new(
            HttpStream::Memory(client),
            "example.com".into(),
            80,
            false,
            HttpVersion::Http1_1,
            config,
        );
        let events = RecordedEvents::default();
        let handler = RecordingHandler { events: events.clone() };

        let request = conn.request(Method::Get, "/x");
        let send = tokio::spawn(async move { conn.send(request, handler).await });

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        let first_request = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(first_request.contains("Authorization: Bearer stale-access-token\r\n"));

        server
            .write_all(
                b"HTTP/1.1 401 Unauthorized\r\n\
                  WWW-Authenticate: Bearer error=\"invalid_token\"\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        let retried_request = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(retried_request.contains("Authorization: Bearer fresh-access-token\r\n"));

        server.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
        server.shutdown().await.unwrap();

        send.await.unwrap().unwrap();
        assert_eq!(
            events.snapshot(),
            vec!["ok(200)", "header(Content-Length:2)", "start_body", "body_chunk(ok)", "end_body", "complete"]
        );
    }
}

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

use super::AppContext;
use super::codec::{self, RequestHead, ResponseHead};
use super::recorder::RequestFacts;
use super::upstream;

pub enum ClientDisposition {
    Continue,
    Close,
}

/// Serve one client connection: keep reading requests until the client closes
/// or asks to, handling each through the lookup → forward → record flow.
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let head = codec::read_request_head(
            &mut reader,
            peer,
            app.settings.client_timeout(),
            app.settings.max_header_size,
        )
        .await?;
        let Some(head) = head else {
            break;
        };
        match handle_request(&mut reader, peer, &app, head).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }
    Ok(())
}

async fn handle_request(
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
) -> Result<ClientDisposition> {
    let start = Instant::now();
    let client_timeout = app.settings.client_timeout();
    let max_body_size = app.settings.max_body_size;

    let content_length = match head.content_length() {
        Ok(value) => value,
        Err(err) => {
            warn!(peer = %peer, error = %err, "invalid content-length header");
            send_error(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "invalid Content-Length header",
                app,
            )
            .await?;
            access_log_base(peer, &head, start)
                .status(StatusCode::BAD_REQUEST)
                .error_reason("bad_request")
                .error_detail(err.to_string())
                .log();
            return Ok(ClientDisposition::Close);
        }
    };

    if let Some(length) = content_length
        && !head.is_chunked()
        && length > max_body_size
    {
        warn!(peer = %peer, length, max = max_body_size, "request body exceeds limit");
        send_error(
            reader.get_mut(),
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body exceeds configured limit",
            app,
        )
        .await?;
        access_log_base(peer, &head, start)
            .status(StatusCode::PAYLOAD_TOO_LARGE)
            .error_reason("body_too_large")
            .log();
        return Ok(ClientDisposition::Close);
    }

    let body = if head.is_chunked() {
        codec::read_chunked_body(reader, client_timeout, peer, max_body_size).await?
    } else {
        match content_length {
            Some(length) if length > 0 => {
                codec::read_fixed_body(
                    reader,
                    length,
                    client_timeout,
                    "reading request body from client",
                )
                .await?
            }
            _ => Vec::new(),
        }
    };

    let Some(target) = origin_form_target(&head.target) else {
        warn!(peer = %peer, target = %head.target, "unsupported request target");
        send_error(
            reader.get_mut(),
            StatusCode::BAD_REQUEST,
            "invalid request target",
            app,
        )
        .await?;
        access_log_base(peer, &head, start)
            .status(StatusCode::BAD_REQUEST)
            .error_reason("bad_target")
            .log();
        return Ok(ClientDisposition::Close);
    };

    let facts = RequestFacts {
        method: head.method.clone(),
        target,
        authorization: head.header("authorization").map(str::to_string),
        accept: head.header("accept").map(str::to_string),
    };
    let client_wants_close = head.wants_connection_close();
    let bytes_in = (head.head_bytes + body.len()) as u64;

    // Replay path: an existing recording short-circuits the upstream entirely.
    if let Some(recorder) = &app.recorder
        && let Some(recording) = recorder.lookup(&facts).await
    {
        let replay_head = codec::encode_replay_head(
            recording.status,
            recording.content_type,
            recording.body.len(),
            client_wants_close,
        );
        let stream = reader.get_mut();
        timeout_with_context(
            client_timeout,
            stream.write_all(&replay_head),
            "writing replayed response head",
        )
        .await?;
        timeout_with_context(
            client_timeout,
            stream.write_all(recording.body.as_bytes()),
            "writing replayed response body",
        )
        .await?;
        stream.flush().await?;

        access_log_base(peer, &head, start)
            .path(facts.target.clone())
            .status(recording.status)
            .cache_lookup("hit")
            .cache_store("bypassed")
            .bytes(bytes_in, recording.body.len() as u64)
            .log();
        return Ok(if client_wants_close {
            ClientDisposition::Close
        } else {
            ClientDisposition::Continue
        });
    }

    let (response_head, response_body) = match forward_upstream(app, &head, &facts, &body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(peer = %peer, error = %err, "failed to forward request upstream");
            send_error(
                reader.get_mut(),
                StatusCode::BAD_GATEWAY,
                "upstream request failed",
                app,
            )
            .await?;
            access_log_base(peer, &head, start)
                .path(facts.target.clone())
                .status(StatusCode::BAD_GATEWAY)
                .bytes(bytes_in, 0)
                .error_reason("upstream_error")
                .error_detail(format!("{err:#}"))
                .log();
            return Ok(ClientDisposition::Close);
        }
    };

    // Record before relaying so persistence does not depend on the client
    // staying connected; the response itself is never altered by the outcome.
    let (cache_lookup, cache_store) = if let Some(recorder) = &app.recorder {
        let outcome = match std::str::from_utf8(&response_body) {
            Ok(text) => {
                if recorder
                    .record(&facts, response_head.status, text)
                    .await
                    .is_some()
                {
                    "stored"
                } else {
                    "failed"
                }
            }
            Err(_) => {
                debug!(
                    peer = %peer,
                    url = %facts.target,
                    "response body is not valid UTF-8; skipping recording"
                );
                "skipped"
            }
        };
        ("miss", outcome)
    } else {
        ("bypass", "bypassed")
    };

    let stream = reader.get_mut();
    let encoded_head =
        codec::encode_response_head(&response_head, response_body.len(), client_wants_close);
    timeout_with_context(
        client_timeout,
        stream.write_all(&encoded_head),
        "writing response head to client",
    )
    .await?;
    timeout_with_context(
        client_timeout,
        stream.write_all(&response_body),
        "writing response body to client",
    )
    .await?;
    stream.flush().await?;

    access_log_base(peer, &head, start)
        .path(facts.target.clone())
        .status(response_head.status)
        .cache_lookup(cache_lookup)
        .cache_store(cache_store)
        .bytes(bytes_in, response_body.len() as u64)
        .log();

    Ok(if client_wants_close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    })
}

/// Send the buffered request upstream and read the full response back.
async fn forward_upstream(
    app: &AppContext,
    head: &RequestHead,
    facts: &RequestFacts,
    body: &[u8],
) -> Result<(ResponseHead, Vec<u8>)> {
    let settings = &app.settings;
    let (stream, addr) = upstream::connect(
        &settings.upstream_host,
        settings.upstream_port,
        settings.upstream_connect_timeout(),
    )
    .await?;
    let mut upstream_reader = BufReader::new(stream);

    let request_bytes = codec::build_upstream_request(
        head,
        &facts.target,
        &settings.upstream_authority(),
        body.len(),
    );
    let upstream_timeout = settings.upstream_timeout();
    {
        let stream = upstream_reader.get_mut();
        timeout_with_context(
            upstream_timeout,
            stream.write_all(&request_bytes),
            "writing request head to upstream",
        )
        .await?;
        if !body.is_empty() {
            timeout_with_context(
                upstream_timeout,
                stream.write_all(body),
                "writing request body to upstream",
            )
            .await?;
        }
        stream.flush().await?;
    }

    let response_head = codec::read_response_head(
        &mut upstream_reader,
        upstream_timeout,
        addr,
        settings.max_header_size,
    )
    .await?;

    let response_body = if !response_may_have_body(&head.method, response_head.status) {
        Vec::new()
    } else if response_head.chunked {
        codec::read_chunked_body(&mut upstream_reader, upstream_timeout, addr, settings.max_body_size)
            .await?
    } else if let Some(length) = response_head.content_length {
        if length > settings.max_body_size as u64 {
            bail!(
                "upstream response body of {length} bytes exceeds configured limit of {} bytes",
                settings.max_body_size
            );
        }
        codec::read_fixed_body(
            &mut upstream_reader,
            length as usize,
            upstream_timeout,
            "reading response body from upstream",
        )
        .await?
    } else {
        codec::read_body_to_close(
            &mut upstream_reader,
            upstream_timeout,
            addr,
            settings.max_body_size,
        )
        .await?
    };

    Ok((response_head, response_body))
}

fn response_may_have_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Reduce the request target to origin-form (path plus query). Absolute-form
/// targets are accepted and stripped to their path and query.
fn origin_form_target(target: &str) -> Option<String> {
    if target.starts_with('/') {
        return Some(target.to_string());
    }
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return None;
    }
    target.parse::<http::Uri>().ok().and_then(|uri| {
        uri.path_and_query()
            .map(|path_query| path_query.as_str().to_string())
    })
}

fn access_log_base(peer: SocketAddr, head: &RequestHead, start: Instant) -> AccessLogBuilder {
    AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.clone())
        .elapsed(start.elapsed())
}

async fn send_error(
    stream: &mut TcpStream,
    status: StatusCode,
    message: &str,
    app: &AppContext,
) -> Result<()> {
    let body = format!("{message}\r\n");
    let reason = status.canonical_reason().unwrap_or("Error");
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        reason,
        body.len(),
        body
    );
    timeout_with_context(
        app.settings.client_timeout(),
        stream.write_all(response.as_bytes()),
        "writing error response to client",
    )
    .await?;
    stream.flush().await?;
    Ok(())
}

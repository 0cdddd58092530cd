use anyhow::{anyhow, Result};
use objfun_core::Store;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Request, Response, Server};
use tracing::{error, info, warn};

use crate::api::{self, ApiRequest, ApiResponse, Method};
use crate::config::ServerConfig;

const MAX_BODY_BYTES: u64 = 1 << 20;

/// Serves the API until the listener fails. Each worker thread owns its own
/// database connection.
pub fn serve(config: &ServerConfig) -> Result<()> {
    config.validate()?;
    // fail early on a missing or unreadable database
    Store::open_with_timeout(&config.database, config.busy_timeout)?;

    let server = Server::http(config.bind.as_str())
        .map_err(|e| anyhow!("failed to bind {}: {}", config.bind, e))?;
    let server = Arc::new(server);
    info!(
        bind = %config.bind,
        database = %config.database.display(),
        threads = config.threads,
        "objfun server listening"
    );

    let mut workers = Vec::with_capacity(config.threads);
    for idx in 0..config.threads {
        let server = Arc::clone(&server);
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("objfun-worker-{}", idx))
            .spawn(move || worker_loop(&server, &config))?;
        workers.push(handle);
    }
    for handle in workers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "worker stopped"),
            Err(_) => error!("worker panicked"),
        }
    }
    Ok(())
}

fn worker_loop(server: &Server, config: &ServerConfig) -> Result<()> {
    let mut store = Store::open_with_timeout(&config.database, config.busy_timeout)?;
    let secret = config.secret_key.as_bytes();
    loop {
        let request = match server.recv() {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "accept failed; worker exiting");
                return Ok(());
            }
        };
        if let Err(err) = respond(&mut store, secret, request) {
            warn!(error = %err, "failed to write response");
        }
    }
}

fn respond(store: &mut Store, secret: &[u8], mut request: Request) -> Result<()> {
    let method = match request.method() {
        tiny_http::Method::Get => Method::Get,
        tiny_http::Method::Post => Method::Post,
        tiny_http::Method::Put => Method::Put,
        _ => Method::Other,
    };
    let authorization = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .map(|h| h.value.as_str().to_string());
    let url = request.url().to_string();
    let response = match read_body(request.as_reader(), MAX_BODY_BYTES)? {
        Some(body) => {
            let api_request = ApiRequest {
                method,
                url: url.clone(),
                authorization,
                body,
            };
            api::handle(store, secret, &api_request)
        }
        None => ApiResponse {
            status: 413,
            body: api::json_error(
                "payload_too_large",
                format!("request body exceeds {} bytes", MAX_BODY_BYTES),
            ),
        },
    };
    info!(
        method = ?request.method(),
        url = %url,
        status = response.status,
        "handled request"
    );

    let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .map_err(|_| anyhow!("invalid content-type header"))?;
    let payload = serde_json::to_vec(&response.body)?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(response.status)
            .with_header(content_type),
    )?;
    Ok(())
}

/// Reads at most `limit` bytes; `None` when the body is longer.
fn read_body(reader: &mut dyn Read, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit + 1).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(body))
}

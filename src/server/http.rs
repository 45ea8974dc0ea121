//! HTTP front end: one command per request.
//!
//! A command is `POST|GET /<CMD>/<KEY>[/<arg>...]` with every path segment
//! percent-decoded on its own, so keys and arguments may contain slashes.
//! The body supplies trailing arguments: a multipart form contributes one
//! argument per part, any other non-empty body contributes exactly one.
//!
//! Replies carry the status enumerant in the `X-Radish-Status` header.
//! Slice payloads are returned as `multipart/form-data`; everything else
//! goes straight into the body.

use crate::controller::Controller;
use crate::message::{Request, Response, Status};
use axum::extract::{FromRequest, Multipart, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::debug;

/// Header carrying the reply status enumerant name.
pub const STATUS_HEADER: &str = "x-radish-status";

/// Serves the HTTP API until the shutdown channel fires.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<Controller>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = Router::new().fallback(dispatch).with_state(controller);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
}

async fn dispatch(
    State(controller): State<Arc<Controller>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    if request.method() != Method::GET && request.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "use GET or POST\n").into_response();
    }

    match build_request(request).await {
        Ok(command) => {
            debug!(cmd = %command.cmd, args = command.len(), "handling HTTP request");
            render(controller.handle(command))
        }
        Err(message) => (StatusCode::BAD_REQUEST, message).into_response(),
    }
}

/// Turns an HTTP request into a command request: path segments become the
/// command name and leading arguments, the body the trailing ones.
async fn build_request(request: axum::extract::Request) -> Result<Request, String> {
    let path = request.uri().path().to_owned();
    let mut segments = Vec::new();
    for raw in path.split('/').skip(1) {
        let segment = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| format!("invalid percent-encoding in {raw:?}"))?;
        segments.push(segment.into_owned());
    }
    if segments.len() < 2 {
        return Err("URL must look like /<CMD>/<KEY>[/<arg>...]".to_string());
    }

    let cmd = segments.remove(0);
    let mut args: Vec<Bytes> = segments
        .into_iter()
        .map(|s| Bytes::from(s.into_bytes()))
        .collect();

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_owned();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| e.to_string())?;
        while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
            let data = field.bytes().await.map_err(|e| e.to_string())?;
            args.push(data);
        }
    } else {
        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| e.to_string())?;
        if !body.is_empty() {
            args.push(body);
        }
    }

    Ok(Request::new(&cmd, args))
}

fn render(response: Response) -> axum::response::Response {
    let status = response.status();
    let code = match status {
        Status::Ok => StatusCode::OK,
        Status::NotFound => StatusCode::NOT_FOUND,
        Status::InvalidCommand | Status::InvalidArguments | Status::TypeMismatch => {
            StatusCode::BAD_REQUEST
        }
        Status::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut rendered = match response {
        Response::StrSlice(items) => {
            let boundary = make_boundary();
            let body = multipart_body(&boundary, &items);
            (
                code,
                [(
                    header::CONTENT_TYPE.as_str(),
                    format!("multipart/form-data; boundary={boundary}"),
                )],
                body,
            )
                .into_response()
        }
        Response::Str(data) => (code, data).into_response(),
        Response::Int(n) => (code, n.to_string()).into_response(),
        Response::Status { message, .. } => (code, message).into_response(),
    };

    rendered
        .headers_mut()
        .insert(STATUS_HEADER, HeaderValue::from_static(status.as_str()));
    rendered
}

fn multipart_body(boundary: &str, items: &[Bytes]) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        body.extend_from_slice(b"--");
        body.extend_from_slice(boundary.as_bytes());
        body.extend_from_slice(b"\r\nContent-Type: text/plain\r\n\r\n");
        body.extend_from_slice(item);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"--\r\n");
    body
}

/// Boundary unique enough for one reply; clock-derived, no global state.
fn make_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("radish{nanos:032x}")
}

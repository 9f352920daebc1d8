//! Handler functions for the Control API's routes. Kept thin: each
//! one validates its input, calls into the Registry, and maps the
//! result onto the appropriate HTTP status code.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use stevedore_core::{Registry, RegistryError, RouteDescriptor};
use warp::http::StatusCode;
use warp::ws::{Message as WsMessage, WebSocket};
use warp::{Rejection, Reply};

use crate::viewer::{self, Formatter, ViewerBody};

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> impl Reply {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody { error: message.into() }),
        status,
    )
}

pub async fn health() -> Result<impl Reply, Infallible> {
    Ok(warp::reply::with_status("ok", StatusCode::OK))
}

pub async fn list_routes(registry: Arc<Registry>) -> Result<warp::reply::Response, Infallible> {
    let descriptors: Vec<RouteDescriptor> = registry
        .get_all()
        .await
        .iter()
        .map(|route| route.to_descriptor())
        .collect();
    Ok(warp::reply::json(&descriptors).into_response())
}

pub async fn get_route(id: String, registry: Arc<Registry>) -> Result<warp::reply::Response, Infallible> {
    match registry.get(&id).await {
        Some(route) => Ok(warp::reply::json(&route.to_descriptor()).into_response()),
        None => Ok(error_reply(StatusCode::NOT_FOUND, format!("no such route: {id}")).into_response()),
    }
}

pub async fn add_route(
    descriptor: RouteDescriptor,
    registry: Arc<Registry>,
) -> Result<warp::reply::Response, Infallible> {
    match registry.add(descriptor).await {
        Ok(route) => Ok(warp::reply::with_status(
            warp::reply::json(&route.to_descriptor()),
            StatusCode::CREATED,
        )
        .into_response()),
        Err(RegistryError::UnknownAdapter { kind }) => {
            Ok(error_reply(StatusCode::BAD_REQUEST, format!("unknown adapter kind: {kind}")).into_response())
        }
        Err(err) => Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    }
}

pub async fn delete_route(id: String, registry: Arc<Registry>) -> Result<warp::reply::Response, Infallible> {
    match registry.remove(&id).await {
        Ok(()) => Ok(warp::reply::with_status("", StatusCode::OK).into_response()),
        Err(RegistryError::NotFound { .. }) => {
            Ok(error_reply(StatusCode::NOT_FOUND, format!("no such route: {id}")).into_response())
        }
        Err(err) => Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    }
}

/// Handles malformed JSON bodies and other filter rejections with a
/// structured 400, rather than warp's default plaintext body.
pub async fn recover(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if err.is_not_found() {
        return Ok(error_reply(StatusCode::NOT_FOUND, "not found").into_response());
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(error_reply(StatusCode::BAD_REQUEST, format!("malformed route descriptor: {e}")).into_response());
    }
    Ok(error_reply(StatusCode::BAD_REQUEST, "bad request").into_response())
}

/// `GET /logs[...]` non-websocket path: streams a chunked HTTP
/// response body until the client disconnects.
pub async fn logs_plain(
    tail: warp::path::Tail,
    query: HashMap<String, String>,
    accept: Option<String>,
    registry: Arc<Registry>,
) -> Result<warp::reply::Response, Infallible> {
    let filter = match viewer::parse_path_filter(tail.as_str()) {
        Ok(filter) => filter,
        Err(err) => return Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    };
    let mut filter = filter;
    match viewer::parse_sources(query.get("sources")) {
        Ok(sources) => filter.filter_sources = sources,
        Err(err) => return Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    }

    let json = accept.as_deref().is_some_and(|a| a.contains("application/json"));
    let formatter = Formatter::new(&filter, json);
    let route = viewer::ephemeral_route(filter);
    let (tx, rx) = tokio::sync::mpsc::channel(stevedore_core::SINK_CAPACITY);

    let supervisor = registry.supervisor();
    let route_for_task = route.clone();
    tokio::spawn(async move {
        supervisor.route(route_for_task, tx).await;
    });

    let body = ViewerBody::new(rx, formatter, route);
    let content_type = if json { "application/x-ndjson" } else { "text/plain; charset=utf-8" };
    let response = warp::http::Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .body(warp::hyper::Body::wrap_stream(body))
        .expect("building a streaming response body never fails");
    Ok(response)
}

/// `GET /logs[...]` websocket-upgrade path.
pub async fn logs_ws(
    tail: warp::path::Tail,
    query: HashMap<String, String>,
    ws: warp::ws::Ws,
    registry: Arc<Registry>,
) -> Result<warp::reply::Response, Infallible> {
    let mut filter = match viewer::parse_path_filter(tail.as_str()) {
        Ok(filter) => filter,
        Err(err) => return Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    };
    match viewer::parse_sources(query.get("sources")) {
        Ok(sources) => filter.filter_sources = sources,
        Err(err) => return Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()).into_response()),
    }
    let json = query.get("format").is_some_and(|f| f == "json");
    let formatter = Formatter::new(&filter, json);
    let route = viewer::ephemeral_route(filter);

    Ok(ws
        .on_upgrade(move |socket| serve_websocket(socket, formatter, route, registry))
        .into_response())
}

async fn serve_websocket(
    mut socket: WebSocket,
    formatter: Formatter,
    route: Arc<stevedore_core::Route>,
    registry: Arc<Registry>,
) {
    use futures_util::{SinkExt, StreamExt};

    let (tx, mut rx) = tokio::sync::mpsc::channel(stevedore_core::SINK_CAPACITY);
    let supervisor = registry.supervisor();
    let route_for_task = route.clone();
    let routing_task = tokio::spawn(async move {
        supervisor.route(route_for_task, tx).await;
    });

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(message) => {
                        let bytes = formatter.format(&message);
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if socket.send(WsMessage::text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(msg)) if msg.is_close() => break,
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    route.cancel();
    routing_task.abort();
}

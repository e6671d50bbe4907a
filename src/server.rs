use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::error::{ApiError, ApiResult};
use crate::guard::{EntryPoint, ListFilter};
use crate::model::BookId;

// 64KB cap on request bodies
const MAX_BODY: u64 = 64 * 1024;

pub struct BookServer {
    entry: EntryPoint,
}

impl BookServer {
    pub fn new(entry: EntryPoint) -> Self {
        Self { entry }
    }

    /// Serves until `shutdown` resolves.
    pub async fn run<S>(self, addr: SocketAddr, shutdown: S) -> Result<(), warp::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let (bound, server) = warp::serve(routes(self.entry)).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(%bound, "book server listening");
        server.await;
        Ok(())
    }
}

/// Every route, with rejections turned into JSON error bodies.
pub fn routes(entry: EntryPoint) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    api(entry).recover(handle_rejection).unify()
}

pub fn api(entry: EntryPoint) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // --- ENTITY ROUTES ---

    // GET /books?title=..&min_stock=..
    let list = warp::get()
        .and(warp::path!("books"))
        .and(warp::query::<ListFilter>())
        .and(with_entry(entry.clone()))
        .and_then(|filter: ListFilter, entry: EntryPoint| async move {
            let res = blocking(move || entry.list(&filter)).await;
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    // GET /books/{id}
    let get = warp::get()
        .and(warp::path!("books" / BookId))
        .and(with_entry(entry.clone()))
        .and_then(|id: BookId, entry: EntryPoint| async move {
            let res = blocking(move || entry.get(id)).await;
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    // POST /books
    let create = warp::post()
        .and(warp::path!("books"))
        .and(warp::body::content_length_limit(MAX_BODY))
        .and(warp::body::bytes())
        .and(with_entry(entry.clone()))
        .and_then(|body: warp::hyper::body::Bytes, entry: EntryPoint| async move {
            let res = match parse_json(&body) {
                Ok(payload) => blocking(move || entry.handle_create(payload)).await,
                Err(e) => Err(e),
            };
            Ok::<_, Infallible>(respond(res, StatusCode::CREATED))
        });

    // PATCH|PUT /books/{id}
    let update = warp::patch()
        .or(warp::put())
        .unify()
        .and(warp::path!("books" / BookId))
        .and(warp::body::content_length_limit(MAX_BODY))
        .and(warp::body::bytes())
        .and(with_entry(entry.clone()))
        .and_then(|id: BookId, body: warp::hyper::body::Bytes, entry: EntryPoint| async move {
            let res = match parse_json(&body) {
                Ok(payload) => blocking(move || entry.handle_update(id, payload)).await,
                Err(e) => Err(e),
            };
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    // DELETE /books/{id}
    let delete = warp::delete()
        .and(warp::path!("books" / BookId))
        .and(with_entry(entry.clone()))
        .and_then(|id: BookId, entry: EntryPoint| async move {
            let res = blocking(move || entry.handle_delete(id)).await;
            let reply = match res {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => error_response(&e),
            };
            Ok::<_, Infallible>(reply)
        });

    // GET /books/{id}/as-of/{ts}
    let as_of = warp::get()
        .and(warp::path!("books" / BookId / "as-of" / u64))
        .and(with_entry(entry.clone()))
        .and_then(|id: BookId, ts: u64, entry: EntryPoint| async move {
            let res = blocking(move || entry.as_of(id, ts)).await;
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    // --- AUDIT ROUTES (read only) ---

    let audit_all = warp::get()
        .and(warp::path!("audit" / "books"))
        .and(with_entry(entry.clone()))
        .and_then(|entry: EntryPoint| async move {
            let res = blocking(move || entry.history(None)).await;
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    let audit_one = warp::get()
        .and(warp::path!("audit" / "books" / BookId))
        .and(with_entry(entry.clone()))
        .and_then(|id: BookId, entry: EntryPoint| async move {
            let res = blocking(move || entry.history(Some(id))).await;
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    // --- ADMIN ROUTES ---

    let checkpoint = warp::post()
        .and(warp::path!("admin" / "checkpoint"))
        .and(with_entry(entry.clone()))
        .and_then(|entry: EntryPoint| async move {
            let res = blocking(move || Ok(entry.store().checkpoint()?)).await;
            Ok::<_, Infallible>(respond(res.map(|()| json!({ "ok": true })), StatusCode::OK))
        });

    let verify = warp::get()
        .and(warp::path!("admin" / "verify"))
        .and(with_entry(entry))
        .and_then(|entry: EntryPoint| async move {
            let res = blocking(move || Ok(entry.store().verify()?)).await;
            let res = res.map(|v| json!({ "ok": v.is_empty(), "violations": v }));
            Ok::<_, Infallible>(respond(res, StatusCode::OK))
        });

    list.or(get)
        .unify()
        .or(as_of)
        .unify()
        .or(create)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
        .or(audit_all)
        .unify()
        .or(audit_one)
        .unify()
        .or(checkpoint)
        .unify()
        .or(verify)
        .unify()
}

fn with_entry(entry: EntryPoint) -> impl Filter<Extract = (EntryPoint,), Error = Infallible> + Clone {
    warp::any().map(move || entry.clone())
}

/// Store calls block on per-book locks and fsync; keep them off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) => Err(ApiError::Internal(format!("store task failed: {}", e))),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    retryable: bool,
}

fn respond<T: Serialize>(res: ApiResult<T>, ok: StatusCode) -> Response {
    match res {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), ok).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &ApiError) -> Response {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    let body = ErrorBody {
        code: e.code(),
        message: e.to_string(),
        retryable: e.retryable(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND", "no such route".to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "VALIDATION", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, "VALIDATION", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::LengthRequired>() {
        (StatusCode::LENGTH_REQUIRED, "VALIDATION", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED", e.to_string())
    } else {
        warn!(rejection = ?err, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "unhandled rejection".to_string())
    };

    let body = ErrorBody { code, message, retryable: false };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

fn parse_json(body: &[u8]) -> ApiResult<serde_json::Value> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("body is not JSON: {}", e)))
}

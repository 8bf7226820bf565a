//! Maps app traffic to the session named by the access-code cookie.

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, Request, Response, header};
use axum::response::IntoResponse;
use log::{debug, error, warn};
use std::sync::Arc;

use crate::session::SessionRegistry;

use super::http::SessionProxy;

/// Cookie carrying a session's access code.
pub const ACCESS_CODE_COOKIE: &str = "SessionAccessCode";

fn cookie_value<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Access code from the request's cookies. Several `Cookie` headers are
/// searched in order.
pub fn access_code_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|raw| cookie_value(raw, ACCESS_CODE_COOKIE))
        .filter(|code| !code.is_empty())
        .map(str::to_string)
}

/// `Set-Cookie` value binding the browser to a session.
pub fn access_code_cookie(access_code: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        ACCESS_CODE_COOKIE, access_code
    )
}

/// `Set-Cookie` value that drops the binding.
pub fn clear_access_code_cookie() -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        ACCESS_CODE_COOKIE
    )
}

/// Open proxy of the session named by `access_code`, logging why there is
/// none.
pub fn resolve_proxy(registry: &SessionRegistry, access_code: &str) -> Option<Arc<SessionProxy>> {
    let Some(session) = registry.get_session_by_code(access_code) else {
        warn!("No session for access code {}", access_code);
        return None;
    };
    let proxy = session.proxy();
    if proxy.is_none() {
        warn!(
            "Session {} is {} and not accepting traffic",
            access_code,
            session.status()
        );
    }
    proxy
}

/// Forward an HTTP request to the session named by its cookie.
///
/// `None` means no session could be found for the request; the miss is
/// logged. Proxy failures come back as `Some` with a 413/502/503 response.
pub async fn route_to_app(registry: &SessionRegistry, req: Request<Body>) -> Option<Response<Body>> {
    let Some(access_code) = access_code_from_headers(req.headers()) else {
        debug!("No access code cookie on {} {}", req.method(), req.uri());
        return None;
    };
    let proxy = resolve_proxy(registry, &access_code)?;

    Some(match proxy.forward_http(req).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    })
}

/// Accept a WebSocket upgrade and relay it to the session named by
/// `access_code`. `None` when there is no such session.
pub fn route_to_app_ws(
    registry: &SessionRegistry,
    access_code: &str,
    ws: WebSocketUpgrade,
    path_and_query: String,
    cookie: Option<String>,
) -> Option<Response<Body>> {
    let proxy = resolve_proxy(registry, access_code)?;

    Some(ws.on_upgrade(move |socket| async move {
        if let Err(e) = proxy.forward_upgrade(socket, &path_and_query, cookie).await {
            error!("WebSocket relay error: {:?}", e);
        }
    }))
}

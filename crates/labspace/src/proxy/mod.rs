//! Reverse proxy to session containers and the cookie-based app router.

mod http;
mod router;

pub use http::{ProxyClient, SessionProxy, build_proxy_client, enforce_proxy_body_limit};
pub use router::{
    ACCESS_CODE_COOKIE, access_code_cookie, access_code_from_headers, clear_access_code_cookie,
    resolve_proxy, route_to_app, route_to_app_ws,
};

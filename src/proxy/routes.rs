//! The fixed route surface. Every path is proxied; the table only decides
//! which version token and which rewrite apply.

use std::sync::Arc;

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use tracing::{Instrument, info_span};

use super::forward::Forwarder;
use super::rewrite::RewriteRule;

/// `cv` presented for the PC client.
pub const PC_VERSION: &str = "p3.15.0";
/// `cv` presented for the iOS client.
pub const IOS_VERSION: &str = "i3.15.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    LoginMethods,
    MobileLogin,
    UserRecord,
    ReviewConfig,
    PassThrough,
}

pub struct RouteEntry {
    pub method: Method,
    pub path: &'static str,
    pub route: Route,
}

pub static ROUTES: &[RouteEntry] = &[
    RouteEntry {
        method: Method::GET,
        path: "/mpay/games/{game_id}/login_methods",
        route: Route::LoginMethods,
    },
    RouteEntry {
        method: Method::POST,
        path: "/mpay/api/users/login/mobile/finish",
        route: Route::MobileLogin,
    },
    RouteEntry {
        method: Method::POST,
        path: "/mpay/api/users/login/mobile/get_sms",
        route: Route::MobileLogin,
    },
    RouteEntry {
        method: Method::POST,
        path: "/mpay/api/users/login/mobile/verify_sms",
        route: Route::MobileLogin,
    },
    RouteEntry {
        method: Method::POST,
        path: "/mpay/games/{game_id}/devices/{device_id}/users",
        route: Route::MobileLogin,
    },
    RouteEntry {
        method: Method::GET,
        path: "/mpay/games/{game_id}/devices/{device_id}/users/{user_id}",
        route: Route::UserRecord,
    },
    RouteEntry {
        method: Method::GET,
        path: "/mpay/games/pc_config",
        route: Route::ReviewConfig,
    },
];

impl Route {
    /// Looks up the route for a method and the router's matched pattern.
    pub fn lookup(method: &Method, matched: Option<&str>) -> Route {
        matched
            .and_then(|pattern| {
                ROUTES
                    .iter()
                    .find(|entry| entry.method == *method && entry.path == pattern)
            })
            .map(|entry| entry.route)
            .unwrap_or(Route::PassThrough)
    }

    pub fn version_token(self) -> Option<&'static str> {
        match self {
            Route::LoginMethods => Some(PC_VERSION),
            Route::MobileLogin | Route::UserRecord | Route::ReviewConfig => Some(IOS_VERSION),
            Route::PassThrough => None,
        }
    }

    pub fn rewrite_rule(self) -> Option<RewriteRule> {
        match self {
            Route::LoginMethods => Some(RewriteRule::LoginMethods),
            Route::UserRecord => Some(RewriteRule::UserRecord),
            Route::ReviewConfig => Some(RewriteRule::ReviewConfig),
            Route::MobileLogin | Route::PassThrough => None,
        }
    }
}

/// Registers every known route plus a catch-all, all served by [`intercept`].
pub fn router(forwarder: Arc<Forwarder>) -> Router {
    let router = ROUTES.iter().fold(Router::new(), |router, entry| {
        let handler: MethodRouter<Arc<Forwarder>> = if entry.method == Method::POST {
            post(intercept)
        } else {
            get(intercept)
        };
        router.route(entry.path, handler.fallback(intercept))
    });
    router.fallback(intercept).with_state(forwarder)
}

async fn intercept(State(forwarder): State<Arc<Forwarder>>, request: Request) -> Response {
    let matched = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned());
    let route = Route::lookup(request.method(), matched.as_deref());
    let span = info_span!(
        "proxy",
        method = %request.method(),
        path = %request.uri().path(),
        route = ?route
    );

    async move {
        match forwarder.exchange(route, request).await {
            Ok((status, body)) => (status, axum::Json(body)).into_response(),
            Err(e) => {
                tracing::error!("request failed: {e}");
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

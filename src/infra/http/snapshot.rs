//! Snapshot middleware.
//!
//! Answers GET requests from crawlers with the pre-rendered snapshot for the
//! path. Requests it does not handle reach the inner service untouched.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{CONTENT_TYPE, USER_AGENT},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument, warn};

use crate::{
    application::{
        error::AppError,
        processor::{CallOptions, ProcessError, Processor},
        render::RenderedPage,
    },
    config::HttpSettings,
};

pub const SNAPSHOT_HEADER: HeaderName = HeaderName::from_static("x-snapshot");

/// Shared state for [`snapshot_layer`].
#[derive(Clone)]
pub struct SnapshotState {
    pub processor: Processor,
    pub http: Arc<HttpSettings>,
    /// User agent of our own renderer; its page loads must reach the app.
    pub renderer_user_agent: Arc<str>,
}

impl SnapshotState {
    pub fn new(processor: Processor, http: HttpSettings, renderer_user_agent: &str) -> Self {
        Self {
            processor,
            http: Arc::new(http),
            renderer_user_agent: Arc::from(renderer_user_agent),
        }
    }

    fn serves(&self, request: &Request<Body>) -> bool {
        if request.method() != Method::GET {
            return false;
        }
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if user_agent.eq_ignore_ascii_case(&self.renderer_user_agent) {
            return false;
        }
        self.http.crawler_user_agents.is_empty()
            || self
                .http
                .crawler_user_agents
                .iter()
                .any(|agent| user_agent.contains(agent.as_str()))
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn snapshot_layer(
    State(state): State<SnapshotState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.serves(&request) {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let mut query = parse_query(request.uri().query());
    let regenerate = query.remove(&state.http.regenerate_param).is_some();
    let options = CallOptions {
        force: regenerate,
        wait: regenerate,
        query,
        deadline: None,
    };

    match state.processor.call(&path, options.clone()).await {
        Ok(page) => snapshot_response(StatusCode::OK, page),
        Err(ProcessError::NotFound { .. }) => {
            let Some(not_found) = state.http.not_found_path.as_deref() else {
                debug!(outcome = "pass_through", "No route for path");
                return next.run(request).await;
            };
            match state.processor.call(not_found, options).await {
                Ok(page) => snapshot_response(StatusCode::NOT_FOUND, page),
                Err(err) => {
                    warn!(
                        not_found_path = not_found,
                        error = %err,
                        "Not-found page could not be served"
                    );
                    StatusCode::NOT_FOUND.into_response()
                }
            }
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn snapshot_response(status: StatusCode, page: RenderedPage) -> Response {
    let freshness = if page.stale { "stale" } else { "fresh" };
    (
        status,
        [
            (
                CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
            (SNAPSHOT_HEADER, HeaderValue::from_static(freshness)),
        ],
        page.html,
    )
        .into_response()
}

//! Ordered route table binding path patterns to stage pipelines.
//!
//! Routes are tried in registration order and the first match wins, so a
//! broad pattern registered early shadows narrower ones registered later.

use std::{fmt, str::FromStr, sync::Arc, time::Instant};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

const SOURCE: &str = "application::router";

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid route pattern `{pattern}`: {reason}")]
    Invalid { pattern: String, reason: String },
}

impl PatternError {
    fn invalid(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Compiled, fully anchored path matcher.
///
/// Glob syntax: `*` matches within one path segment, except a `*` that ends
/// the pattern, which matches any remainder (`/blog/*` accepts `/blog/a/b`).
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    matcher: Regex,
    sample: Option<String>,
}

impl RoutePattern {
    pub fn glob(pattern: &str) -> Result<Self, PatternError> {
        validate_glob(pattern)?;
        let matcher = compile(pattern, &format!("^{}$", glob_body(pattern)))?;
        let sample = (!pattern.contains('*')).then(|| pattern.to_string());
        Ok(Self {
            source: pattern.to_string(),
            matcher,
            sample,
        })
    }

    /// One route accepting any of several globs.
    pub fn any_of<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|pattern| pattern.as_ref().to_string())
            .collect();
        if patterns.is_empty() {
            return Err(PatternError::invalid("", "alternation needs at least one pattern"));
        }
        for pattern in &patterns {
            validate_glob(pattern)?;
        }

        let source = patterns.join(" | ");
        let body = patterns
            .iter()
            .map(|pattern| glob_body(pattern))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = compile(&source, &format!("^(?:{body})$"))?;
        let sample = patterns
            .iter()
            .find(|pattern| !pattern.contains('*'))
            .cloned();
        Ok(Self {
            source,
            matcher,
            sample,
        })
    }

    /// Raw regular expression, anchored to the whole pathname.
    pub fn regex(expression: &str) -> Result<Self, PatternError> {
        let matcher = compile(expression, &format!("^(?:{expression})$"))?;
        Ok(Self {
            source: expression.to_string(),
            matcher,
            sample: None,
        })
    }

    /// Pathname used when the route is crawled without an inbound request.
    pub fn with_sample(mut self, pathname: impl Into<String>) -> Self {
        self.sample = Some(pathname.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sample(&self) -> Option<&str> {
        self.sample.as_deref()
    }

    pub fn is_match(&self, pathname: &str) -> bool {
        self.matcher.is_match(pathname)
    }
}

impl FromStr for RoutePattern {
    type Err = PatternError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        Self::glob(pattern)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn validate_glob(pattern: &str) -> Result<(), PatternError> {
    if !pattern.starts_with('/') {
        return Err(PatternError::invalid(pattern, "must start with `/`"));
    }
    Ok(())
}

fn glob_body(pattern: &str) -> String {
    let pieces: Vec<&str> = pattern.split('*').collect();
    let last = pieces.len() - 1;
    let mut body = String::with_capacity(pattern.len() + 8);
    for (index, piece) in pieces.iter().enumerate() {
        body.push_str(&regex::escape(piece));
        if index < last {
            let trailing = index + 1 == last && pieces[last].is_empty();
            body.push_str(if trailing { ".*" } else { "[^/]*" });
        }
    }
    body
}

fn compile(source: &str, expression: &str) -> Result<Regex, PatternError> {
    Regex::new(expression).map_err(|err| PatternError::invalid(source, err.to_string()))
}

/// One step of a route pipeline. Receives the call's context by value and
/// either hands it on or aborts the chain.
#[async_trait]
pub trait Stage<C, E>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, context: C) -> Result<C, E>;
}

pub type Pipeline<C, E> = Arc<[Arc<dyn Stage<C, E>>]>;

pub struct Route<C, E> {
    pattern: RoutePattern,
    pipeline: Pipeline<C, E>,
}

impl<C, E> Route<C, E> {
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn pipeline(&self) -> &Pipeline<C, E> {
        &self.pipeline
    }
}

impl<C, E> Clone for Route<C, E> {
    fn clone(&self) -> Self {
        Self {
            pattern: self.pattern.clone(),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<C, E> fmt::Debug for Route<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.source)
            .field(
                "stages",
                &self.pipeline.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError<E> {
    #[error("no route matches `{pathname}`")]
    NoRoute { pathname: String },
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: E,
    },
}

pub struct Router<C, E> {
    routes: Vec<Route<C, E>>,
}

impl<C, E> Default for Router<C, E> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<C, E> Clone for Router<C, E> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
        }
    }
}

impl<C, E> fmt::Debug for Router<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.iter()).finish()
    }
}

impl<C, E> Router<C, E>
where
    C: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Earlier registrations take precedence.
    pub fn route(&mut self, pattern: RoutePattern, pipeline: Vec<Arc<dyn Stage<C, E>>>) {
        self.routes.push(Route {
            pattern,
            pipeline: pipeline.into(),
        });
    }

    pub fn routes(&self) -> &[Route<C, E>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn matches(&self, pathname: &str) -> Option<&Route<C, E>> {
        self.routes
            .iter()
            .find(|route| route.pattern.is_match(pathname))
    }

    /// Thread `context` through the first matching route's stages, one at a time.
    pub async fn dispatch(&self, pathname: &str, context: C) -> Result<C, DispatchError<E>> {
        let Some(route) = self.matches(pathname) else {
            return Err(DispatchError::NoRoute {
                pathname: pathname.to_string(),
            });
        };
        let pipeline = Arc::clone(&route.pipeline);

        let mut context = context;
        for stage in pipeline.iter() {
            let started_at = Instant::now();
            context = stage
                .run(context)
                .await
                .map_err(|source| DispatchError::Stage {
                    stage: stage.name(),
                    source,
                })?;
            debug!(
                target = SOURCE,
                op = "dispatch",
                route = route.pattern.source(),
                stage = stage.name(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Stage completed"
            );
        }
        Ok(context)
    }
}

//! The five stages every route pipeline runs, in order.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use super::{CallOptions, ProcessError};
use crate::{
    application::{
        render::{PostProcessor, RenderedPage},
        router::Stage,
        scheduler::{RenderScheduler, RenderTicket},
    },
    cache::{Freshness, SnapshotCache},
    domain::{CacheEntry, RenderArgs},
};

const SOURCE: &str = "application::processor::stages";

/// Per-call state threaded through a route pipeline.
#[derive(Debug)]
pub struct RenderContext {
    pub(crate) pathname: String,
    pub(crate) options: CallOptions,
    pub(crate) key: String,
    pub(crate) args: Option<RenderArgs>,
    pub(crate) entry: Option<CacheEntry>,
    pub(crate) freshness: Option<Freshness>,
    pub(crate) ticket: Option<RenderTicket>,
    pub(crate) page: Option<RenderedPage>,
}

impl RenderContext {
    pub(crate) fn new(pathname: &str, options: CallOptions) -> Self {
        Self {
            pathname: pathname.to_string(),
            options,
            key: String::new(),
            args: None,
            entry: None,
            freshness: None,
            ticket: None,
            page: None,
        }
    }

    fn is_fresh(&self) -> bool {
        self.freshness.is_some_and(Freshness::is_fresh)
    }

    fn stale_fallback(&self) -> Option<RenderedPage> {
        let entry = self.entry.as_ref()?;
        let snapshot = entry.payload.clone()?;
        Some(RenderedPage::from_snapshot(&entry.key, snapshot, true))
    }
}

pub(crate) fn target_url(host: &Url, pathname: &str) -> Result<Url, ProcessError> {
    host.join(pathname).map_err(|err| ProcessError::InvalidPath {
        pathname: pathname.to_string(),
        reason: err.to_string(),
    })
}

pub(crate) struct SetUpContext {
    pub(crate) key: String,
    pub(crate) route: String,
    pub(crate) host: Url,
}

#[async_trait]
impl Stage<RenderContext, ProcessError> for SetUpContext {
    fn name(&self) -> &'static str {
        "set_up_context"
    }

    async fn run(&self, mut context: RenderContext) -> Result<RenderContext, ProcessError> {
        let url = target_url(&self.host, &context.pathname)?;
        context.key = self.key.clone();
        context.args = Some(RenderArgs {
            url: url.to_string(),
            pathname: context.pathname.clone(),
            route: self.route.clone(),
            variant: context.options.query.clone(),
        });
        Ok(context)
    }
}

pub(crate) struct ReadCache {
    pub(crate) cache: SnapshotCache,
}

#[async_trait]
impl Stage<RenderContext, ProcessError> for ReadCache {
    fn name(&self) -> &'static str {
        "read_cache"
    }

    async fn run(&self, mut context: RenderContext) -> Result<RenderContext, ProcessError> {
        let entry = self.cache.read_for_dispatch(&context.key).await?;
        context.freshness = entry.as_ref().map(|entry| self.cache.freshness(entry));
        if context.freshness == Some(Freshness::Errored) {
            debug!(
                target = SOURCE,
                op = "read_cache",
                key = %context.key,
                "Last render failed; regenerating synchronously"
            );
            context.options.force = true;
            context.options.wait = true;
        }
        context.entry = entry;
        Ok(context)
    }
}

pub(crate) struct DecideAndEnqueue {
    pub(crate) scheduler: RenderScheduler,
}

#[async_trait]
impl Stage<RenderContext, ProcessError> for DecideAndEnqueue {
    fn name(&self) -> &'static str {
        "decide_and_enqueue"
    }

    async fn run(&self, mut context: RenderContext) -> Result<RenderContext, ProcessError> {
        let has_payload = context.entry.as_ref().is_some_and(CacheEntry::has_payload);
        let needs_render = context.options.force || !has_payload || !context.is_fresh();
        if !needs_render {
            return Ok(context);
        }

        let args = context
            .args
            .clone()
            .ok_or_else(|| ProcessError::Internal("render arguments missing".to_string()))?;
        let ticket = self.scheduler.enqueue(&context.key, args);
        if context.options.wait {
            context.ticket = Some(ticket);
        }
        Ok(context)
    }
}

pub(crate) struct AwaitOrReturn {
    pub(crate) wait_timeout: Duration,
}

#[async_trait]
impl Stage<RenderContext, ProcessError> for AwaitOrReturn {
    fn name(&self) -> &'static str {
        "await_or_return"
    }

    async fn run(&self, mut context: RenderContext) -> Result<RenderContext, ProcessError> {
        let Some(ticket) = context.ticket.take() else {
            let page = context
                .stale_fallback()
                .map(|mut page| {
                    page.stale = !context.is_fresh();
                    page
                })
                .ok_or_else(|| ProcessError::Unavailable {
                    key: context.key.clone(),
                })?;
            context.page = Some(page);
            return Ok(context);
        };

        let deadline = context.options.deadline.unwrap_or(self.wait_timeout);
        let failure = match ticket.outcome_within(deadline).await {
            Some(Ok(entry)) => match entry.payload {
                Some(snapshot) => {
                    context.page = Some(RenderedPage::from_snapshot(&entry.key, snapshot, false));
                    return Ok(context);
                }
                None => ProcessError::Unavailable {
                    key: context.key.clone(),
                },
            },
            Some(Err(err)) => ProcessError::Render(err),
            None => ProcessError::DeadlineElapsed {
                key: context.key.clone(),
                waited_ms: deadline.as_millis() as u64,
            },
        };

        match context.stale_fallback() {
            Some(page) => {
                warn!(
                    target = SOURCE,
                    op = "await_or_return",
                    key = %context.key,
                    error = %failure,
                    "Regeneration failed; serving stale snapshot"
                );
                context.page = Some(page);
                Ok(context)
            }
            None => Err(failure),
        }
    }
}

pub(crate) struct PostProcess {
    pub(crate) post_processor: Arc<dyn PostProcessor>,
}

#[async_trait]
impl Stage<RenderContext, ProcessError> for PostProcess {
    fn name(&self) -> &'static str {
        "post_process"
    }

    async fn run(&self, mut context: RenderContext) -> Result<RenderContext, ProcessError> {
        let page = context
            .page
            .take()
            .ok_or_else(|| ProcessError::Internal("no page to post-process".to_string()))?;
        context.page = Some(
            self.post_processor
                .process(page, &context.options.query)
                .await?,
        );
        Ok(context)
    }
}

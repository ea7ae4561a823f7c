//! Page rendering.
//!
//! A [`RenderBackend`] turns a URL into a [`crate::domain::Snapshot`]. Backends
//! never run on the request path directly: [`RenderJob`] adapts one to the
//! worker pool so each render gets the pool's isolation, timeout, and crash
//! recovery.

mod command;
mod jobs;
mod types;

pub use command::CommandRenderer;
pub(crate) use jobs::METRIC_RENDER_MS;
pub use jobs::{RENDER_JOB, RenderJob};
pub use types::{
    PassThrough, PostProcessError, PostProcessor, RenderBackend, RenderError, RenderedPage,
};

//! Routing, scheduling, and rendering services.

pub mod error;
pub mod processor;
pub mod render;
pub mod router;
pub mod scheduler;

//! Reusable utils for services that handle common behavior, like
//! initializing the tracing framework.

pub mod logging;

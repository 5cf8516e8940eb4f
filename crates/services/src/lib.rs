#![forbid(unsafe_code)]

pub mod config;
pub mod content_service;
pub mod error;
pub mod progress;
pub mod publish_service;

pub use coach_core::Clock;

pub use config::ServiceConfig;
pub use content_service::ContentService;
pub use error::{ContentError, ProgressError, PublishError};
pub use progress::{NodeProgress, ProgressService, RunOutcome};
pub use publish_service::PublishService;

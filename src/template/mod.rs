//! Key templates: turning request data into bucket keys.
//!
//! The limiter only talks to the [`TemplateEngine`] trait. [`KeyTemplateEngine`]
//! is the bundled implementation covering the references key templates need.

mod context;
mod engine;
mod key;

pub use context::RequestContext;
pub use engine::{TemplateEngine, TemplateError, Usage};
pub use key::KeyTemplateEngine;

/// Key template applied to inline limits that do not name one.
pub const DEFAULT_KEY_TEMPLATE: &str = "{{ .ClientIP }}";

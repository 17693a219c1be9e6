//! The template engine seam consumed by the limiter.

use std::fmt;

use thiserror::Error;

use super::context::RequestContext;

/// The phase of request handling a template is evaluated in.
///
/// Key templates are always evaluated before the query runs, so the limiter
/// only ever asks for [`Usage::PreQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    /// Before the SQL query executes; only request data is available
    PreQuery,
    /// After the SQL query executes; result columns are also available
    PostQuery,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usage::PreQuery => write!(f, "pre-query"),
            Usage::PostQuery => write!(f, "post-query"),
        }
    }
}

/// Errors produced while compiling or rendering a template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The template text could not be parsed
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// The template references something the engine does not know
    #[error("unknown reference {0:?}")]
    UnknownReference(String),

    /// The reference exists but cannot be used in this phase
    #[error("{reference} is not available in {usage} templates")]
    UnavailableInUsage { reference: String, usage: Usage },

    /// A `require`d value is absent from the request
    #[error("required value {0} is missing")]
    MissingValue(String),
}

/// Compiles and evaluates small string templates against a request.
pub trait TemplateEngine: Send + Sync {
    /// Check that `template` compiles and is valid for `usage`.
    fn validate(&self, template: &str, usage: Usage) -> Result<(), TemplateError>;

    /// Render `template` against `ctx`.
    fn execute_inline(
        &self,
        template: &str,
        ctx: &RequestContext,
        usage: Usage,
    ) -> Result<String, TemplateError>;
}

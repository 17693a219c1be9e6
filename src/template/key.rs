//! The bundled key template engine.
//!
//! A template is literal text interleaved with `{{ action }}` blocks:
//!
//! ```text
//! {{ .ClientIP }}
//! tenant:{{ require .Header.X-Tenant }}:{{ .Query.page | default "1" }}
//! ```
//!
//! An action is `[require] REF [| default "literal"]`, where `REF` is one of
//! `.ClientIP`, `.Method`, `.Path`, `.Header.<name>`, `.Query.<name>`,
//! `.Cookie.<name>` or `.Result.<column>` (post-query only).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::context::RequestContext;
use super::engine::{TemplateEngine, TemplateError, Usage};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A piece of request data an action reads.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    ClientIp,
    Method,
    Path,
    Header(String),
    Query(String),
    Cookie(String),
    Result(String),
}

impl Reference {
    fn parse(text: &str, offset: usize) -> Result<Self, TemplateError> {
        let body = text.strip_prefix('.').ok_or_else(|| TemplateError::Parse {
            offset,
            message: format!("expected a reference starting with '.', found {:?}", text),
        })?;

        let (root, field) = match body.split_once('.') {
            Some((root, field)) => (root, Some(field)),
            None => (body, None),
        };

        match (root, field) {
            ("ClientIP", None) => Ok(Reference::ClientIp),
            ("Method", None) => Ok(Reference::Method),
            ("Path", None) => Ok(Reference::Path),
            ("Header" | "Query" | "Cookie" | "Result", None | Some("")) => Err(TemplateError::Parse {
                offset,
                message: format!("{} requires a field name", text),
            }),
            ("Header", Some(name)) => Ok(Reference::Header(name.to_string())),
            ("Query", Some(name)) => Ok(Reference::Query(name.to_string())),
            ("Cookie", Some(name)) => Ok(Reference::Cookie(name.to_string())),
            ("Result", Some(name)) => Ok(Reference::Result(name.to_string())),
            _ => Err(TemplateError::UnknownReference(text.to_string())),
        }
    }

    fn resolve<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        let value = match self {
            Reference::ClientIp => ctx.client_ip(),
            Reference::Method => ctx.method(),
            Reference::Path => ctx.path(),
            Reference::Header(name) => ctx.header(name)?,
            Reference::Query(name) => ctx.query(name)?,
            Reference::Cookie(name) => ctx.cookie(name)?,
            Reference::Result(column) => ctx.result_column(column)?,
        };
        (!value.is_empty()).then_some(value)
    }

    fn check_usage(&self, usage: Usage) -> Result<(), TemplateError> {
        if let (Reference::Result(_), Usage::PreQuery) = (self, usage) {
            return Err(TemplateError::UnavailableInUsage {
                reference: self.to_string(),
                usage,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::ClientIp => write!(f, ".ClientIP"),
            Reference::Method => write!(f, ".Method"),
            Reference::Path => write!(f, ".Path"),
            Reference::Header(name) => write!(f, ".Header.{}", name),
            Reference::Query(name) => write!(f, ".Query.{}", name),
            Reference::Cookie(name) => write!(f, ".Cookie.{}", name),
            Reference::Result(column) => write!(f, ".Result.{}", column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Action {
    reference: Reference,
    required: bool,
    default: Option<String>,
}

impl Action {
    fn parse(body: &str, offset: usize) -> Result<Self, TemplateError> {
        let (lookup, pipe) = match body.split_once('|') {
            Some((lookup, pipe)) => (lookup, Some(pipe.trim())),
            None => (body, None),
        };

        let words: Vec<&str> = lookup.split_whitespace().collect();
        let (required, reference) = match words.as_slice() {
            [reference] => (false, Reference::parse(reference, offset)?),
            ["require", reference] => (true, Reference::parse(reference, offset)?),
            [] => {
                return Err(TemplateError::Parse {
                    offset,
                    message: "empty action".to_string(),
                })
            }
            _ => {
                return Err(TemplateError::Parse {
                    offset,
                    message: format!("unexpected action {:?}", lookup.trim()),
                })
            }
        };

        let default = match pipe {
            None => None,
            Some(pipe) => Some(Self::parse_default(pipe, offset)?),
        };

        if required && default.is_some() {
            return Err(TemplateError::Parse {
                offset,
                message: "require cannot be combined with default".to_string(),
            });
        }

        Ok(Self {
            reference,
            required,
            default,
        })
    }

    fn parse_default(pipe: &str, offset: usize) -> Result<String, TemplateError> {
        let literal = pipe
            .strip_prefix("default")
            .map(str::trim)
            .ok_or_else(|| TemplateError::Parse {
                offset,
                message: format!("unknown function in pipe {:?}", pipe),
            })?;

        literal
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .map(str::to_string)
            .ok_or_else(|| TemplateError::Parse {
                offset,
                message: format!("default expects a quoted string, found {:?}", literal),
            })
    }

    fn render(&self, ctx: &RequestContext, out: &mut String) -> Result<(), TemplateError> {
        match (self.reference.resolve(ctx), &self.default) {
            (Some(value), _) => out.push_str(value),
            (None, Some(default)) => out.push_str(default),
            (None, None) if self.required => {
                return Err(TemplateError::MissingValue(self.reference.to_string()))
            }
            (None, None) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Action(Action),
}

/// A parsed template.
#[derive(Debug)]
struct Compiled {
    segments: Vec<Segment>,
}

impl Compiled {
    fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }

            let after_open = &rest[start + OPEN.len()..];
            let end = after_open.find(CLOSE).ok_or_else(|| TemplateError::Parse {
                offset: offset + start,
                message: "unclosed action".to_string(),
            })?;

            let action = Action::parse(&after_open[..end], offset + start)?;
            segments.push(Segment::Action(action));

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    fn check_usage(&self, usage: Usage) -> Result<(), TemplateError> {
        self.actions().try_for_each(|action| action.reference.check_usage(usage))
    }

    fn actions(&self) -> impl Iterator<Item = &Action> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Action(action) => Some(action),
            Segment::Text(_) => None,
        })
    }

    fn render(&self, ctx: &RequestContext) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(action) => action.render(ctx, &mut out)?,
            }
        }
        Ok(out)
    }
}

/// Template engine for bucket keys, with a cache of compiled templates.
///
/// Templates are compiled once per distinct source text and shared across
/// threads afterwards.
#[derive(Debug, Default)]
pub struct KeyTemplateEngine {
    cache: DashMap<String, Arc<Compiled>>,
}

impl KeyTemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct templates compiled so far.
    pub fn cached_templates(&self) -> usize {
        self.cache.len()
    }

    fn compile(&self, template: &str) -> Result<Arc<Compiled>, TemplateError> {
        if let Some(compiled) = self.cache.get(template) {
            return Ok(Arc::clone(compiled.value()));
        }

        let compiled = Arc::new(Compiled::parse(template)?);
        trace!(template = %template, "Compiled key template");

        // Two threads may race to compile the same text; the first insert wins.
        let entry = self
            .cache
            .entry(template.to_string())
            .or_insert(compiled);
        Ok(Arc::clone(entry.value()))
    }
}

impl TemplateEngine for KeyTemplateEngine {
    fn validate(&self, template: &str, usage: Usage) -> Result<(), TemplateError> {
        self.compile(template)?.check_usage(usage)
    }

    fn execute_inline(
        &self,
        template: &str,
        ctx: &RequestContext,
        usage: Usage,
    ) -> Result<String, TemplateError> {
        let compiled = self.compile(template)?;
        compiled.check_usage(usage)?;
        compiled.render(ctx)
    }
}

//! Email template compilation and rendering.
//!
//! Templates are handlebars sources (a subject line plus an HTML fragment).
//! Each is compiled once on first use and cached; rendering binds the
//! template's variables, wraps the fragment in the shared layout, and derives
//! a plain-text alternative from the final HTML.
//!
//! ```ignore
//! let renderer = Renderer::new("Playdoo");
//! renderer.precompile_all()?;
//!
//! let rendered = renderer.render(&EmailTemplate::Otp(OtpVars {
//!     name: "Ada".into(),
//!     otp: "123456".into(),
//!     expires_in: "10 minutes".into(),
//!     app_name: "Playdoo".into(),
//! }))?;
//! ```
//!
//! Rendering is strict: a variable referenced by the template but absent from
//! the data is a [`TemplateError::Render`], never an empty placeholder.

mod kinds;
mod text;

pub use kinds::{
    BookingCancellationVars, BookingConfirmationVars, EmailTemplate, NotificationVars, OtpVars,
    PasswordChangedVars, PasswordResetVars, TemplateId, TemplateSource, VerificationVars,
    WelcomeVars,
};
pub use text::html_to_text;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use handlebars::{Handlebars, Template};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

const LAYOUT_NAME: &str = "__layout";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("failed to compile template {template}: {message}")]
    Compile { template: TemplateId, message: String },

    #[error("failed to render template {template}: {message}")]
    Render { template: TemplateId, message: String },
}

/// Output of a render: everything needed to compose the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Handle to a template that has been compiled into the renderer.
///
/// Compiled templates are immutable; renders only read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    pub id: TemplateId,
    subject_key: String,
    body_key: String,
}

type CompileResult = Result<Arc<CompiledTemplate>, TemplateError>;

/// Compiles and renders email templates.
///
/// The compiled cache is populated once per template and read by every
/// worker afterwards, so it sits behind a read-mostly lock.
pub struct Renderer {
    brand: String,
    sources: HashMap<TemplateId, TemplateSource>,
    registry: RwLock<Handlebars<'static>>,
    compiled: RwLock<HashMap<TemplateId, CompileResult>>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("brand", &self.brand)
            .field("templates", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Renderer {
    /// A renderer with every built-in template.
    pub fn new(brand: impl Into<String>) -> Self {
        let sources = TemplateId::ALL
            .into_iter()
            .map(|id| (id, TemplateSource::builtin(id)))
            .collect();
        Self::from_sources(brand, sources)
    }

    /// A renderer restricted to an explicit set of sources. Ids outside the
    /// set fail with [`TemplateError::NotFound`].
    pub fn from_sources(
        brand: impl Into<String>,
        sources: HashMap<TemplateId, TemplateSource>,
    ) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Built-in layout; a failure here is reported on the first render.
        if let Ok(layout) = Template::compile(kinds::LAYOUT) {
            registry.register_template(LAYOUT_NAME, layout);
        }

        Self {
            brand: brand.into(),
            sources,
            registry: RwLock::new(registry),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the source of a template. Has no effect once that template
    /// has been compiled.
    pub fn with_template(mut self, id: TemplateId, source: TemplateSource) -> Self {
        self.sources.insert(id, source);
        self
    }

    /// Ids this renderer has a source for.
    pub fn templates(&self) -> Vec<TemplateId> {
        let mut ids: Vec<_> = self.sources.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Compile a template, or return the cached result of an earlier compile.
    ///
    /// A compile failure is cached as well: a malformed source fails the same
    /// way on every call.
    pub fn compile(&self, id: TemplateId) -> Result<Arc<CompiledTemplate>, TemplateError> {
        if let Some(cached) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return cached.clone();
        }

        let mut compiled = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = compiled.get(&id) {
            return cached.clone();
        }

        let source = self
            .sources
            .get(&id)
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))?;

        let result = self.compile_source(id, source);
        match &result {
            Ok(_) => tracing::debug!(template = %id, "compiled template"),
            Err(e) => tracing::error!(template = %id, error = %e, "template failed to compile"),
        }
        compiled.insert(id, result.clone());
        result
    }

    fn compile_source(&self, id: TemplateId, source: &TemplateSource) -> CompileResult {
        let compile = |src: &str| {
            Template::compile(src).map_err(|e| TemplateError::Compile {
                template: id,
                message: e.to_string(),
            })
        };
        let subject = compile(&source.subject)?;
        let body = compile(&source.body)?;

        let handle = CompiledTemplate {
            id,
            subject_key: format!("{id}.subject"),
            body_key: format!("{id}.html"),
        };

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.register_template(&handle.subject_key, subject);
        registry.register_template(&handle.body_key, body);

        Ok(Arc::new(handle))
    }

    /// Compile every template this renderer knows. Returns the first failure.
    pub fn precompile_all(&self) -> Result<usize, TemplateError> {
        let ids = self.templates();
        for id in &ids {
            self.compile(*id)?;
        }
        tracing::info!(count = ids.len(), "precompiled email templates");
        Ok(ids.len())
    }

    /// Render a typed template.
    pub fn render(&self, template: &EmailTemplate) -> Result<Rendered, TemplateError> {
        let id = template.id();
        let vars = template.variables().map_err(|e| TemplateError::Render {
            template: id,
            message: e.to_string(),
        })?;
        self.render_value(id, &vars)
    }

    /// Render a template against raw JSON variables.
    pub fn render_value(
        &self,
        id: TemplateId,
        vars: &serde_json::Value,
    ) -> Result<Rendered, TemplateError> {
        let compiled = self.compile(id)?;
        let render_err = |e: handlebars::RenderError| TemplateError::Render {
            template: id,
            message: e.to_string(),
        };

        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let subject = registry
            .render(&compiled.subject_key, vars)
            .map_err(render_err)?;
        let subject = subject.trim().to_string();
        let content = registry
            .render(&compiled.body_key, vars)
            .map_err(render_err)?;

        let layout_data = json!({
            "subject": subject,
            "content": content,
            "brand": self.brand,
            "year": OffsetDateTime::now_utc().year(),
        });
        let html = registry
            .render(LAYOUT_NAME, &layout_data)
            .map_err(render_err)?;
        let text = html_to_text(&html);

        Ok(Rendered {
            subject,
            html,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otp() -> EmailTemplate {
        EmailTemplate::Otp(OtpVars {
            name: "Ada".into(),
            otp: "123456".into(),
            expires_in: "10 minutes".into(),
            app_name: "Playdoo".into(),
        })
    }

    #[test]
    fn compile_is_cached() {
        let renderer = Renderer::new("Playdoo");
        let first = renderer.compile(TemplateId::Otp).unwrap();
        let second = renderer.compile(TemplateId::Otp).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn render_wraps_fragment_in_layout() {
        let renderer = Renderer::new("Playdoo");
        let rendered = renderer.render(&otp()).unwrap();

        assert_eq!(rendered.subject, "Your Playdoo verification code: 123456");
        assert!(rendered.html.starts_with("<!DOCTYPE html>"));
        assert!(rendered.html.contains("<p class=\"code\">123456</p>"));
        assert!(rendered.html.contains("All rights reserved."));
        assert!(rendered.text.contains("123456"));
        assert!(!rendered.text.contains('<'));
    }

    #[test]
    fn missing_source_is_not_found() {
        let renderer = Renderer::from_sources("Playdoo", HashMap::new());
        assert_eq!(
            renderer.compile(TemplateId::Welcome).unwrap_err(),
            TemplateError::NotFound("welcome".into())
        );
    }

    #[test]
    fn malformed_source_fails_every_time() {
        let renderer = Renderer::new("Playdoo")
            .with_template(TemplateId::Welcome, TemplateSource::new("Hi", "{{#if name}}oops{{/each}}"));

        let first = renderer.compile(TemplateId::Welcome).unwrap_err();
        let second = renderer.compile(TemplateId::Welcome).unwrap_err();
        assert!(matches!(first, TemplateError::Compile { template: TemplateId::Welcome, .. }));
        assert_eq!(first, second);
        assert!(renderer.precompile_all().is_err());
    }

    #[test]
    fn html_escapes_variables_but_not_subject() {
        let renderer = Renderer::new("Playdoo");
        let rendered = renderer
            .render(&EmailTemplate::Notification(NotificationVars {
                name: "Ada".into(),
                title: "Courts & <lights>".into(),
                message: "Back on".into(),
                action_url: None,
                action_label: None,
                app_name: "Playdoo".into(),
            }))
            .unwrap();

        assert_eq!(rendered.subject, "Courts & <lights>");
        assert!(rendered.html.contains("Courts &amp; &lt;lights&gt;"));
        assert!(rendered.text.contains("Courts & <lights>"));
    }
}

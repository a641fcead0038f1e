//! Pipeline – ties together template loading, expansion, browser sessions
//! and PDF export into a single call.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::chrome::ChromeEngine;
use crate::config::ForgeConfig;
use crate::engine::Engine;
use crate::error::{ForgeError, RenderFailure, Result};
use crate::helpers::HelperRegistry;
use crate::options::RenderOptions;
use crate::render::RenderInvoker;
use crate::session::SessionManager;
use crate::template::{CompiledTemplate, TemplateEngine};
use crate::templates::{DirectorySource, EmbeddedSource, TemplateSource};
use crate::value::Value;

/// Collaborators and limits for a [`ReportForge`].
pub struct ForgeParts {
    pub templates: TemplateEngine,
    pub source: Arc<dyn TemplateSource>,
    pub sessions: SessionManager,
    pub invoker: RenderInvoker,
    pub max_concurrent_renders: usize,
    pub render_timeout: Duration,
    pub cache_templates: bool,
}

/// Turns (template name, payload, options) into verified PDF bytes.
///
/// Cheap to clone; clones share sessions, the concurrency limit and the
/// template cache.
#[derive(Clone)]
pub struct ReportForge {
    inner: Arc<ForgeInner>,
}

struct ForgeInner {
    templates: TemplateEngine,
    source: Arc<dyn TemplateSource>,
    sessions: SessionManager,
    invoker: RenderInvoker,
    renders: Semaphore,
    render_timeout: Duration,
    cache: Option<RwLock<HashMap<String, Arc<CompiledTemplate>>>>,
}

impl ReportForge {
    /// Chromium-backed forge with the built-in helpers.
    ///
    /// Templates come from `config.template_dir` when set, else the bundled
    /// samples.
    pub fn new(config: &ForgeConfig) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn TemplateSource> = match &config.template_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(ForgeError::Config(format!(
                        "template directory {} does not exist",
                        dir.display()
                    )));
                }
                Arc::new(DirectorySource::new(dir))
            }
            None => Arc::new(EmbeddedSource::builtin()),
        };
        let engine: Arc<dyn Engine> = Arc::new(ChromeEngine);
        Ok(Self::with_parts(ForgeParts {
            templates: TemplateEngine::new(Arc::new(HelperRegistry::with_builtins())),
            source,
            sessions: SessionManager::from_config(engine, &config.browser),
            invoker: RenderInvoker::new(config.browser.font_ready_timeout()),
            max_concurrent_renders: config.max_concurrent_renders,
            render_timeout: config.render_timeout(),
            cache_templates: config.cache_templates,
        }))
    }

    pub fn with_parts(parts: ForgeParts) -> Self {
        Self {
            inner: Arc::new(ForgeInner {
                templates: parts.templates,
                source: parts.source,
                sessions: parts.sessions,
                invoker: parts.invoker,
                renders: Semaphore::new(parts.max_concurrent_renders.max(1)),
                render_timeout: parts.render_timeout,
                cache: parts.cache_templates.then(|| RwLock::new(HashMap::new())),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn template_engine(&self) -> &TemplateEngine {
        &self.inner.templates
    }

    /// Load, compile and execute a template without touching the browser.
    pub fn render_html(&self, template: &str, data: &Value) -> Result<String> {
        let compiled = self.compiled(template)?;
        self.inner.templates.execute(&compiled, data)
    }

    /// Render `template` with `data` into PDF bytes.
    pub async fn generate_report(
        &self,
        template: &str,
        data: &Value,
        options: &RenderOptions,
    ) -> Result<Vec<u8>> {
        self.generate_report_with_cancel(template, data, options, &CancellationToken::new())
            .await
    }

    /// [`ReportForge::generate_report`] that stops early when `cancel` fires.
    ///
    /// Whatever the outcome, the page used for the render is closed and its
    /// session released before this returns. Hitting the render timeout
    /// cancels the call like `cancel` would.
    pub async fn generate_report_with_cancel(
        &self,
        template: &str,
        data: &Value,
        options: &RenderOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let budget = self.inner.render_timeout;
        // Fires when this call returns or is dropped, so downloads and
        // launches left on blocking threads stop too.
        let token = cancel.child_token();
        let _stop_on_exit = token.clone().drop_guard();
        let outcome = tokio::time::timeout(budget, self.run(template, data, options, &token)).await;
        match outcome {
            Ok(Ok(bytes)) => {
                log::info!(
                    "rendered '{template}' ({} bytes) in {:?}",
                    bytes.len(),
                    started.elapsed()
                );
                Ok(bytes)
            }
            Ok(Err(e)) => {
                log::warn!("report '{template}' failed: {e}");
                Err(e)
            }
            Err(_) => {
                token.cancel();
                log::warn!("report '{template}' exceeded {budget:?}");
                Err(ForgeError::render(
                    RenderFailure::Timeout,
                    format!("report did not finish within {budget:?}"),
                ))
            }
        }
    }

    async fn run(
        &self,
        template: &str,
        data: &Value,
        options: &RenderOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let _permit = tokio::select! {
            p = inner.renders.acquire() => p.map_err(|_| ForgeError::BrowserUnavailable("forge is shut down".into()))?,
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        // Template errors surface before any browser work starts.
        options.validate()?;
        let html = self.render_html(template, data)?;
        log::debug!("expanded '{template}' into {} bytes of HTML", html.len());

        let lease = inner.sessions.acquire_session(cancel).await?;
        let page = match lease.new_page().await {
            Ok(page) => page,
            Err(e) => {
                lease.release(false).await;
                return Err(e);
            }
        };

        let result = inner.invoker.render(&page, &html, options, cancel).await;
        page.close().await;
        // A crashed or cancelled session is not worth keeping.
        let reusable = match &result {
            Ok(_) => true,
            Err(e) => !matches!(
                e.render_kind(),
                Some(RenderFailure::Crash | RenderFailure::Timeout)
            ) && !e.is_cancelled(),
        };
        lease.release(reusable).await;
        result
    }

    /// Close every browser session. Later reports fail with `BrowserUnavailable`.
    pub async fn shutdown(&self) {
        self.inner.renders.close();
        self.inner.sessions.shutdown().await;
    }

    fn compiled(&self, name: &str) -> Result<Arc<CompiledTemplate>> {
        let inner = &self.inner;
        if let Some(cache) = &inner.cache {
            let hit = cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned();
            if let Some(hit) = hit {
                return Ok(hit);
            }
        }

        let source = inner.source.load(name)?;
        let compiled = Arc::new(inner.templates.compile_named(name, &source)?);

        if let Some(cache) = &inner.cache {
            cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), Arc::clone(&compiled));
        }
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineProcess, LaunchSpec};
    use crate::fetcher::{BinaryFetcher, BinarySource};
    use crate::session::SessionPolicy;

    struct NoEngine;

    impl Engine for NoEngine {
        fn name(&self) -> &str {
            "none"
        }

        fn launch(&self, _spec: &LaunchSpec) -> std::result::Result<Box<dyn EngineProcess>, String> {
            Err("no engine in unit tests".into())
        }
    }

    fn forge(source: EmbeddedSource, cache: bool) -> ReportForge {
        ReportForge::with_parts(ForgeParts {
            templates: TemplateEngine::default(),
            source: Arc::new(source),
            sessions: SessionManager::new(
                Arc::new(NoEngine),
                BinaryFetcher::new(BinarySource::System),
                LaunchSpec::default(),
                Duration::from_secs(1),
                SessionPolicy::OneShot,
            ),
            invoker: RenderInvoker::default(),
            max_concurrent_renders: 1,
            render_timeout: Duration::from_secs(5),
            cache_templates: cache,
        })
    }

    #[test]
    fn render_html_expands_template() {
        let f = forge(EmbeddedSource::new().with("t", "<p>{{name}}</p>"), false);
        let html = f.render_html("t", &Value::map([("name", "Ada")])).unwrap();
        assert_eq!(html, "<p>Ada</p>");
    }

    #[test]
    fn missing_template_is_not_found() {
        let f = forge(EmbeddedSource::new(), false);
        assert!(matches!(
            f.render_html("nope", &Value::Null).unwrap_err(),
            ForgeError::TemplateNotFound(_)
        ));
    }

    #[test]
    fn cache_reuses_compiled_template() {
        let f = forge(EmbeddedSource::new().with("t", "x"), true);
        let a = f.compiled("t").unwrap();
        let b = f.compiled("t").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let uncached = forge(EmbeddedSource::new().with("t", "x"), false);
        assert!(!Arc::ptr_eq(&uncached.compiled("t").unwrap(), &uncached.compiled("t").unwrap()));
    }

    #[tokio::test]
    async fn template_errors_come_before_browser() {
        let f = forge(EmbeddedSource::new().with("bad", "{{#each items}}x{{/if}}"), false);
        let err = f
            .generate_report("bad", &Value::Null, &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::TemplateSyntax { .. }), "{err}");
        assert_eq!(f.sessions().live_sessions(), 0);
    }

    #[tokio::test]
    async fn launch_failure_is_browser_unavailable() {
        let f = forge(EmbeddedSource::new().with("t", "hi"), false);
        let err = f
            .generate_report("t", &Value::Null, &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::BrowserUnavailable(_)), "{err}");
        assert_eq!(f.sessions().live_sessions(), 0);
    }
}

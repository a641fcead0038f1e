//! Logic-less templates on top of the `handlebars` crate.
//!
//! Compilation parses a template once; execution renders it against a
//! [`Value`] payload any number of times. The usual Handlebars syntax is
//! available: `{{path}}` (escaped), `{{{path}}}` (raw), `../` and `@root`
//! scopes, `#each` with `@index`/`@first`/`@last`/`@key`, `#if`, `#unless`,
//! `#with`, `{{else}}`, comments, and helper calls with path or literal
//! arguments.
//!
//! Paths that do not resolve render as nothing. Calling a helper that is
//! not registered fails with [`ForgeError::UnknownHelper`].

use std::fmt;
use std::sync::Arc;

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    Renderable, ScopedJson, Template, TemplateError,
};
use serde_json::Value as Json;

use crate::error::{ForgeError, Result};
use crate::helpers::{HelperFn, HelperRegistry};
use crate::value::Value;

/// A parsed template, ready to execute any number of times.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    name: String,
    template: Template,
}

impl CompiledTemplate {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Compiles and executes templates against a shared, read-only helper registry.
pub struct TemplateEngine {
    helpers: Arc<HelperRegistry>,
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(Arc::new(HelperRegistry::with_builtins()))
    }
}

impl fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("helpers", &self.helpers)
            .finish_non_exhaustive()
    }
}

impl TemplateEngine {
    pub fn new(helpers: Arc<HelperRegistry>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        for (name, helper) in helpers.iter() {
            registry.register_helper(name, Box::new(RegistryHelper(Arc::clone(helper))));
        }
        registry.register_helper("helperMissing", Box::new(MissingHelperGuard));
        registry.register_helper("blockHelperMissing", Box::new(MissingHelperGuard));
        Self { helpers, registry }
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    /// Compile an anonymous template.
    pub fn compile(&self, source: &str) -> Result<CompiledTemplate> {
        self.compile_named("<inline>", source)
    }

    /// Compile a template; `name` is used in error messages.
    pub fn compile_named(&self, name: &str, source: &str) -> Result<CompiledTemplate> {
        let template = Template::compile_with_name(source, name.to_string())
            .map_err(|e| syntax_error(name, &e))?;
        Ok(CompiledTemplate {
            name: name.to_string(),
            template,
        })
    }

    /// Execute a compiled template against `data`.
    pub fn execute(&self, compiled: &CompiledTemplate, data: &Value) -> Result<String> {
        let ctx = Context::wraps(data).map_err(|e| render_error(&compiled.name, e))?;
        let mut rc = RenderContext::new(compiled.template.name.as_ref());
        let mut out = Html(String::new());
        compiled
            .template
            .render(&self.registry, &ctx, &mut rc, &mut out)
            .map_err(|e| render_error(&compiled.name, e))?;
        Ok(out.0)
    }

    /// Compile and execute in one step.
    pub fn render(&self, name: &str, source: &str, data: &Value) -> Result<String> {
        let compiled = self.compile_named(name, source)?;
        self.execute(&compiled, data)
    }
}

// ---------------------------------------------------------------------------
// Helper plumbing
// ---------------------------------------------------------------------------

/// Exposes a registry entry to handlebars. Output is written unescaped;
/// `call_inner` serves the same text when the helper is a subexpression.
struct RegistryHelper(Arc<HelperFn>);

impl RegistryHelper {
    fn invoke(&self, h: &Helper<'_, '_>) -> String {
        let args: Vec<Json> = h.params().iter().map(|p| p.value().clone()).collect();
        (self.0)(&args)
    }
}

impl HelperDef for RegistryHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        out.write(&self.invoke(h))?;
        Ok(())
    }

    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'reg, 'rc>, RenderError> {
        Ok(ScopedJson::Derived(Json::String(self.invoke(h))))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("helper '{0}' is not registered")]
struct MissingHelper(String);

/// Reached for calls to unregistered helpers. A bare name with no arguments
/// is only a field lookup that missed, so it renders nothing.
struct MissingHelperGuard;

impl HelperDef for MissingHelperGuard {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        _: &mut dyn Output,
    ) -> HelperResult {
        if h.is_block() || !h.params().is_empty() || !h.hash().is_empty() {
            return Err(RenderError::from_error(
                "helper not registered",
                MissingHelper(h.name().to_string()),
            ));
        }
        Ok(())
    }
}

struct Html(String);

impl Output for Html {
    fn write(&mut self, seg: &str) -> std::io::Result<()> {
        self.0.push_str(seg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn syntax_error(template: &str, err: &TemplateError) -> ForgeError {
    let (line, column) = err.line_no.zip(err.column_no).unwrap_or((0, 0));
    ForgeError::TemplateSyntax {
        template: template.to_string(),
        line,
        column,
        message: err.reason().to_string(),
    }
}

fn render_error(template: &str, err: RenderError) -> ForgeError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(MissingHelper(name)) = cause.downcast_ref::<MissingHelper>() {
            return ForgeError::UnknownHelper {
                name: name.clone(),
                template: template.to_string(),
            };
        }
        source = cause.source();
    }
    ForgeError::TemplateSyntax {
        template: template.to_string(),
        line: err.line_no.unwrap_or(0),
        column: err.column_no.unwrap_or(0),
        message: err.desc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(Arc::new(
            HelperRegistry::builder()
                .builtins_with_clock(|| NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
                .build(),
        ))
    }

    fn render(src: &str, data: &Value) -> String {
        engine().render("test", src, data).unwrap()
    }

    fn json(text: &str) -> Value {
        Value::from_json_str(text).unwrap()
    }

    #[test]
    fn substitutes_nested_paths() {
        let data = Value::map([("seller", Value::map([("name", "Acme")]))]);
        assert_eq!(render("<b>{{seller.name}}</b>", &data), "<b>Acme</b>");
    }

    #[test]
    fn missing_fields_render_empty() {
        let data = Value::map([("a", 1)]);
        assert_eq!(render("[{{b}}][{{a.x.y}}]", &data), "[][]");
    }

    #[test]
    fn escapes_by_default_and_triple_braces_are_raw() {
        let data = Value::map([("html", "<i>x</i> & 'y'")]);
        assert_eq!(
            render("{{html}}", &data),
            "&lt;i&gt;x&lt;/i&gt; &amp; &#x27;y&#x27;"
        );
        assert_eq!(render("{{{html}}}", &data), "<i>x</i> & 'y'");
    }

    #[test]
    fn helper_calls_receive_typed_arguments() {
        let data = Value::map([
            ("price", Value::decimal("150.00").unwrap()),
            ("qty", Value::Int(2)),
            ("issued", Value::Date(NaiveDate::from_ymd_opt(2023, 10, 27).unwrap())),
        ]);
        assert_eq!(
            render("{{multiply price qty}}|{{formatDate issued}}|{{formatCurrency price}}", &data),
            "300.00|October 27, 2023|$150.00"
        );
    }

    #[test]
    fn plain_json_numbers_keep_scale_in_output() {
        let data = json(r#"{"Price": 150.00, "Quantity": 2}"#);
        assert_eq!(render("{{multiply Price Quantity}}|{{Price}}", &data), "300.00|150.00");
    }

    #[test]
    fn helper_with_literal_arguments() {
        assert_eq!(render("{{multiply \"2.50\" 4}}", &Value::Null), "10.00");
        assert_eq!(render("{{multiply \"x\" 2}}", &Value::Null), "");
    }

    #[test]
    fn helper_as_subexpression() {
        let data = Value::map([("price", Value::decimal("75.50").unwrap()), ("qty", Value::Int(5))]);
        assert_eq!(
            render("{{formatCurrency (multiply price qty)}}", &data),
            "$377.50"
        );
    }

    #[test]
    fn helper_output_is_not_escaped() {
        let helpers = HelperRegistry::builder()
            .register("bold", |args: &[Json]| {
                format!("<b>{}</b>", args.first().and_then(Json::as_str).unwrap_or_default())
            })
            .build();
        let out = TemplateEngine::new(Arc::new(helpers))
            .render("t", "{{bold name}}", &Value::map([("name", "A&B")]))
            .unwrap();
        assert_eq!(out, "<b>A&B</b>");
    }

    #[test]
    fn zero_arg_helper_runs_at_execution() {
        assert_eq!(render("Generated {{now}}", &Value::Null), "Generated 2025-06-01");
    }

    #[test]
    fn unknown_helper_is_an_error() {
        let err = engine()
            .render("inv", "{{shout name}}", &Value::Null)
            .unwrap_err();
        assert!(matches!(
            err,
            ForgeError::UnknownHelper { ref name, ref template } if name == "shout" && template == "inv"
        ));
    }

    #[test]
    fn unknown_helper_inside_a_loop_is_an_error() {
        let data = Value::map([("items", Value::list(vec!["a"]))]);
        let err = engine()
            .render("inv", "{{#each items}}{{shout this}}{{/each}}", &data)
            .unwrap_err();
        assert!(matches!(err, ForgeError::UnknownHelper { ref name, .. } if name == "shout"));
    }

    #[test]
    fn bare_unknown_name_is_a_field_lookup() {
        let data = Value::map([("shout", "hey")]);
        assert_eq!(render("{{shout}}", &data), "hey");
    }

    #[test]
    fn each_over_list_with_loop_variables() {
        let data = Value::map([("items", Value::list(vec!["a", "b", "c"]))]);
        let out = render(
            "{{#each items}}{{@index}}={{this}}{{#if @last}}.{{else}},{{/if}}{{/each}}",
            &data,
        );
        assert_eq!(out, "0=a,1=b,2=c.");
    }

    #[test]
    fn each_over_root_list() {
        let users = Value::list(vec![
            Value::map([("Name", "John")]),
            Value::map([("Name", "Jane")]),
        ]);
        assert_eq!(render("{{#each this}}<td>{{Name}}</td>{{/each}}", &users), "<td>John</td><td>Jane</td>");
    }

    #[test]
    fn each_over_map_keeps_payload_order() {
        let data = json(r#"{"m": {"zeta": 1, "alpha": 2}}"#);
        assert_eq!(render("{{#each m}}{{@key}}:{{this}};{{/each}}", &data), "zeta:1;alpha:2;");
    }

    #[test]
    fn each_else_on_empty_or_missing() {
        let data = Value::map([("items", Value::List(vec![]))]);
        assert_eq!(render("{{#each items}}x{{else}}none{{/each}}", &data), "none");
        assert_eq!(render("{{#each missing}}x{{else}}none{{/each}}", &data), "none");
    }

    #[test]
    fn parent_and_root_scopes() {
        let data = Value::map([
            ("currency", Value::from("USD")),
            ("items", Value::list(vec![Value::map([("n", "w")])])),
        ]);
        assert_eq!(
            render("{{#each items}}{{n}}-{{../currency}}-{{@root.currency}}{{/each}}", &data),
            "w-USD-USD"
        );
    }

    #[test]
    fn with_and_unless() {
        let data = Value::map([("addr", Value::map([("city", "Gotham")])), ("paid", false.into())]);
        assert_eq!(
            render("{{#with addr}}{{city}}{{/with}}{{#unless paid}} due{{/unless}}", &data),
            "Gotham due"
        );
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(render("a{{! note }}b{{!-- {{x}} --}}c", &Value::Null), "abc");
    }

    #[test]
    fn output_has_no_leftover_placeholders() {
        let data = Value::map([("a", Value::from("1")), ("b", Value::map([("c", 2)]))]);
        let out = render("{{a}} {{b.c}} {{#if a}}{{{a}}}{{/if}}", &data);
        assert!(!out.contains("{{") && !out.contains("}}"), "{out}");
    }

    #[test]
    fn malformed_templates_are_syntax_errors() {
        for src in ["Hello {{name", "{{#each items}}x{{/if}}"] {
            let err = engine().compile_named("bad", src).unwrap_err();
            assert!(
                matches!(err, ForgeError::TemplateSyntax { ref template, .. } if template == "bad"),
                "{src}: {err:?}"
            );
        }
    }

    #[test]
    fn syntax_error_reports_line() {
        let err = engine().compile_named("t", "line one\n  {{name").unwrap_err();
        match err {
            ForgeError::TemplateSyntax { template, line, .. } => {
                assert_eq!(template, "t");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unregistered_partial_fails_at_execution() {
        let e = engine();
        let compiled = e.compile_named("p", "{{> footer}}").unwrap();
        let err = e.execute(&compiled, &Value::Null).unwrap_err();
        assert!(matches!(err, ForgeError::TemplateSyntax { ref template, .. } if template == "p"));
    }

    #[test]
    fn compiled_template_is_reusable() {
        let e = engine();
        let t = e.compile("{{n}}").unwrap();
        assert_eq!(e.execute(&t, &Value::map([("n", 1)])).unwrap(), "1");
        assert_eq!(e.execute(&t, &Value::map([("n", 2)])).unwrap(), "2");
    }
}

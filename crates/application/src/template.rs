//! Job spec templating
//!
//! User job specs are text templates rendered over the job's metadata
//! before YAML decoding. The helper set is frozen; user specs depend on
//! it: `lower`, `upper`, `default`, `indent`, `quote`, `now`.

use std::collections::HashMap;

use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
};
use serde::Serialize;

use kiln_domain::{DomainError, DomainResult, JobMetadata, Repository};

/// The values a job template may reference.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContext {
    pub name: String,
    pub owner: String,
    pub repository: Repository,
    pub trigger: String,
    pub annotations: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new(name: &str, metadata: &JobMetadata) -> Self {
        let annotations = metadata
            .annotations
            .iter()
            .map(|a| (a.key.clone(), a.value.clone()))
            .collect();
        TemplateContext {
            name: name.to_string(),
            owner: metadata.owner.clone(),
            repository: metadata.repository.clone(),
            trigger: metadata.trigger.as_str().to_string(),
            annotations,
        }
    }
}

handlebars_helper!(lower: |s: str| s.to_lowercase());
handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(indent: |s: str, n: u64| {
    let pad = " ".repeat(n as usize);
    s.lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
});
handlebars_helper!(quote: |s: str| serde_json::to_string(s).unwrap_or_default());
handlebars_helper!(default: |v: Json, fallback: str| {
    match v {
        serde_json::Value::Null => fallback.to_string(),
        serde_json::Value::String(s) if s.is_empty() => fallback.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
});

fn now_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

fn engine() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("lower", Box::new(lower));
    hb.register_helper("upper", Box::new(upper));
    hb.register_helper("indent", Box::new(indent));
    hb.register_helper("quote", Box::new(quote));
    hb.register_helper("default", Box::new(default));
    hb.register_helper("now", Box::new(now_helper));
    hb
}

/// Renders a job YAML template. Errors surface as `InvalidSpec` and fail
/// the run.
pub fn render(job_yaml: &str, ctx: &TemplateContext) -> DomainResult<String> {
    engine()
        .render_template(job_yaml, ctx)
        .map_err(|e| DomainError::InvalidSpec(format!("cannot render job template: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_domain::Annotation;
    use pretty_assertions::assert_eq;

    fn metadata() -> JobMetadata {
        JobMetadata {
            owner: "Jane".to_string(),
            repository: Repository {
                host: "github.com".to_string(),
                owner: "acme".to_string(),
                repo: "widgets".to_string(),
                ref_: "refs/heads/main".to_string(),
                revision: "cafe".to_string(),
            },
            annotations: vec![
                Annotation {
                    key: "variant".to_string(),
                    value: "nightly".to_string(),
                },
                Annotation {
                    key: "script".to_string(),
                    value: "a\nb".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn context_fields_render() {
        let ctx = TemplateContext::new("job-1", &metadata());
        let out = render("{{name}} {{owner}} {{repository.repo}} {{trigger}}", &ctx).unwrap();
        assert_eq!(out, "job-1 Jane widgets unknown");
    }

    #[test]
    fn annotations_are_addressable() {
        let ctx = TemplateContext::new("job-1", &metadata());
        let out = render("variant={{annotations.variant}}", &ctx).unwrap();
        assert_eq!(out, "variant=nightly");
    }

    #[test]
    fn helpers_do_their_thing() {
        let ctx = TemplateContext::new("job-1", &metadata());
        assert_eq!(render("{{lower owner}}", &ctx).unwrap(), "jane");
        assert_eq!(render("{{upper owner}}", &ctx).unwrap(), "JANE");
        assert_eq!(
            render("{{default annotations.missing \"fallback\"}}", &ctx).unwrap(),
            "fallback"
        );
        assert_eq!(render("{{quote owner}}", &ctx).unwrap(), "\"Jane\"");
    }

    #[test]
    fn indent_pads_every_line() {
        let ctx = TemplateContext::new("job-1", &metadata());
        let out = render("{{indent annotations.script 2}}", &ctx).unwrap();
        assert_eq!(out, "  a\n  b");
    }

    #[test]
    fn broken_templates_are_spec_errors() {
        let ctx = TemplateContext::new("job-1", &metadata());
        let err = render("{{#if}}", &ctx).unwrap_err();
        assert!(matches!(err, DomainError::InvalidSpec(_)));
    }
}

//! Message templates: `{{var}}` substitution, `{{#if}}` / `{{#each}}` blocks
//! and an optional YAML frontmatter header carrying `subject` / `from`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::expand_home;

pub const DEFAULT_TEMPLATE_DIR: &str = "~/.mailgoat/templates";
const TEMPLATE_EXT: &str = "hbs";

pub type Context = Map<String, Value>;

static EACH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{#each\s+([\w.]+)\}\}(.*?)\{\{/each\}\}").expect("valid each pattern")
});
static IF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{#if\s+([\w.]+)\}\}(.*?)(?:\{\{else\}\}(.*?))?\{\{/if\}\}")
        .expect("valid if pattern")
});
static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("valid variable pattern"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9]*)\b[^>]*?(/?)>").expect("valid tag pattern")
});

const VOID_TAGS: &[&str] = &["br", "hr", "img", "meta", "link", "input"];

pub const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "welcome",
        r#"---
subject: "Welcome to {{appName}}!"
from: noreply@example.com
---
Hi {{name}},

Welcome to {{appName}}! Your account is ready.

{{#if isPro}}
You're on the Pro plan. Enjoy premium features!
{{else}}
Upgrade to Pro for advanced features.
{{/if}}

Best regards,
The {{appName}} Team
"#,
    ),
    (
        "notification",
        r#"---
subject: "Notification: {{title}}"
from: noreply@example.com
---
Hello {{name}},

{{message}}

Time: {{timestamp}}
"#,
    ),
    (
        "report",
        r#"---
subject: "Report for {{period}}"
from: reports@example.com
---
Report summary for {{period}}:

{{#each rows}}
- {{name}}: {{value}}
{{/each}}
"#,
    ),
    (
        "error",
        r#"---
subject: "Error Alert: {{service}}"
from: alerts@example.com
---
Service: {{service}}
Severity: {{severity}}
Details: {{details}}
{{#if action}}Action: {{action}}{{/if}}
"#,
    ),
];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("template frontmatter is not closed")]
    UnclosedFrontmatter,
    #[error("template frontmatter must be a YAML object")]
    FrontmatterNotMapping,
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TemplateError + '_ {
    move |source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub path: PathBuf,
    pub metadata: Map<String, Value>,
    pub body: String,
}

impl Template {
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(crate::model::value_to_text)
    }
}

/// Resolve the template directory, defaulting to `~/.mailgoat/templates`.
pub fn template_dir(path: Option<&str>) -> PathBuf {
    PathBuf::from(expand_home(path.unwrap_or(DEFAULT_TEMPLATE_DIR)))
}

/// Write the builtin templates into `dir` unless a file of the same name exists.
pub fn ensure_builtin_templates(dir: &Path) -> Result<(), TemplateError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    for (name, content) in BUILTIN_TEMPLATES {
        let target = dir.join(format!("{name}.{TEMPLATE_EXT}"));
        if !target.exists() {
            fs::write(&target, content).map_err(io_err(&target))?;
        }
    }
    Ok(())
}

pub fn list_templates(dir: &Path) -> Result<Vec<String>, TemplateError> {
    ensure_builtin_templates(dir)?;
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub fn load_template(name: &str, dir: &Path) -> Result<Template, TemplateError> {
    ensure_builtin_templates(dir)?;
    let path = dir.join(format!("{name}.{TEMPLATE_EXT}"));
    if !path.exists() {
        return Err(TemplateError::NotFound(name.to_string()));
    }
    let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
    let (metadata, body) = split_frontmatter(&raw)?;
    Ok(Template {
        name: name.to_string(),
        path,
        metadata,
        body,
    })
}

pub fn create_template(
    name: &str,
    subject: &str,
    from_address: &str,
    body: &str,
    dir: &Path,
) -> Result<PathBuf, TemplateError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let target = dir.join(format!("{name}.{TEMPLATE_EXT}"));
    let mut header = Map::new();
    header.insert("subject".into(), Value::String(subject.to_string()));
    header.insert("from".into(), Value::String(from_address.to_string()));
    let header = serde_yaml::to_string(&header)?;
    let content = format!("---\n{header}---\n{body}\n");
    fs::write(&target, content).map_err(io_err(&target))?;
    Ok(target)
}

/// Split a `---\n<yaml>\n---\n` header from the body. Text without a header
/// is returned whole with empty metadata.
pub fn split_frontmatter(raw: &str) -> Result<(Map<String, Value>, String), TemplateError> {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return Ok((Map::new(), raw.to_string()));
    };
    const MARKER: &str = "\n---\n";
    let index = rest.find(MARKER).ok_or(TemplateError::UnclosedFrontmatter)?;
    let header = &rest[..index];
    let body = &rest[index + MARKER.len()..];

    if header.trim().is_empty() {
        return Ok((Map::new(), body.to_string()));
    }
    match serde_yaml::from_str::<Value>(header)? {
        Value::Object(map) => Ok((map, body.to_string())),
        Value::Null => Ok((Map::new(), body.to_string())),
        _ => Err(TemplateError::FrontmatterNotMapping),
    }
}

/// Build a variable context from an optional JSON file plus `key=value` items.
/// Items override file entries.
pub fn parse_vars(items: &[String], vars_file: Option<&Path>) -> Result<Context, TemplateError> {
    let mut vars = Context::new();
    if let Some(path) = vars_file {
        let raw = fs::read_to_string(path).map_err(io_err(path))?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => vars.extend(map),
            _ => {
                return Err(TemplateError::Invalid(
                    "vars file must contain a JSON object".into(),
                ))
            }
        }
    }
    for item in items {
        let Some((key, value)) = item.split_once('=') else {
            return Err(TemplateError::Invalid(format!(
                "invalid --var format: {item} (expected key=value)"
            )));
        };
        vars.insert(key.to_string(), coerce_value(value));
    }
    Ok(vars)
}

fn coerce_value(value: &str) -> Value {
    let lowered = value.to_ascii_lowercase();
    match lowered.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if value.contains('.') {
        if let Some(n) = value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(n);
        }
    } else if let Ok(n) = value.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(value.to_string())
}

/// Render a template body and report variables left unresolved.
pub fn render_template(template: &Template, vars: &Context) -> (String, Vec<String>) {
    let rendered = render_text(&template.body, vars);
    let unresolved = unresolved_variables(&rendered);
    let mut warnings = Vec::new();
    if !unresolved.is_empty() {
        warnings.push(format!("unresolved variables: {}", unresolved.join(", ")));
    }
    (rendered, warnings)
}

/// Render unresolved warnings plus HTML tag-balance problems.
pub fn validate_template(template: &Template, vars: &Context) -> Vec<String> {
    let (body, mut errors) = render_template(template, vars);
    let is_html_file = matches!(
        template.path.extension().and_then(|e| e.to_str()),
        Some("html") | Some("htm")
    );
    if is_html_file || body.to_lowercase().contains("<html") || body.contains("</") {
        errors.extend(check_html_balance(&body));
    }
    errors
}

/// Render `#each` and `#if` blocks, then variables. Each block is expanded
/// once from the template text; substituted values are never parsed again.
pub fn render_text(text: &str, ctx: &Context) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while pos < text.len() {
        let each = EACH_RE.captures_at(text, pos);
        let cond = IF_RE.captures_at(text, pos);
        let start_of = |caps: &Option<Captures>| caps.as_ref().and_then(|c| c.get(0)).map(|m| m.start());
        let (caps, is_each) = match (start_of(&each), start_of(&cond)) {
            (Some(e), Some(i)) if i < e => (cond, false),
            (Some(_), _) => (each, true),
            (None, Some(_)) => (cond, false),
            (None, None) => break,
        };
        let Some(caps) = caps else { break };
        let Some(whole) = caps.get(0) else { break };

        out.push_str(&render_vars(&text[pos..whole.start()], ctx));
        if is_each {
            out.push_str(&render_each(&caps, ctx));
        } else {
            out.push_str(&render_if(&caps, ctx));
        }
        pos = whole.end();
    }
    if pos < text.len() {
        out.push_str(&render_vars(&text[pos..], ctx));
    }
    out
}

fn render_each(caps: &Captures, ctx: &Context) -> String {
    let block = caps.get(2).map_or("", |m| m.as_str());
    match resolve(ctx, &caps[1]) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let mut child = ctx.clone();
                child.insert("this".into(), item.clone());
                if let Value::Object(fields) = item {
                    child.extend(fields.clone());
                }
                render_text(block, &child)
            })
            .collect(),
        _ => String::new(),
    }
}

fn render_if(caps: &Captures, ctx: &Context) -> String {
    let chosen = if resolve(ctx, &caps[1]).is_some_and(is_truthy) {
        caps.get(2).map_or("", |m| m.as_str())
    } else {
        caps.get(3).map_or("", |m| m.as_str())
    };
    render_text(chosen, ctx)
}

fn render_vars(text: &str, ctx: &Context) -> String {
    VAR_RE
        .replace_all(text, |caps: &Captures| match resolve(ctx, &caps[1]) {
            None | Some(Value::Null) => caps[0].to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

fn resolve<'a>(ctx: &'a Context, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = ctx.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn unresolved_variables(rendered: &str) -> Vec<String> {
    let mut names: Vec<String> = VAR_RE
        .captures_iter(rendered)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn check_html_balance(body: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    let mut errors = Vec::new();
    for caps in TAG_RE.captures_iter(body) {
        let closing = !caps[1].is_empty();
        let self_closing = !caps[3].is_empty();
        let tag = caps[2].to_ascii_lowercase();
        if self_closing || (!closing && VOID_TAGS.contains(&tag.as_str())) {
            continue;
        }
        if !closing {
            stack.push(tag);
            continue;
        }
        match stack.pop() {
            None => errors.push(format!("closing tag without opener: {tag}")),
            Some(open) if open != tag => {
                errors.push(format!("mismatched tag: expected </{open}> got </{tag}>"))
            }
            Some(_) => {}
        }
    }
    if !stack.is_empty() {
        errors.push(format!("unclosed tags: {}", stack.join(", ")));
    }
    errors
}

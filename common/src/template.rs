use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Parameter map fed to the renderer. Values are already stringified.
pub type Params = BTreeMap<String, String>;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

/// Replace every `{{key}}` occurrence with the matching parameter value.
///
/// Substitution is a single pass over the template: substituted text is never
/// re-expanded, so the result is independent of parameter order. Placeholders
/// whose key is absent from `params` are left untouched.
pub fn render_str(template: &str, params: &Params) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match params.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render a template file in place.
pub async fn render_file(path: &Path, params: &Params) -> std::io::Result<()> {
    let raw = tokio::fs::read_to_string(path).await?;
    tokio::fs::write(path, render_str(&raw, params)).await
}

/// Prefix every key with `{ns}.` so parameter sets can be layered without
/// collisions (`app.name`, `service.version`, `component.image-name`).
pub fn namespace_params(ns: &str, params: Params) -> Params {
    params
        .into_iter()
        .map(|(key, value)| (format!("{ns}.{key}"), value))
        .collect()
}

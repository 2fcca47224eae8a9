//! Per-channel message templates.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::events::TemplateType;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());

/// Channel type → template type → template string.
///
/// Only overrides are stored; anything missing falls back to the built-in
/// template for the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateConfig(HashMap<String, HashMap<String, String>>);

impl TemplateConfig {
    pub fn set(
        &mut self,
        channel_type: impl Into<String>,
        template_type: TemplateType,
        template: impl Into<String>,
    ) {
        self.0
            .entry(channel_type.into())
            .or_default()
            .insert(template_type.to_string(), template.into());
    }

    /// The template to use for a channel, falling back to the default.
    pub fn resolve(&self, channel_type: &str, template_type: TemplateType) -> &str {
        self.0
            .get(channel_type)
            .and_then(|templates| templates.get(template_type.as_ref()))
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_template(channel_type, template_type))
    }
}

/// Replace every `{{field}}` with the matching payload field.
///
/// Values pass through `escape` before insertion. Unknown fields render as
/// an empty string.
pub fn render(template: &str, payload: &serde_json::Value, escape: fn(&str) -> String) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let value = match payload.get(&caps[1]) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            escape(&value)
        })
        .into_owned()
}

fn default_template(channel_type: &str, template_type: TemplateType) -> &'static str {
    match (channel_type, template_type) {
        ("telegram", TemplateType::TaskCompleted) => {
            "✅ <b>{{task_name}}</b> finished\n\
             Scanned {{total}}, generated {{generated}}, overwritten {{overwritten}}, skipped {{skipped}}\n\
             Metadata {{metadata}}, subtitles {{subtitle}}, failed {{failed}}\n\
             <i>{{finished_at}} ({{duration_ms}} ms)</i>"
        }
        ("telegram", TemplateType::TaskFailed) => {
            "❌ <b>{{task_name}}</b> failed\n{{error}}\n{{message}}\n<i>{{finished_at}}</i>"
        }
        ("telegram", TemplateType::TaskCancelled) => {
            "⏹ <b>{{task_name}}</b> cancelled\n{{message}}\n<i>{{finished_at}}</i>"
        }
        ("telegram", TemplateType::Test) => "🔔 <b>strm-sync</b> test notification",
        ("wework", TemplateType::TaskCompleted) => {
            "### {{task_name}} finished\n\
             > Scanned: {{total}}\n\
             > Generated: <font color=\"info\">{{generated}}</font>\n\
             > Overwritten: {{overwritten}}\n\
             > Skipped: {{skipped}}\n\
             > Metadata: {{metadata}}, subtitles: {{subtitle}}\n\
             > Failed: <font color=\"warning\">{{failed}}</font>\n\
             > {{finished_at}}"
        }
        ("wework", TemplateType::TaskFailed) => {
            "### {{task_name}} <font color=\"warning\">failed</font>\n> {{error}}\n> {{message}}\n> {{finished_at}}"
        }
        ("wework", TemplateType::TaskCancelled) => {
            "### {{task_name}} cancelled\n> {{message}}\n> {{finished_at}}"
        }
        ("wework", TemplateType::Test) => "### strm-sync test notification",
        (_, TemplateType::TaskCompleted) => "{{task_name}} finished: {{message}}",
        (_, TemplateType::TaskFailed) => "{{task_name}} failed: {{error}}",
        (_, TemplateType::TaskCancelled) => "{{task_name}} cancelled: {{message}}",
        (_, TemplateType::Test) => "strm-sync test notification",
    }
}

/// Escape `&`, `<` and `>` for HTML parse mode.
pub fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn no_escape(value: &str) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_placeholders() {
        let payload = json!({"task_name": "movies", "generated": 4, "error": null});
        let out = render(
            "{{task_name}}: {{ generated }} new, err={{error}} {{unknown}}",
            &payload,
            no_escape,
        );
        assert_eq!(out, "movies: 4 new, err= ");
    }

    #[test]
    fn test_render_escapes_values_only() {
        let payload = json!({"task_name": "<b>&x"});
        let out = render("<b>{{task_name}}</b>", &payload, escape_html);
        assert_eq!(out, "<b>&lt;b&gt;&amp;x</b>");
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let mut templates = TemplateConfig::default();
        templates.set("webhook", TemplateType::TaskFailed, "custom {{error}}");
        assert_eq!(
            templates.resolve("webhook", TemplateType::TaskFailed),
            "custom {{error}}"
        );
        assert!(
            templates
                .resolve("telegram", TemplateType::TaskFailed)
                .contains("{{task_name}}")
        );
        assert!(
            templates
                .resolve("wework", TemplateType::TaskCompleted)
                .starts_with("###")
        );
    }

    #[test]
    fn test_serde_transparent() {
        let parsed: TemplateConfig =
            serde_json::from_str(r#"{"telegram":{"task_completed":"done"}}"#).unwrap();
        assert_eq!(
            parsed.resolve("telegram", TemplateType::TaskCompleted),
            "done"
        );
        assert_eq!(serde_json::to_string(&TemplateConfig::default()).unwrap(), "{}");
    }
}

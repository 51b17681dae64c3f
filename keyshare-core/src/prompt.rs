use std::collections::HashMap;

use serde::Serialize;

/// Values available to prompt label templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    /// Display name of the bundle being unlocked (usually its file name).
    pub file: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Substitute `{{name}}` placeholders.  Unknown or unterminated
/// placeholders are copied through exactly as written.
pub fn render_template(template: &str, context: &PromptContext) -> String {
    let attempt = context.attempt.to_string();
    let mut values = HashMap::new();
    values.insert("file", context.file.as_str());
    values.insert("attempt", attempt.as_str());

    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        output.push_str(&rest[..open]);
        match values.get(after_open[..close].trim()) {
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    output.push_str(rest);
    output
}

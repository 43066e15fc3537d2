//! Override template rendering.
//!
//! Templates use `{placeholder}` substitution over message fields. `{{` and
//! `}}` produce literal braces. An unknown placeholder or an unbalanced brace
//! is a configuration error, which makes the delivery fail permanently.

use crate::error::DispatchError;
use crate::pipeline::types::IncomingMessage;

/// Placeholders a template may reference.
pub const PLACEHOLDERS: &[&str] = &[
    "body",
    "from_number",
    "to_number",
    "endpoint_id",
    "received_at",
    "message_id",
];

/// Render `template` for `message`.
pub fn render(template: &str, message: &IncomingMessage) -> Result<String, DispatchError> {
    let mut out = String::with_capacity(template.len() + message.body.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(DispatchError::ConfigInvalid(format!(
                        "unclosed placeholder at offset {pos} in template"
                    )));
                }
                out.push_str(&lookup(name.trim(), message)?);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(DispatchError::ConfigInvalid(format!(
                        "unmatched '}}' at offset {pos} in template"
                    )));
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn lookup(name: &str, message: &IncomingMessage) -> Result<String, DispatchError> {
    let value = match name {
        "body" => message.body.clone(),
        "from_number" => message.from_number.clone(),
        "to_number" => message.to_number.clone(),
        "endpoint_id" => message.endpoint_id.clone(),
        "received_at" => message.received_at.to_rfc3339(),
        "message_id" => message.id.clone(),
        other => {
            return Err(DispatchError::ConfigInvalid(format!(
                "unknown template placeholder '{{{other}}}' (known: {})",
                PLACEHOLDERS.join(", ")
            )));
        }
    };
    Ok(value)
}

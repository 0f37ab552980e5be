// src/render/template.rs

//! `{NAME}` placeholder substitution.
//!
//! `{{` and `}}` render as literal braces, so proxy and SQL templates can keep
//! their own block syntax. Every placeholder must resolve.

use thiserror::Error;

/// Template substitution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Placeholder has no value
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),

    /// Lone brace at the given offset
    #[error("unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),

    /// Placeholder name is malformed at the given offset
    #[error("invalid placeholder name {0:?} at byte {1}")]
    InvalidName(String, usize),
}

/// Substitutes every `{NAME}` in `template` with `lookup(NAME)`
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, ch)) if ch != '{' && ch != '\n' => name.push(ch),
                        _ => return Err(TemplateError::UnbalancedBrace(pos)),
                    }
                }

                let valid = name
                    .chars()
                    .next()
                    .map(|first| first.is_ascii_alphabetic() || first == '_')
                    .unwrap_or(false)
                    && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
                if !valid {
                    return Err(TemplateError::InvalidName(name, pos));
                }

                let value = lookup(&name).ok_or(TemplateError::UnknownPlaceholder(name))?;
                out.push_str(&value);
            }
            '}' => return Err(TemplateError::UnbalancedBrace(pos)),
            c => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DIR_NAME" => Some("blog_7".to_string()),
            "SUBDOMAIN" => Some("blog".to_string()),
            _ => None,
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        assert_eq!(render("WORKDIR /{DIR_NAME}\n", lookup).unwrap(), "WORKDIR /blog_7\n");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let rendered = render("server {{ server_name {SUBDOMAIN}.ewdbot.com; }}", lookup).unwrap();
        assert_eq!(rendered, "server { server_name blog.ewdbot.com; }");
    }

    #[test]
    fn unknown_placeholders_fail() {
        assert_eq!(
            render("{DATABASE_NAME}", lookup),
            Err(TemplateError::UnknownPlaceholder("DATABASE_NAME".to_string()))
        );
    }

    #[test]
    fn stray_braces_fail() {
        assert!(matches!(render("server { listen 80; }", lookup), Err(TemplateError::InvalidName(..))));
        assert!(matches!(render("a } b", lookup), Err(TemplateError::UnbalancedBrace(2))));
        assert!(matches!(render("{DIR_NAME", lookup), Err(TemplateError::UnbalancedBrace(0))));
    }

    #[test]
    fn non_ascii_text_passes_through() {
        assert_eq!(render("-- база {DIR_NAME}", lookup).unwrap(), "-- база blog_7");
    }
}

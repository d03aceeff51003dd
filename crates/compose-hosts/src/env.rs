use std::collections::HashMap;
use thiserror::Error;

/// Source of values for `$NAME` placeholders.
pub(crate) trait Env: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// The environment of this process.
pub(crate) struct ProcessEnv;

impl Env for ProcessEnv {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Env for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unset environment variables used: {names:?}")]
pub(crate) struct ResolutionError {
    /// Unset names in order of first occurrence.
    pub(crate) names: Vec<String>,
    /// The template with every resolvable placeholder substituted.
    pub(crate) partial: String,
}

/// Substitutes `$NAME` and `${NAME}` placeholders from `env`.
///
/// Unset placeholders stay in the output exactly as written and make the
/// whole expansion fail. A `$` that does not start a placeholder is kept.
pub(crate) fn expand(template: &str, env: &dyn Env) -> Result<String, ResolutionError> {
    let mut out = String::with_capacity(template.len());
    let mut unresolved: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let Some((name, len)) = placeholder(after) else {
            out.push('$');
            rest = after;
            continue;
        };
        match env.lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..len]);
                if !unresolved.iter().any(|seen| seen == name) {
                    unresolved.push(name.to_string());
                }
            }
        }
        rest = &after[len..];
    }
    out.push_str(rest);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(ResolutionError {
            names: unresolved,
            partial: out,
        })
    }
}

// Returns the name and how many bytes after the `$` the placeholder spans.
fn placeholder(after: &str) -> Option<(&str, usize)> {
    if let Some(braced) = after.strip_prefix('{') {
        let close = braced.find('}')?;
        if close == 0 {
            return None;
        }
        return Some((&braced[..close], close + 2));
    }
    let len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if len == 0 {
        None
    } else {
        Some((&after[..len], len))
    }
}

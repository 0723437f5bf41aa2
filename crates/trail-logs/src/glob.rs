//! Path globs compiled to regular expressions.
//!
//! Supported syntax:
//!
//! - `*` matches any run of characters inside one path segment
//! - `**` matches any run of characters across segments
//! - `?` matches one character other than `/`
//! - `[abc]`, `[a-z]`, `[!abc]` match one character from (or outside) a class
//! - `{log,txt}` matches one of the comma-separated alternatives
//! - `\x` matches `x` literally

use std::fmt;
use std::path::Path;

use regex::Regex;

use crate::error::{LogError, Result};

/// A compiled path glob.
#[derive(Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile a glob.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidGlob`] for unbalanced classes or groups,
    /// nested groups, or a trailing escape.
    pub fn new(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| LogError::InvalidGlob {
            glob: pattern.to_string(),
            reason: reason.to_string(),
        };

        let source = translate(pattern).map_err(invalid)?;
        let regex = Regex::new(&source).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The glob as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether `path` matches the whole glob.
    #[must_use]
    pub fn is_match(&self, path: &Path) -> bool {
        self.regex.is_match(&path.to_string_lossy())
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.pattern).finish()
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn translate(glob: &str) -> std::result::Result<String, &'static str> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.chars().peekable();
    let mut in_group = false;

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                let mut first = true;
                while let Some(cc) = chars.next() {
                    match cc {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | ']' | '&' | '~' => {
                            out.push('\\');
                            out.push(cc);
                        }
                        _ => out.push(cc),
                    }
                    first = false;
                }
                if !closed {
                    return Err("unterminated character class");
                }
                out.push(']');
            }
            '{' => {
                if in_group {
                    return Err("nested groups are not supported");
                }
                in_group = true;
                out.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            '\\' => {
                let escaped = chars.next().ok_or("trailing escape")?;
                push_literal(&mut out, escaped);
            }
            _ => push_literal(&mut out, c),
        }
    }

    if in_group {
        return Err("unterminated group");
    }

    out.push('$');
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

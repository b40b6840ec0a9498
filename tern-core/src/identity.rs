use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RpcError;

/// Identity of a target object: a name scoped by an optional category.
///
/// The stringified form is `category/name` (or just `name` when the category
/// is empty). `/`, `\`, quotes and non-printable characters are escaped with a
/// backslash so that any identity survives a round trip through a proxy string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    /// The null identity is used on the wire to encode a null proxy.
    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }

    /// Parse the stringified form of an identity.
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        let mut slash = None;
        let mut escaped = false;
        for (i, c) in s.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '/' if slash.is_none() => slash = Some(i),
                '/' => {
                    return Err(RpcError::IdentityParse(format!(
                        "unescaped '/' in identity `{}`",
                        s
                    )))
                }
                _ => {}
            }
        }

        let identity = match slash {
            None => Identity::new(unescape(s)?, ""),
            Some(pos) => {
                let category = unescape(&s[..pos])?;
                let name = unescape(&s[pos + 1..])?;
                Identity::new(name, category)
            }
        };

        if identity.name.is_empty() && !identity.category.is_empty() {
            return Err(RpcError::IdentityParse(format!(
                "identity `{}` has a category but no name",
                s
            )));
        }
        Ok(identity)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", escape(&self.name))
        } else {
            write!(f, "{}/{}", escape(&self.category), escape(&self.name))
        }
    }
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | '/' | '\'' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape(s: &str) -> Result<String, RpcError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| {
                        RpcError::IdentityParse(format!("invalid escape `\\u{}` in `{}`", hex, s))
                    })?;
                out.push(code);
            }
            Some(other) => out.push(other),
            None => {
                return Err(RpcError::IdentityParse(format!(
                    "trailing backslash in `{}`",
                    s
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_name_only() {
        let id = Identity::parse("hello").unwrap();
        assert_eq!(id, Identity::named("hello"));
        assert_eq!(id.to_string(), "hello");
    }

    #[test]
    fn test_parse_with_category() {
        let id = Identity::parse("cat/name").unwrap();
        assert_eq!(id.category, "cat");
        assert_eq!(id.name, "name");
    }

    #[test]
    fn test_escaped_slash_stays_in_name() {
        let id = Identity::parse("a\\/b").unwrap();
        assert_eq!(id.name, "a/b");
        assert!(id.category.is_empty());
        assert_eq!(id.to_string(), "a\\/b");
    }

    #[test]
    fn test_second_slash_rejected() {
        assert!(matches!(
            Identity::parse("a/b/c"),
            Err(RpcError::IdentityParse(_))
        ));
    }

    #[test]
    fn test_category_without_name_rejected() {
        assert!(Identity::parse("cat/").is_err());
    }

    proptest! {
        #[test]
        fn prop_display_parse_round_trip(name in "[a-zA-Z0-9 /\\\\'\"]{1,12}", category in "[a-z/]{0,6}") {
            let id = Identity::new(name, category);
            let parsed = Identity::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}

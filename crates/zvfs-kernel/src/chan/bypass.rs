//! Error bundles carried across the handler boundary.
//!
//! A handler error is a flat list: option/value pairs (`-code 1`,
//! `-errorcode {POSIX EACCES}` ...) optionally followed by the human readable
//! message. An odd element count means the last element is the message. The
//! string form uses brace quoting so the static messages below are valid
//! one-element lists.

use std::fmt;

/// Structured error from a channel handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBundle {
    options: Vec<(String, String)>,
    message: Option<String>,
}

impl ErrorBundle {
    /// Bundle holding only a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            options: Vec::new(),
            message: Some(msg.into()),
        }
    }

    /// Add an option/value pair.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// Build from list elements. An odd count puts the message last.
    pub fn from_list<S: AsRef<str>>(items: &[S]) -> Self {
        let explicit = items.len() % 2 == 1;
        let num_options = items.len() - usize::from(explicit);
        let options = items[..num_options]
            .chunks(2)
            .map(|pair| (pair[0].as_ref().to_string(), pair[1].as_ref().to_string()))
            .collect();
        let message = explicit.then(|| items[items.len() - 1].as_ref().to_string());
        Self { options, message }
    }

    /// Parse the string form.
    pub fn parse(text: &str) -> Option<Self> {
        split_list(text).map(|items| Self::from_list(&items))
    }

    /// Flatten back into list elements.
    pub fn to_list(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.options.len() * 2 + 1);
        for (name, value) in &self.options {
            out.push(name.clone());
            out.push(value.clone());
        }
        if let Some(msg) = &self.message {
            out.push(msg.clone());
        }
        out
    }

    /// The human readable message, if one was supplied.
    pub fn text(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Look up an option value.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Option/value pairs in order.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// The POSIX error this bundle signals, if any.
    ///
    /// Handlers report a raw errno by failing with a negative integer
    /// message, or with the literal `EAGAIN`.
    pub fn errno(&self) -> Option<i32> {
        let msg = self.message.as_deref()?;
        if let Ok(code) = msg.trim().parse::<i32>() {
            return (code < 0).then_some(-code);
        }
        (msg == "EAGAIN").then_some(EAGAIN)
    }
}

impl fmt::Display for ErrorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_list(&self.to_list()))
    }
}

/// EAGAIN on the platforms we care about.
pub const EAGAIN: i32 = 11;

/// Quote one list element.
pub fn quote_element(item: &str) -> String {
    if item.is_empty() {
        return "{}".to_string();
    }
    let needs_braces = item
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '"' | ';' | '$' | '[' | ']' | '\\'));
    if needs_braces && braces_balanced(item) && !item.ends_with('\\') {
        format!("{{{item}}}")
    } else if needs_braces {
        let mut out = String::with_capacity(item.len() + 8);
        for c in item.chars() {
            if c.is_whitespace() || matches!(c, '{' | '}' | '"' | ';' | '$' | '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    } else {
        item.to_string()
    }
}

/// Join elements into the list string form.
pub fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|s| quote_element(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a list string into elements. Returns `None` on unbalanced braces.
pub fn split_list(text: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        if chars[i] == '{' {
            let mut depth = 1;
            let start = i + 1;
            i += 1;
            while i < chars.len() && depth > 0 {
                match chars[i] {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    '\\' => i += 1,
                    _ => {}
                }
                i += 1;
            }
            if depth != 0 {
                return None;
            }
            out.push(chars[start..i - 1].iter().collect());
        } else {
            let mut word = String::new();
            while i < chars.len() && !chars[i].is_whitespace() {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                }
                word.push(chars[i]);
                i += 1;
            }
            out.push(word);
        }
    }
    Some(out)
}

fn braces_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_only_is_one_element_list() {
        let b = ErrorBundle::message("read delivered more than requested");
        assert_eq!(b.to_string(), "{read delivered more than requested}");
        assert_eq!(b.to_list().len(), 1);
    }

    #[test]
    fn test_odd_count_puts_message_last() {
        let b = ErrorBundle::from_list(&["-code", "1", "-errorcode", "NONE", "boom"]);
        assert_eq!(b.text(), Some("boom"));
        assert_eq!(b.option("-code"), Some("1"));
        assert_eq!(b.option("-errorcode"), Some("NONE"));
    }

    #[test]
    fn test_even_count_has_no_message() {
        let b = ErrorBundle::from_list(&["-code", "1"]);
        assert_eq!(b.text(), None);
        assert_eq!(b.options().len(), 1);
    }

    #[test]
    fn test_owner_lost_bundle_parses() {
        let text = "-code 1 -level 0 -errorcode NONE -errorinfo {} -errorline 1 {Owner lost}";
        let b = ErrorBundle::parse(text).unwrap();
        assert_eq!(b.text(), Some("Owner lost"));
        assert_eq!(b.option("-errorinfo"), Some(""));
        assert_eq!(b.to_string(), text);
    }

    #[test]
    fn test_errno_signals() {
        assert_eq!(ErrorBundle::message("-13").errno(), Some(13));
        assert_eq!(ErrorBundle::message("EAGAIN").errno(), Some(EAGAIN));
        assert_eq!(ErrorBundle::message("5").errno(), None);
        assert_eq!(ErrorBundle::message("plain failure").errno(), None);
    }

    #[test]
    fn test_split_list_nested_braces() {
        let items = split_list("a {b {c d}} e").unwrap();
        assert_eq!(items, vec!["a", "b {c d}", "e"]);
        assert!(split_list("{unclosed").is_none());
    }
}

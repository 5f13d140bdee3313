//! `<base href>` rewriting for HTML served under a mount path.

use std::sync::OnceLock;

use regex::Regex;

fn base_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<base\s[^>]*>"#).expect("valid base tag regex"))
}

fn head_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<head(\s[^>]*)?>"#).expect("valid head regex"))
}

/// Normalize a mount path into an href: always starts and ends with `/`.
pub fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Point the document's `<base href>` at `base`.
///
/// An existing base tag is replaced; otherwise one is inserted right after
/// `<head>`, or prepended when the document has no head.
pub fn rewrite(html: &str, base: &str) -> String {
    let tag = format!(r#"<base href="{}">"#, normalize_base(base));

    if base_tag().is_match(html) {
        return base_tag().replace(html, regex::NoExpand(&tag)).into_owned();
    }

    if let Some(m) = head_open().find(html) {
        let mut out = String::with_capacity(html.len() + tag.len());
        out.push_str(&html[..m.end()]);
        out.push_str(&tag);
        out.push_str(&html[m.end()..]);
        return out;
    }

    format!("{}{}", tag, html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("/todo"), "/todo/");
        assert_eq!(normalize_base("/todo/"), "/todo/");
        assert_eq!(normalize_base(""), "/");
        assert_eq!(normalize_base("/"), "/");
    }

    #[test]
    fn test_replaces_existing_base() {
        let html = r#"<html><head><base href="/"><title>x</title></head></html>"#;
        let out = rewrite(html, "/todo");
        assert_eq!(
            out,
            r#"<html><head><base href="/todo/"><title>x</title></head></html>"#
        );
    }

    #[test]
    fn test_injects_after_head() {
        let html = r#"<html><head lang="en"><title>x</title></head></html>"#;
        let out = rewrite(html, "/apps/todo@1.0.0");
        assert!(out.contains(r#"<head lang="en"><base href="/apps/todo@1.0.0/"><title>"#));
    }

    #[test]
    fn test_prepends_without_head() {
        assert_eq!(rewrite("<p>hi</p>", "/a"), r#"<base href="/a/"><p>hi</p>"#);
    }

    #[test]
    fn test_does_not_match_basefont() {
        let html = "<head><basefont size=3></head>";
        let out = rewrite(html, "/a");
        assert!(out.contains("<basefont size=3>"));
        assert!(out.contains(r#"<base href="/a/">"#));
    }
}

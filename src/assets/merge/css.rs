//! Stylesheet transforms applied while bundling.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

static URL_REFERENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"url\(\s*(['"]?)([^'")]*)(['"]?)\s*\)"#).ok());
static COMMENT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").ok());
static WHITESPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());
static PUNCTUATION_SPACE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\s*([{};,>])\s*").ok());
static PROPERTY_SPACE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"([{;][-\w]+)\s+:").ok());
static COLON_SPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r":\s+").ok());
static DECLARATION_VALUE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r":([^;{}]*)([;}])").ok());
static ZERO_UNIT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(^|[\s:,(])0(?:px|em|rem|pt|pc|in|cm|mm|ex|ch|vw|vh)\b").ok());
static LONG_HEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"#([0-9a-fA-F]{6})\b").ok());

/// Make relative `url(...)` references absolute against `base`, the stylesheet's own URL.
/// Data URIs, fragments, root-relative and absolute references are left untouched.
pub fn rewrite_urls(css: &str, base: &Url) -> String {
    let Some(pattern) = URL_REFERENCE.as_ref() else {
        return css.to_string();
    };

    pattern
        .replace_all(css, |caps: &Captures<'_>| {
            let target = caps[2].trim();
            let keep = target.is_empty()
                || target.starts_with("data:")
                || target.starts_with('#')
                || target.starts_with('/')
                || target.contains("://");
            if keep {
                return caps[0].to_string();
            }
            match base.join(target) {
                Ok(resolved) => format!("url(\"{resolved}\")"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Strip comments, collapse whitespace, drop units from zero lengths and shorten six-digit hex
/// colours in declaration values.
pub fn minify_css(css: &str) -> String {
    let mut out = replace(&COMMENT, css, "");
    out = replace(&WHITESPACE, &out, " ");
    out = replace(&PUNCTUATION_SPACE, &out, "$1");
    out = replace(&PROPERTY_SPACE, &out, "${1}:");
    out = replace(&COLON_SPACE, &out, ":");
    out = out.replace(";}", "}");

    if let Some(values) = DECLARATION_VALUE.as_ref() {
        out = values
            .replace_all(&out, |caps: &Captures<'_>| {
                let value = replace(&ZERO_UNIT, &caps[1], "${1}0");
                format!(":{}{}", shorten_hex(&value), &caps[2])
            })
            .into_owned();
    }

    out.trim().to_string()
}

fn shorten_hex(value: &str) -> String {
    let Some(pattern) = LONG_HEX.as_ref() else {
        return value.to_string();
    };
    pattern
        .replace_all(value, |caps: &Captures<'_>| {
            let digits = caps[1].as_bytes();
            let pairs_match = digits
                .chunks(2)
                .all(|pair| pair[0].eq_ignore_ascii_case(&pair[1]));
            if pairs_match {
                let short: String = digits
                    .chunks(2)
                    .map(|pair| char::from(pair[0]).to_ascii_lowercase())
                    .collect();
                format!("#{short}")
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn replace(pattern: &Lazy<Option<Regex>>, input: &str, with: &str) -> String {
    match pattern.as_ref() {
        Some(regex) => regex.replace_all(input, with).into_owned(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/wp-content/themes/tt/css/style.css").expect("base")
    }

    #[test]
    fn relative_references_become_absolute() {
        let css = r#".a{background:url(../img/bg.png)}.b{src:url('fonts/x.woff2')}"#;

        let rewritten = rewrite_urls(css, &base());

        assert!(rewritten.contains(r#"url("https://example.com/wp-content/themes/tt/img/bg.png")"#));
        assert!(
            rewritten.contains(r#"url("https://example.com/wp-content/themes/tt/css/fonts/x.woff2")"#)
        );
    }

    #[test]
    fn absolute_data_and_fragment_references_are_kept() {
        let css = r#"a{b:url(data:image/png;base64,AAA)}c{d:url("/root.png")}e{f:url(#g)}h{i:url(https://cdn.test/x.png)}"#;
        assert_eq!(rewrite_urls(css, &base()), css);
    }

    #[test]
    fn minify_collapses_and_shortens() {
        let css = "/* header */\nbody {\n  margin : 0px;\n  color: #FFFFFF;\n  border-color: #123456;\n}\n\na > b ,\n i { padding: 0em 1px; }\n";

        assert_eq!(
            minify_css(css),
            "body{margin:0;color:#fff;border-color:#123456}a>b,i{padding:0 1px}"
        );
    }

    #[test]
    fn selectors_that_look_like_colours_are_untouched() {
        assert_eq!(minify_css("#aabbcc { color: red; }"), "#aabbcc{color:red}");
    }

    #[test]
    fn pseudo_selectors_keep_their_colon() {
        assert_eq!(minify_css("a:hover , a:focus { color : #000000 }"), "a:hover,a:focus{color:#000}");
    }
}

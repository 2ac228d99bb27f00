//! Font-display enforcement for merged stylesheets.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static FONT_FACE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?is)@font-face\s*\{[^}]*\}").ok());
static GOOGLE_FONTS_IMPORT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:url\(\s*)?['"]?(https?:)?//fonts\.googleapis\.com/[^'")\s;]+"#)
        .ok()
});

/// Post-processing hook run over every merged stylesheet.
pub trait FontCollaborator: Send + Sync {
    fn enforce_display(&self, css: &str) -> String;
}

/// Adds `font-display: swap` wherever a font would otherwise block text rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapFontDisplay;

impl FontCollaborator for SwapFontDisplay {
    fn enforce_display(&self, css: &str) -> String {
        let with_faces = match FONT_FACE.as_ref() {
            Some(pattern) => pattern
                .replace_all(css, |caps: &Captures<'_>| {
                    let block = &caps[0];
                    if block.to_ascii_lowercase().contains("font-display") {
                        return block.to_string();
                    }
                    let body = block.trim_end_matches('}').trim_end();
                    let separator = if body.ends_with(';') || body.ends_with('{') {
                        ""
                    } else {
                        ";"
                    };
                    format!("{body}{separator}font-display:swap}}")
                })
                .into_owned(),
            None => css.to_string(),
        };

        match GOOGLE_FONTS_IMPORT.as_ref() {
            Some(pattern) => pattern
                .replace_all(&with_faces, |caps: &Captures<'_>| {
                    let import = &caps[0];
                    if import.contains("display=") {
                        import.to_string()
                    } else if import.contains('?') {
                        format!("{import}&display=swap")
                    } else {
                        format!("{import}?display=swap")
                    }
                })
                .into_owned(),
            None => with_faces,
        }
    }
}

//! Conservative script minifier.
//!
//! Strips comments and collapses whitespace while copying string, template and regex literals
//! verbatim. Line breaks survive (collapsed to one) so automatic semicolon insertion keeps its
//! meaning.

/// Characters that never need surrounding spaces. `+`, `-`, `.` and `/` are absent on purpose:
/// `a - -b`, `1 .x` and division/regex boundaries change meaning when joined.
const TIGHT: &[char] = &[
    '{', '}', '(', ')', '[', ']', ';', ',', '=', ':', '<', '>', '*', '%', '&', '|', '!', '?',
];

/// Preceding characters after which `/` starts a regex literal rather than a division.
const REGEX_PREFIX: &[char] = &[
    '(', ',', '=', ':', '[', '!', '&', '|', '?', '{', '}', ';', '+', '-', '*', '%', '<', '>', '~',
    '^',
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gap {
    None,
    Space,
    Newline,
}

pub fn minify_js(js: &str) -> String {
    let chars: Vec<char> = js.chars().collect();
    let mut out = String::with_capacity(js.len());
    let mut gap = Gap::None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            gap = match (gap, c) {
                (Gap::Newline, _) | (_, '\n') => Gap::Newline,
                _ => Gap::Space,
            };
            i += 1;
            continue;
        }

        if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            if gap == Gap::None {
                gap = Gap::Space;
            }
            continue;
        }

        flush_gap(&mut out, gap, c);
        gap = Gap::None;

        match c {
            '"' | '\'' | '`' => i = copy_literal(&chars, i, c, &mut out),
            '/' if regex_allowed(&out) => i = copy_regex(&chars, i, &mut out),
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn flush_gap(out: &mut String, gap: Gap, upcoming: char) {
    let Some(last) = out.chars().last() else {
        return;
    };
    match gap {
        Gap::None => {}
        Gap::Newline => out.push('\n'),
        Gap::Space => {
            if !TIGHT.contains(&last) && !TIGHT.contains(&upcoming) {
                out.push(' ');
            }
        }
    }
}

/// Copy a quoted literal starting at `start`; returns the index after its closing quote.
fn copy_literal(chars: &[char], start: usize, quote: char, out: &mut String) -> usize {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' {
            if let Some(escaped) = chars.get(i) {
                out.push(*escaped);
                i += 1;
            }
        } else if c == quote {
            break;
        }
    }
    i
}

fn copy_regex(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('/');
    let mut i = start + 1;
    let mut in_class = false;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            break;
        }
        out.push(c);
        i += 1;
        match c {
            '\\' => {
                if let Some(escaped) = chars.get(i) {
                    out.push(*escaped);
                    i += 1;
                }
            }
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => break,
            _ => {}
        }
    }
    i
}

fn regex_allowed(out: &str) -> bool {
    let trimmed = out.trim_end();
    match trimmed.chars().last() {
        None => true,
        Some(last) if REGEX_PREFIX.contains(&last) => true,
        Some(_) => ["return", "typeof", "case", "do", "else", "in", "of"]
            .iter()
            .any(|keyword| {
                trimmed.ends_with(keyword)
                    && !trimmed[..trimmed.len() - keyword.len()]
                        .chars()
                        .last()
                        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
            }),
    }
}

//! Head scanning for render-blocking resources.

use std::{cell::RefCell, collections::HashSet, rc::Rc};

use lol_html::{RewriteStrSettings, element, rewrite_str};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use super::types::ResourceType;

const FONT_PROVIDER_HOSTS: &[&str] = &["fonts.googleapis.com", "fonts.bunny.net"];
const SCRIPT_TYPES: &[&str] = &["text/javascript", "application/javascript"];

static FONT_FILE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+\.(?:woff2?|ttf|otf)(?:\?[^'")\s]*)?)['"]?\s*\)"#).ok()
});

/// A blocking stylesheet or synchronous script among the head's direct children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadResource {
    pub url: Url,
    pub resource_type: ResourceType,
    pub position: u32,
}

impl HeadResource {
    pub fn is_font_provider(&self) -> bool {
        self.resource_type == ResourceType::Style
            && self
                .url
                .host_str()
                .is_some_and(|host| FONT_PROVIDER_HOSTS.contains(&host))
    }
}

#[derive(Default)]
struct ScanState {
    position: u32,
    found: Vec<HeadResource>,
    preloaded: HashSet<String>,
}

/// Blocking resources in document order, minus any the page already preloads.
///
/// Only direct children of an explicit `<head>` count. Markup the rewriter rejects yields nothing.
pub fn scan_head(html: &str, page_url: &Url) -> Vec<HeadResource> {
    let state = Rc::new(RefCell::new(ScanState::default()));

    let outcome = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("head > *", {
                let state = Rc::clone(&state);
                move |el| {
                    let mut state = state.borrow_mut();
                    let position = state.position;
                    state.position = state.position.saturating_add(1);

                    match el.tag_name().as_str() {
                        "link" => {
                            let rel = el
                                .get_attribute("rel")
                                .unwrap_or_default()
                                .to_ascii_lowercase();
                            let Some(href) = el.get_attribute("href") else {
                                return Ok(());
                            };
                            let Ok(url) = page_url.join(href.trim()) else {
                                return Ok(());
                            };
                            let rels: Vec<&str> = rel.split_whitespace().collect();
                            if rels.contains(&"preload") {
                                state.preloaded.insert(strip_fragment(url).into());
                            } else if rels.contains(&"stylesheet")
                                && is_default_media(el.get_attribute("media").as_deref())
                            {
                                state.found.push(HeadResource {
                                    url: strip_fragment(url),
                                    resource_type: ResourceType::Style,
                                    position,
                                });
                            }
                        }
                        "script" => {
                            let Some(src) = el.get_attribute("src") else {
                                return Ok(());
                            };
                            let blocking = !el.has_attribute("async")
                                && !el.has_attribute("defer")
                                && is_classic_script(el.get_attribute("type").as_deref());
                            if let (true, Ok(url)) = (blocking, page_url.join(src.trim())) {
                                state.found.push(HeadResource {
                                    url: strip_fragment(url),
                                    resource_type: ResourceType::Script,
                                    position,
                                });
                            }
                        }
                        _ => {}
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    );

    if let Err(err) = outcome {
        debug!(target = "preload::analyze", url = %page_url, error = %err, "Unparseable page head");
        return Vec::new();
    }

    let ScanState {
        found, preloaded, ..
    } = state.take();
    found
        .into_iter()
        .filter(|resource| !preloaded.contains(resource.url.as_str()))
        .collect()
}

/// Font files referenced by a font provider stylesheet, resolved against `base`.
pub fn extract_font_urls(css: &str, base: &Url) -> Vec<Url> {
    let Some(pattern) = FONT_FILE.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    pattern
        .captures_iter(css)
        .filter_map(|caps| base.join(&caps[1]).ok())
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}

fn strip_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn is_default_media(media: Option<&str>) -> bool {
    media.is_none_or(|media| {
        let media = media.trim();
        media.is_empty() || media.eq_ignore_ascii_case("all")
    })
}

fn is_classic_script(kind: Option<&str>) -> bool {
    kind.is_none_or(|kind| {
        let kind = kind.trim();
        kind.is_empty()
            || SCRIPT_TYPES
                .iter()
                .any(|allowed| kind.eq_ignore_ascii_case(allowed))
    })
}

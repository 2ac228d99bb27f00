//! Head markup for optimized assets.

use crate::{
    application::{request::RequestContext, rules::RuleChain},
    preload::{PreloadEntry, ResourceType},
};

use super::{
    merge::Bundle,
    types::{AssetDescriptor, AssetKind},
};

const BUNDLE_ID_KEY_LEN: usize = 8;

/// One stylesheet or script tag in the outgoing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    pub kind: AssetKind,
    pub url: String,
    /// Handles delivered by this reference; more than one for a bundle.
    pub handles: Vec<String>,
    pub media: Option<String>,
    pub defer: bool,
    pub bundle: bool,
    /// Element id stem; the `-css`/`-js` suffix is added when rendering.
    pub id: String,
}

impl AssetReference {
    pub fn single(asset: &AssetDescriptor, defer: bool) -> Self {
        let url = match asset.version.as_deref() {
            Some(version) if !version.is_empty() => {
                let separator = if asset.src.contains('?') { '&' } else { '?' };
                format!("{}{separator}ver={version}", asset.src)
            }
            _ => asset.src.clone(),
        };
        Self {
            kind: asset.kind,
            url,
            handles: vec![asset.handle.clone()],
            media: asset.media.clone(),
            defer,
            bundle: false,
            id: asset.handle.clone(),
        }
    }

    pub fn bundle(bundle: &Bundle, defer: bool) -> Self {
        Self {
            kind: bundle.meta.kind,
            url: bundle.url.clone(),
            handles: bundle.meta.handles.clone(),
            media: None,
            defer,
            bundle: true,
            id: format!(
                "spry-{}-{}-{}",
                bundle.meta.kind,
                bundle.meta.group,
                bundle
                    .meta
                    .key
                    .get(..BUNDLE_ID_KEY_LEN)
                    .unwrap_or(&bundle.meta.key),
            ),
        }
    }

    pub fn to_html(&self) -> String {
        let id = &self.id;
        match self.kind {
            AssetKind::Style => format!(
                r#"<link rel="stylesheet" id="{}-css" href="{}" media="{}">"#,
                escape_attribute(id),
                escape_attribute(&self.url),
                escape_attribute(self.media.as_deref().unwrap_or("all")),
            ),
            AssetKind::Script => format!(
                r#"<script id="{}-js" src="{}"{}></script>"#,
                escape_attribute(id),
                escape_attribute(&self.url),
                if self.defer { " defer" } else { "" },
            ),
        }
    }
}

/// Render-time head additions: inline critical CSS, preload hints, then asset tags.
#[derive(Clone, Default)]
pub struct HeadDirectives {
    critical_css: Option<String>,
    preload: Vec<PreloadEntry>,
    rules: RuleChain,
}

impl HeadDirectives {
    pub fn new(critical_css: Option<String>, preload: Vec<PreloadEntry>, rules: RuleChain) -> Self {
        Self {
            critical_css,
            preload,
            rules,
        }
    }

    pub fn render(
        &self,
        ctx: &RequestContext,
        styles: &[AssetReference],
        scripts: &[AssetReference],
    ) -> String {
        let mut head = String::new();

        let critical = self
            .rules
            .critical_css_content(self.critical_css.clone().unwrap_or_default(), ctx);
        if !critical.trim().is_empty() {
            head.push_str(r#"<style id="spry-critical-css">"#);
            head.push_str(&critical.replace("</", "<\\/"));
            head.push_str("</style>\n");
        }

        for entry in self.rules.preload_assets(self.preload.clone(), ctx) {
            head.push_str(&preload_link(&entry));
            head.push('\n');
        }

        for reference in styles.iter().chain(scripts) {
            head.push_str(&reference.to_html());
            head.push('\n');
        }
        head
    }
}

fn preload_link(entry: &PreloadEntry) -> String {
    let crossorigin = if entry.resource_type == ResourceType::Font {
        " crossorigin"
    } else {
        ""
    };
    format!(
        r#"<link rel="preload" href="{}" as="{}"{crossorigin}>"#,
        escape_attribute(&entry.url),
        entry.resource_type.as_str(),
    )
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\n' | '\r' | '\t' => escaped.push(' '),
            _ => escaped.push(ch),
        }
    }
    escaped
}

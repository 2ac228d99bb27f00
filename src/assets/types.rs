use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Style,
    Script,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Style => "style",
            Self::Script => "script",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Style => "css",
            Self::Script => "js",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification bucket controlling merge eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetGroup {
    /// Core and theme assets.
    A,
    /// Known plugins.
    B,
    /// Page builders and composers.
    C,
    /// Everything else.
    D,
}

impl AssetGroup {
    pub const ALL: [AssetGroup; 4] = [Self::A, Self::B, Self::C, Self::D];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
            Self::D => "d",
        }
    }
}

impl fmt::Display for AssetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetGroup {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            "c" => Ok(Self::C),
            "d" => Ok(Self::D),
            other => Err(format!("unknown asset group `{other}`; expected one of a, b, c, d")),
        }
    }
}

/// One declared stylesheet or script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub handle: String,
    pub kind: AssetKind,
    pub src: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Stylesheet media query; `None` means `all`.
    #[serde(default)]
    pub media: Option<String>,
}

impl AssetDescriptor {
    pub fn style(handle: impl Into<String>, src: impl Into<String>) -> Self {
        Self::new(AssetKind::Style, handle, src)
    }

    pub fn script(handle: impl Into<String>, src: impl Into<String>) -> Self {
        Self::new(AssetKind::Script, handle, src)
    }

    fn new(kind: AssetKind, handle: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            kind,
            src: src.into(),
            deps: Vec::new(),
            version: None,
            media: None,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }

    /// Whether the stylesheet applies to every medium.
    pub fn is_all_media(&self) -> bool {
        self.media
            .as_deref()
            .is_none_or(|media| media.trim().is_empty() || media.trim() == "all")
    }
}

/// Read-only snapshot of the assets declared for one render.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: HashMap<String, AssetDescriptor>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `asset`, replacing any earlier declaration of the same handle.
    pub fn register(&mut self, asset: AssetDescriptor) {
        self.assets.insert(asset.handle.clone(), asset);
    }

    pub fn get(&self, handle: &str) -> Option<&AssetDescriptor> {
        self.assets.get(handle)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.assets.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl FromIterator<AssetDescriptor> for AssetRegistry {
    fn from_iter<T: IntoIterator<Item = AssetDescriptor>>(iter: T) -> Self {
        let mut registry = Self::new();
        for asset in iter {
            registry.register(asset);
        }
        registry
    }
}

/// Assets in dependency order: every asset follows all of its resolvable dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyTree {
    ordered: Vec<AssetDescriptor>,
}

impl DependencyTree {
    pub(crate) fn from_ordered(ordered: Vec<AssetDescriptor>) -> Self {
        Self { ordered }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AssetDescriptor> {
        self.ordered.iter()
    }

    pub fn handles(&self) -> Vec<&str> {
        self.ordered.iter().map(|a| a.handle.as_str()).collect()
    }

    pub fn get(&self, handle: &str) -> Option<&AssetDescriptor> {
        self.ordered.iter().find(|a| a.handle == handle)
    }

    pub fn position(&self, handle: &str) -> Option<usize> {
        self.ordered.iter().position(|a| a.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl<'a> IntoIterator for &'a DependencyTree {
    type Item = &'a AssetDescriptor;
    type IntoIter = std::slice::Iter<'a, AssetDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_parses_either_case() {
        assert_eq!("a".parse::<AssetGroup>(), Ok(AssetGroup::A));
        assert_eq!(" C ".parse::<AssetGroup>(), Ok(AssetGroup::C));
        assert!("e".parse::<AssetGroup>().is_err());
    }

    #[test]
    fn media_defaults_to_all() {
        assert!(AssetDescriptor::style("s", "/s.css").is_all_media());
        assert!(AssetDescriptor::style("s", "/s.css").with_media("all").is_all_media());
        assert!(!AssetDescriptor::style("s", "/s.css").with_media("print").is_all_media());
    }

    #[test]
    fn registry_replaces_duplicate_handles() {
        let registry: AssetRegistry = [
            AssetDescriptor::script("app", "/v1.js"),
            AssetDescriptor::script("app", "/v2.js"),
        ]
        .into_iter()
        .collect();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("app").map(|a| a.src.as_str()), Some("/v2.js"));
    }
}

//! Page cache key derivation.
//!
//! A key is the SHA-256 of the normalized URL plus every variation factor, fed in a fixed order
//! with field separators so distinct tuples never share an input string.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::{Url, form_urlencoded};

/// Tracking parameters that never change page content.
pub const DEFAULT_EXCLUDED_QUERY_PARAMS: &[&str] = &[
    "fbclid", "gclid", "msclkid", "dclid", "_ga", "_gl", "mc_cid", "mc_eid", "ref", "igshid",
];

const EXCLUDED_QUERY_PREFIXES: &[&str] = &["utm_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 3] = [Self::Desktop, Self::Mobile, Self::Tablet];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
        }
    }

    /// Classify a user agent. Tablets are checked first because most tablet agents also carry
    /// generic mobile tokens.
    pub fn detect(user_agent: Option<&str>) -> Self {
        let Some(agent) = user_agent else {
            return Self::Desktop;
        };

        let is_android = agent.contains("Android");
        if agent.contains("iPad")
            || agent.contains("Tablet")
            || agent.contains("Kindle")
            || agent.contains("Silk/")
            || (is_android && !agent.contains("Mobile"))
        {
            return Self::Tablet;
        }

        const MOBILE_TOKENS: &[&str] = &[
            "Mobi",
            "iPhone",
            "iPod",
            "BlackBerry",
            "Opera Mini",
            "IEMobile",
            "Windows Phone",
        ];
        if is_android || MOBILE_TOKENS.iter().any(|token| agent.contains(token)) {
            return Self::Mobile;
        }

        Self::Desktop
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dimensions that partition the cache for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariationFactors {
    pub device: Option<DeviceClass>,
    pub language: Option<String>,
    pub cookies: BTreeMap<String, String>,
    /// Factors injected by the rule chain.
    pub extra: BTreeMap<String, String>,
}

/// Hex SHA-256 naming one cache entry on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey(String);

impl PageKey {
    /// Accept only the 64-char lowercase hex form produced by [`page_key`].
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce `url` to path and query: drop scheme, host and fragment, strip excluded parameters and
/// sort what remains. Relative and absolute inputs for the same page normalize identically.
pub fn normalize_url(url: &str, excluded: &[String]) -> String {
    let trimmed = url.trim();
    let (path, query) = match Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => (
            parsed.path().to_string(),
            parsed.query().map(str::to_string),
        ),
        _ => {
            let without_fragment = trimmed.split('#').next().unwrap_or_default();
            match without_fragment.split_once('?') {
                Some((path, query)) => (path.to_string(), Some(query.to_string())),
                None => (without_fragment.to_string(), None),
            }
        }
    };

    let mut normalized = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };

    if let Some(query) = query {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .filter(|(key, _)| !key.is_empty() && !is_excluded_param(key, excluded))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        pairs.sort();

        if !pairs.is_empty() {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            normalized.push('?');
            normalized.push_str(&encoded);
        }
    }

    normalized
}

fn is_excluded_param(key: &str, excluded: &[String]) -> bool {
    let lowered = key.to_ascii_lowercase();
    DEFAULT_EXCLUDED_QUERY_PARAMS.contains(&lowered.as_str())
        || EXCLUDED_QUERY_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
        || excluded
            .iter()
            .any(|param| param.eq_ignore_ascii_case(&lowered))
}

/// Derive the key for an already normalized URL. Pure and total: empty input still hashes.
pub fn page_key(normalized_url: &str, factors: &VariationFactors) -> PageKey {
    let mut hasher = Sha256::new();
    feed(&mut hasher, "url", normalized_url);
    if let Some(device) = factors.device {
        feed(&mut hasher, "device", device.as_str());
    }
    if let Some(language) = factors.language.as_deref() {
        feed(&mut hasher, "lang", language);
    }
    for (name, value) in &factors.cookies {
        feed(&mut hasher, "cookie", name);
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    for (name, value) in &factors.extra {
        feed(&mut hasher, "extra", name);
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    PageKey(hex::encode(hasher.finalize()))
}

fn feed(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update([0x1e]);
    hasher.update(tag.as_bytes());
    hasher.update([0x1f]);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

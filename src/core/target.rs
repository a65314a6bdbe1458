use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use url::Url;

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").unwrap());
static HOST_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s/:?#]+:\d{1,5}$").unwrap());
static IPV4_CIDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}/\d{1,2}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Domain,
    Url,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Domain => "domain",
            TargetKind::Url => "url",
        }
    }
}

/// Canonical form of one scan target.
///
/// Domain-kind descriptors never carry `scheme`, `url`, `port` or `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub input: String,
    pub kind: TargetKind,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub normalized_target: String,
    pub key: String,
}

impl TargetDescriptor {
    pub fn is_url(&self) -> bool {
        self.kind == TargetKind::Url
    }
}

/// Parse one free-form target string. Never fails: anything that is not a
/// usable URL degrades to a domain descriptor.
pub fn parse(raw: &str) -> TargetDescriptor {
    let input = raw.trim();
    if input.is_empty() {
        return domain_descriptor(raw, "");
    }

    if looks_like_url(input) {
        if let Some(descriptor) = parse_url(raw, input) {
            return descriptor;
        }
        tracing::debug!("URL-like target {:?} did not parse, treating as domain", input);
    }

    domain_descriptor(raw, input)
}

/// Parse, drop empty hosts, dedupe by key and sort into canonical order.
/// The output does not depend on the order of `raw`.
pub fn canonicalize<I, S>(raw: I) -> Vec<TargetDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut by_key: BTreeMap<String, TargetDescriptor> = BTreeMap::new();

    for item in raw {
        let descriptor = parse(item.as_ref());
        if descriptor.host.is_empty() {
            continue;
        }
        match by_key.get(&descriptor.key) {
            // Same key from different spellings: keep the smallest input so the
            // survivor is independent of input order.
            Some(existing) if existing.input <= descriptor.input => {}
            _ => {
                by_key.insert(descriptor.key.clone(), descriptor);
            }
        }
    }

    let mut targets: Vec<TargetDescriptor> = by_key.into_values().collect();
    targets.sort_by(canonical_order);
    targets
}

/// (host, domain-before-url, normalized target, key)
pub fn canonical_order(a: &TargetDescriptor, b: &TargetDescriptor) -> Ordering {
    a.host
        .cmp(&b.host)
        .then(a.kind.cmp(&b.kind))
        .then_with(|| a.normalized_target.cmp(&b.normalized_target))
        .then_with(|| a.key.cmp(&b.key))
}

fn looks_like_url(input: &str) -> bool {
    if SCHEME_RE.is_match(input) {
        return true;
    }
    if input.contains(['/', '?', '#']) && !IPV4_CIDR_RE.is_match(input) {
        return true;
    }
    HOST_PORT_RE.is_match(input)
}

fn parse_url(raw: &str, input: &str) -> Option<TargetDescriptor> {
    let candidate = if SCHEME_RE.is_match(input) {
        input.to_string()
    } else {
        format!("https://{}", input)
    };

    let mut url = Url::parse(&candidate).ok()?;
    let host = canonical_host(url.host_str()?);
    if host.is_empty() {
        return None;
    }
    if url.host_str() != Some(host.as_str()) {
        url.set_host(Some(&host)).ok()?;
    }

    url.set_fragment(None);
    if url.port().is_some() && url.port() == default_port(url.scheme()) {
        url.set_port(None).ok()?;
    }
    if !url.path().starts_with('/') {
        let path = format!("/{}", url.path());
        url.set_path(&path);
    }

    let normalized = url.to_string();
    let key = format!("url--{}--{}", fs_safe(&host), short_hash(&normalized));

    Some(TargetDescriptor {
        input: raw.to_string(),
        kind: TargetKind::Url,
        scheme: Some(url.scheme().to_string()),
        port: url.port(),
        path: Some(url.path().to_string()),
        url: Some(normalized.clone()),
        normalized_target: normalized,
        host,
        key,
    })
}

fn domain_descriptor(raw: &str, input: &str) -> TargetDescriptor {
    let host = canonical_host(input);
    TargetDescriptor {
        input: raw.to_string(),
        kind: TargetKind::Domain,
        scheme: None,
        url: None,
        port: None,
        path: None,
        normalized_target: host.clone(),
        key: format!("domain--{}", fs_safe(&host)),
        host,
    }
}

fn canonical_host(host: &str) -> String {
    let lower = host.trim().to_lowercase();
    match lower.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Filesystem-safe rendering of a host. Hosts that needed rewriting get a
/// hash suffix so two different hosts never collapse to the same name.
pub fn fs_safe(host: &str) -> String {
    let safe: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe == host {
        safe
    } else {
        format!("{}-{}", safe, short_hash(host))
    }
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

/// Working target set of a run: canonical order, unique by key.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    items: Vec<TargetDescriptor>,
    keys: HashSet<String>,
}

impl TargetSet {
    pub fn new(targets: Vec<TargetDescriptor>) -> Self {
        let mut set = Self::default();
        set.merge(targets);
        set
    }

    /// Union by key; already-present keys are left untouched. Returns how many
    /// descriptors were added.
    pub fn merge<I>(&mut self, incoming: I) -> usize
    where
        I: IntoIterator<Item = TargetDescriptor>,
    {
        let mut added = 0;
        for descriptor in incoming {
            if descriptor.host.is_empty() || self.keys.contains(&descriptor.key) {
                continue;
            }
            self.keys.insert(descriptor.key.clone());
            self.items.push(descriptor);
            added += 1;
        }
        if added > 0 {
            self.items.sort_by(canonical_order);
        }
        added
    }

    /// Keep the first `max` targets in canonical order, returning the rest.
    pub fn truncate(&mut self, max: usize) -> Vec<TargetDescriptor> {
        if self.items.len() <= max {
            return Vec::new();
        }
        let dropped = self.items.split_off(max);
        for descriptor in &dropped {
            self.keys.remove(&descriptor.key);
        }
        dropped
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn as_slice(&self) -> &[TargetDescriptor] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

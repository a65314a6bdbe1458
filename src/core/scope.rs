use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

use super::target::{self, TargetDescriptor};

/// One allow-list rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEntry {
    /// Bare host; also admits every subdomain of it.
    Host(String),
    /// `*.root`; admits `root` and every subdomain.
    Wildcard(String),
    Ipv4(Ipv4Addr),
    Cidr(Ipv4Network),
    /// Absolute URL; a non-root path restricts matches to URL targets under it.
    Url {
        host: String,
        path_prefix: Option<String>,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScopeEntryError {
    #[error("empty scope entry")]
    Empty,
    #[error("invalid URL scope entry {0:?}")]
    InvalidUrl(String),
    #[error("invalid CIDR scope entry {0:?}")]
    InvalidCidr(String),
    #[error("invalid wildcard scope entry {0:?}")]
    InvalidWildcard(String),
}

impl FromStr for ScopeEntry {
    type Err = ScopeEntryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let value = line.trim();
        if value.is_empty() {
            return Err(ScopeEntryError::Empty);
        }

        if value.contains("://") {
            let url = Url::parse(value).map_err(|_| ScopeEntryError::InvalidUrl(value.to_string()))?;
            let host = url
                .host_str()
                .map(canonical_host)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ScopeEntryError::InvalidUrl(value.to_string()))?;
            let trimmed = url.path().trim_end_matches('/');
            let path_prefix = (!trimmed.is_empty()).then(|| trimmed.to_string());
            return Ok(ScopeEntry::Url { host, path_prefix });
        }

        if let Some(root) = value.strip_prefix("*.") {
            let root = canonical_host(root);
            if root.is_empty() || root.contains(['/', '*']) {
                return Err(ScopeEntryError::InvalidWildcard(value.to_string()));
            }
            return Ok(ScopeEntry::Wildcard(root));
        }

        if value.contains('/') {
            return Ipv4Network::from_str(value)
                .map(ScopeEntry::Cidr)
                .map_err(|_| ScopeEntryError::InvalidCidr(value.to_string()));
        }

        if let Ok(ip) = value.parse::<Ipv4Addr>() {
            return Ok(ScopeEntry::Ipv4(ip));
        }

        Ok(ScopeEntry::Host(canonical_host(strip_port(value))))
    }
}

impl fmt::Display for ScopeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeEntry::Host(host) => write!(f, "{}", host),
            ScopeEntry::Wildcard(root) => write!(f, "*.{}", root),
            ScopeEntry::Ipv4(ip) => write!(f, "{}", ip),
            ScopeEntry::Cidr(net) => write!(f, "{}", net),
            ScopeEntry::Url { host, path_prefix } => {
                write!(f, "url:{}{}", host, path_prefix.as_deref().unwrap_or(""))
            }
        }
    }
}

impl ScopeEntry {
    fn matches_ip(&self, ip: Ipv4Addr, target: &TargetDescriptor) -> bool {
        match self {
            ScopeEntry::Ipv4(allowed) => *allowed == ip,
            ScopeEntry::Cidr(net) => net.contains(ip),
            ScopeEntry::Url { host, path_prefix } => {
                *host == target.host && path_allows(path_prefix.as_deref(), target)
            }
            ScopeEntry::Host(host) => *host == target.host,
            ScopeEntry::Wildcard(_) => false,
        }
    }

    fn matches_network(&self, net: Ipv4Network) -> bool {
        match self {
            ScopeEntry::Cidr(allowed) => allowed.prefix() <= net.prefix() && allowed.contains(net.network()),
            ScopeEntry::Ipv4(allowed) => net.prefix() == 32 && *allowed == net.ip(),
            _ => false,
        }
    }

    fn matches_host(&self, target: &TargetDescriptor) -> bool {
        match self {
            ScopeEntry::Host(root) | ScopeEntry::Wildcard(root) => host_within(&target.host, root),
            ScopeEntry::Url { host, path_prefix } => {
                host_within(&target.host, host) && path_allows(path_prefix.as_deref(), target)
            }
            ScopeEntry::Ipv4(_) | ScopeEntry::Cidr(_) => false,
        }
    }
}

/// Decide whether `target` is admitted by `entries`. Entries are OR-combined;
/// an empty list admits everything.
pub fn in_scope(target: &TargetDescriptor, entries: &[ScopeEntry]) -> bool {
    if entries.is_empty() {
        return true;
    }
    if target.host.is_empty() {
        return false;
    }

    if let Ok(ip) = target.host.parse::<Ipv4Addr>() {
        return entries.iter().any(|entry| entry.matches_ip(ip, target));
    }
    if target.host.contains('/') {
        if let Ok(net) = Ipv4Network::from_str(&target.host) {
            return entries.iter().any(|entry| entry.matches_network(net));
        }
    }

    entries.iter().any(|entry| entry.matches_host(target))
}

pub fn in_scope_raw(value: &str, entries: &[ScopeEntry]) -> bool {
    in_scope(&target::parse(value), entries)
}

/// Parse scope-file text. Comments and blanks are skipped; bad lines are
/// logged and skipped.
pub fn parse_scope_lines(text: &str) -> Vec<ScopeEntry> {
    let mut entries = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<ScopeEntry>() {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping scope line {}: {}", idx + 1, e),
        }
    }
    entries
}

pub fn load_scope_file(path: &Path) -> Result<Vec<ScopeEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scope file: {:?}", path))?;
    let entries = parse_scope_lines(&text);
    tracing::info!("Loaded {} scope entries from {:?}", entries.len(), path);
    Ok(entries)
}

/// Allow-list loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    entries: Vec<ScopeEntry>,
}

impl Scope {
    pub fn new(entries: Vec<ScopeEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(load_scope_file(path)?))
    }

    pub fn allows(&self, target: &TargetDescriptor) -> bool {
        in_scope(target, &self.entries)
    }

    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    pub fn is_unrestricted(&self) -> bool {
        self.entries.is_empty()
    }
}

fn host_within(host: &str, root: &str) -> bool {
    host == root
        || (host.len() > root.len()
            && host.ends_with(root)
            && host.as_bytes()[host.len() - root.len() - 1] == b'.')
}

fn path_allows(prefix: Option<&str>, target: &TargetDescriptor) -> bool {
    let Some(prefix) = prefix else {
        return true;
    };
    if !target.is_url() {
        return false;
    }
    let path = target.path.as_deref().unwrap_or("/");
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn canonical_host(host: &str) -> String {
    let lower = host.trim().to_lowercase();
    lower.strip_suffix('.').map(str::to_string).unwrap_or(lower)
}

fn strip_port(value: &str) -> &str {
    match value.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.len() <= 5 && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => value,
    }
}

#![forbid(unsafe_code)]

//! SSRF protection for outbound fetches, plus shared security helpers.
//!
//! Both upstream backends take URLs that an attacker can influence, so every
//! outbound fetch is vetted first: hostname blocklists, literal-IP
//! classification, and full DNS resolution where *every* resolved address has
//! to be acceptable. Resolutions are cached in a bounded LRU so repeated
//! checks against the same host stay cheap.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use nix::unistd::Uid;
use parking_lot::Mutex;
use tracing::warn;
use url::{Host, Url};

use crate::settings::SettingsStore;

/// Hard cap on cached DNS entries.
pub const DNS_CACHE_MAX_SIZE: usize = 1000;

/// Hostnames that are never fetched, no matter what they resolve to.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "metadata.google.internal",
    "metadata",
    "kubernetes.default.svc",
    "kubernetes.default",
    "kubernetes",
    "instance-data",
    "169.254.169.254",
];

const BLOCKED_SUFFIXES: &[&str] = &[".internal", ".local", ".localhost"];

/// Outcome of an SSRF check. Malformed input is reported as `Blocked` with a
/// reason instead of an error, so callers treat every negative result
/// uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlCheck {
    Safe,
    Blocked(String),
}

impl UrlCheck {
    pub fn is_safe(&self) -> bool {
        matches!(self, UrlCheck::Safe)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            UrlCheck::Safe => None,
            UrlCheck::Blocked(reason) => Some(reason),
        }
    }
}

struct DnsEntry {
    ips: Vec<IpAddr>,
    resolved_at: Instant,
    last_used: u64,
}

/// LRU cache of hostname resolutions. Entries also expire after a TTL that is
/// independent of the eviction order.
struct DnsCache {
    entries: HashMap<String, DnsEntry>,
    capacity: usize,
    tick: u64,
}

impl DnsCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    /// Returns the cached addresses for `host` if present and within `ttl`,
    /// marking the entry as most recently used.
    fn lookup(&mut self, host: &str, ttl: Duration) -> Option<Vec<IpAddr>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(host)?;
        if entry.resolved_at.elapsed() >= ttl {
            return None;
        }
        entry.last_used = tick;
        Some(entry.ips.clone())
    }

    fn insert(&mut self, host: String, ips: Vec<IpAddr>) {
        self.tick += 1;
        self.entries.insert(
            host,
            DnsEntry {
                ips,
                resolved_at: Instant::now(),
                last_used: self.tick,
            },
        );
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(host, _)| host.clone());
            match oldest {
                Some(host) => {
                    self.entries.remove(&host);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// SSRF validator with a bounded DNS resolution cache.
///
/// Shared by the ingestion loop and the bounded on-demand fetch tasks, hence
/// the mutex around the cache.
pub struct SafeResolver {
    settings: Arc<SettingsStore>,
    cache: Mutex<DnsCache>,
}

impl SafeResolver {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            cache: Mutex::new(DnsCache::with_capacity(DNS_CACHE_MAX_SIZE)),
        }
    }

    /// Checks that `url` does not target loopback, link-local, private, or
    /// reserved networks, or a known internal hostname.
    ///
    /// With `resolve_dns` set, the hostname is resolved and *all* returned
    /// addresses are classified; one bad address blocks the URL. This closes
    /// the DNS-rebinding hole where validation sees one address and the
    /// actual fetch connects to another. Resolution failure blocks too.
    pub async fn is_safe_url(&self, url: &str, resolve_dns: bool) -> UrlCheck {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => return UrlCheck::Blocked(format!("URL parsing error: {err}")),
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return UrlCheck::Blocked(format!("unsupported scheme: {}", parsed.scheme()));
        }
        let host = match parsed.host() {
            Some(host) => host.to_owned(),
            None => return UrlCheck::Blocked("missing hostname".to_string()),
        };

        let domain = match host {
            Host::Ipv4(ip) => return check_literal_ip(IpAddr::V4(ip)),
            Host::Ipv6(ip) => return check_literal_ip(IpAddr::V6(ip)),
            Host::Domain(domain) => domain.to_ascii_lowercase(),
        };

        if BLOCKED_HOSTNAMES.contains(&domain.as_str()) {
            return UrlCheck::Blocked(format!("blocked hostname: {domain}"));
        }
        if domain.contains("metadata") {
            return UrlCheck::Blocked(format!("metadata-like hostname: {domain}"));
        }
        for suffix in BLOCKED_SUFFIXES {
            if domain.ends_with(suffix) {
                return UrlCheck::Blocked(format!("blocked hostname suffix: {suffix}"));
            }
        }

        // IP literals normally parse as Host::Ipv4/Ipv6 above; this catches
        // any remaining textual form.
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return check_literal_ip(ip);
        }

        if resolve_dns {
            let ips = self.resolve_hostname(&domain).await;
            if ips.is_empty() {
                return UrlCheck::Blocked(format!("DNS resolution failed for {domain}"));
            }
            for ip in ips {
                if let Some(reason) = classify_ip(ip) {
                    return UrlCheck::Blocked(format!(
                        "hostname {domain} resolves to {reason} ({ip})"
                    ));
                }
            }
        }

        UrlCheck::Safe
    }

    /// Resolves `hostname` to all of its A and AAAA addresses, serving from
    /// the cache when a fresh entry exists. Failures return an empty list.
    async fn resolve_hostname(&self, hostname: &str) -> Vec<IpAddr> {
        let ttl = Duration::from_secs(self.settings.get().dns_cache_ttl);
        if let Some(ips) = self.cache.lock().lookup(hostname, ttl) {
            return ips;
        }

        match tokio::net::lookup_host((hostname, 0u16)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = Vec::new();
                for addr in addrs {
                    let ip = addr.ip();
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
                if !ips.is_empty() {
                    self.cache.lock().insert(hostname.to_string(), ips.clone());
                }
                ips
            }
            Err(err) => {
                warn!(hostname, %err, "DNS resolution failed");
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    fn seed_dns(&self, hostname: &str, ips: Vec<IpAddr>) {
        self.cache.lock().insert(hostname.to_string(), ips);
    }

    #[cfg(test)]
    fn dns_cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

fn check_literal_ip(ip: IpAddr) -> UrlCheck {
    match classify_ip(ip) {
        Some(reason) => UrlCheck::Blocked(format!("IP address {reason}")),
        None => UrlCheck::Safe,
    }
}

/// Classifies an address for SSRF purposes. Returns `None` when the address
/// is acceptable to fetch from, otherwise the reason it is not.
pub fn classify_ip(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(ip) => classify_ipv4(ip),
        IpAddr::V6(ip) => classify_ipv6(ip),
    }
}

fn classify_ipv4(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback address");
    }
    let octets = ip.octets();
    // CGNAT (100.64.0.0/10) and RFC 2544 benchmarking (198.18.0.0/15) look
    // private to naive checks but are routable in VPN and CGNAT deployments.
    let cgnat = octets[0] == 100 && (64..128).contains(&octets[1]);
    let benchmarking = octets[0] == 198 && (octets[1] == 18 || octets[1] == 19);
    if cgnat || benchmarking {
        return None;
    }
    if ip.is_private() {
        return Some("private address");
    }
    if ip.is_link_local() {
        return Some("link-local address");
    }
    if ip.is_multicast() {
        return Some("multicast address");
    }
    if is_reserved_ipv4(octets) {
        return Some("reserved address");
    }
    None
}

fn is_reserved_ipv4(octets: [u8; 4]) -> bool {
    octets[0] == 0
        || octets[0] >= 240
        || (octets[0] == 192 && octets[1] == 0 && (octets[2] == 0 || octets[2] == 2))
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
}

fn classify_ipv6(ip: Ipv6Addr) -> Option<&'static str> {
    // IPv4-mapped addresses smuggle an IPv4 target inside an IPv6 literal;
    // classify the embedded address instead.
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return classify_ipv4(mapped);
    }
    if ip.is_loopback() {
        return Some("loopback address");
    }
    if ip.is_unspecified() {
        return Some("reserved address");
    }
    let segments = ip.segments();
    if (segments[0] & 0xfe00) == 0xfc00 {
        return Some("private address");
    }
    if (segments[0] & 0xffc0) == 0xfe80 {
        return Some("link-local address");
    }
    if ip.is_multicast() {
        return Some("multicast address");
    }
    if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        return Some("reserved address");
    }
    None
}

/// Basic shape check for URLs that end up on a subprocess command line.
/// Rejects anything that could be mistaken for a flag or a non-HTTP scheme.
pub fn is_valid_url(url: &str) -> bool {
    if url.starts_with('-') {
        return false;
    }
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// Fails fast when a binary is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

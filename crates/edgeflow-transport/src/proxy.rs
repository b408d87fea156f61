//! URL → proxy resolution honoring `http_proxy`, `https_proxy`, `no_proxy`.
//!
//! `ws(s)://` URLs map to `http(s)://` for proxy-selection purposes so the
//! broker's WebSocket endpoint follows the same operator configuration as
//! plain HTTP traffic.

/// Proxy-relevant environment, captured once so resolution is testable.
#[derive(Debug, Clone, Default)]
pub struct ProxyEnv {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyEnv {
    /// Lowercase variables win over their uppercase aliases, matching the
    /// common client behavior.
    pub fn from_env() -> Self {
        let var = |lower: &str, upper: &str| {
            std::env::var(lower).ok().or_else(|| std::env::var(upper).ok())
        };
        Self {
            http_proxy: var("http_proxy", "HTTP_PROXY"),
            https_proxy: var("https_proxy", "HTTPS_PROXY"),
            no_proxy: var("no_proxy", "NO_PROXY"),
        }
    }
}

/// The proxy URL to use for `url`, or `None` for a direct connection.
pub fn proxy_for_url(url: &str, env: &ProxyEnv) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let mapped = match scheme {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };

    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => (h, Some(p)),
        _ => (host_port, None),
    };

    if no_proxy_matches(env.no_proxy.as_deref(), host, port) {
        return None;
    }

    match mapped {
        "https" => env.https_proxy.clone(),
        "http" => env.http_proxy.clone(),
        _ => None,
    }
}

/// Suffix matching per the de-facto `no_proxy` convention: `*` disables all
/// proxying, a leading `.` is ignored, an entry may pin a port.
fn no_proxy_matches(no_proxy: Option<&str>, host: &str, port: Option<&str>) -> bool {
    let Some(list) = no_proxy else { return false };
    for raw in list.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if entry == "*" {
            return true;
        }

        let (entry_host, entry_port) = match entry.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => (h, Some(p)),
            _ => (entry, None),
        };
        if let (Some(ep), Some(p)) = (entry_port, port) {
            if ep != p {
                continue;
            }
        }

        let entry_host = entry_host.trim_start_matches('.');
        if host == entry_host || host.ends_with(&format!(".{entry_host}")) {
            return true;
        }
    }
    false
}

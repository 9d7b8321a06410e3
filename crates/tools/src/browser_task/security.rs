//! Destination checks for everything the browser is asked to load.
//!
//! [`validate`] is a pure function of `(url, allowlist)`. The baseline SSRF
//! denials (loopback, private ranges, localhost aliases, non-http schemes)
//! apply whether or not an allowlist is configured.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

const LOCALHOST_ALIASES: [&str; 2] = ["localhost", "localhost.localdomain"];

/// URLs with any scheme, or bare `name.tld` hosts. Word boundaries around
/// bare hosts are checked by hand in [`extract_destinations`].
static DESTINATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:(?P<scheme>[a-z][a-z0-9+.\-]*)://(?P<url_host>[^/\s?#]*))|(?P<bare_host>(?:[a-z0-9\-]+\.)+[a-z]{2,})",
    )
    .expect("destination pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub decision: Decision,
    pub reason: String,
}

impl ValidationVerdict {
    fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: "allowed".to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

impl fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decision {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Deny => write!(f, "DENY: {}", self.reason),
        }
    }
}

/// Decides whether the browser may load `url`.
pub fn validate(url: &str, allowed_domains: Option<&[String]>) -> ValidationVerdict {
    let parsed = match Url::parse(url.trim()) {
        Ok(u) => u,
        Err(_) => return ValidationVerdict::deny("URL could not be parsed"),
    };

    match parsed.scheme() {
        "http" | "https" => {}
        other => return ValidationVerdict::deny(format!("non-http(s) scheme '{}'", other)),
    }

    let host = match parsed.host() {
        Some(Host::Ipv4(ip)) => {
            if is_blocked_ip(IpAddr::V4(ip)) {
                return ValidationVerdict::deny(format!(
                    "private or loopback address '{}' is not permitted",
                    ip
                ));
            }
            ip.to_string()
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_ip(IpAddr::V6(ip)) {
                return ValidationVerdict::deny(format!(
                    "private or loopback address '{}' is not permitted",
                    ip
                ));
            }
            ip.to_string()
        }
        Some(Host::Domain(domain)) => {
            let domain = normalize_host(domain);
            if domain.is_empty() {
                return ValidationVerdict::deny("URL has no host");
            }
            if is_localhost(&domain) {
                return ValidationVerdict::deny(format!(
                    "local host name '{}' is not permitted",
                    domain
                ));
            }
            domain
        }
        None => return ValidationVerdict::deny("URL has no host"),
    };

    // An empty allowlist matches no host.
    if let Some(allowed) = allowed_domains {
        if !host_matches_allowlist(&host, allowed) {
            return ValidationVerdict::deny(format!(
                "domain '{}' is not in the allowed_domains list",
                host
            ));
        }
    }

    ValidationVerdict::allow()
}

/// Checks every URL or bare domain mentioned in free text, stopping at the
/// first denial. Text without destinations is allowed.
pub fn validate_task_text(task: &str, allowed_domains: Option<&[String]>) -> ValidationVerdict {
    for destination in extract_destinations(task) {
        let verdict = match destination {
            Destination::Url { scheme, host } => {
                if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
                    ValidationVerdict::deny(format!("non-http(s) scheme '{}'", scheme.to_lowercase()))
                } else {
                    validate(&format!("{}://{}/", scheme.to_lowercase(), host), allowed_domains)
                }
            }
            Destination::Bare(host) => validate(&format!("http://{}/", host), allowed_domains),
        };
        if !verdict.is_allowed() {
            return verdict;
        }
    }
    ValidationVerdict::allow()
}

#[derive(Debug, PartialEq, Eq)]
enum Destination<'a> {
    Url { scheme: &'a str, host: &'a str },
    Bare(&'a str),
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn extract_destinations(text: &str) -> Vec<Destination<'_>> {
    let mut found = Vec::new();
    let mut pos = 0;

    while pos <= text.len() {
        let Some(caps) = DESTINATION_PATTERN.captures_at(text, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };

        if let (Some(scheme), Some(host)) = (caps.name("scheme"), caps.name("url_host")) {
            found.push(Destination::Url {
                scheme: scheme.as_str(),
                host: host.as_str(),
            });
            pos = whole.end();
            continue;
        }

        let before_ok = !text[..whole.start()].chars().next_back().is_some_and(is_word_char);
        let after_ok = !text[whole.end()..].chars().next().is_some_and(is_word_char);
        if before_ok && after_ok {
            found.push(Destination::Bare(whole.as_str()));
            pos = whole.end();
        } else {
            // Retry one character later, like a lookbehind miss would.
            let step = text[whole.start()..].chars().next().map_or(1, char::len_utf8);
            pos = whole.start() + step;
        }
    }
    found
}

/// Lowercased host without trailing dots.
fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_lowercase()
}

fn is_localhost(host: &str) -> bool {
    LOCALHOST_ALIASES.contains(&host) || host.ends_with(".localhost")
}

fn is_blocked_ipv4(v4: Ipv4Addr) -> bool {
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
}

fn is_blocked_ipv6(v6: Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
        || v6.to_ipv4_mapped().is_some_and(is_blocked_ipv4)
}

/// Addresses the browser must never be pointed at.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

/// Exact or subdomain match. Entries may carry a `*.` prefix, which means
/// the same thing. Case and trailing dots are ignored on both sides.
pub fn host_matches_allowlist(host: &str, allowed: &[String]) -> bool {
    let host = normalize_host(host);
    allowed.iter().any(|entry| {
        let entry = normalize_host(entry.trim());
        let entry = entry.strip_prefix("*.").unwrap_or(&entry);
        !entry.is_empty() && (host == entry || host.ends_with(&format!(".{}", entry)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn denied(url: &str, allowed: Option<&[String]>) -> bool {
        validate(url, allowed).decision == Decision::Deny
    }

    #[test]
    fn test_internal_hosts_denied_regardless_of_allowlist() {
        let everything = allow(&["localhost", "127.0.0.1", "10.0.0.1", "example.com"]);
        let urls = [
            "http://localhost/",
            "http://LOCALHOST:8080/admin",
            "http://localhost./",
            "http://localhost.localdomain/",
            "http://api.localhost/",
            "http://127.0.0.1/",
            "http://127.8.9.10:3000/",
            "http://10.0.0.1/",
            "http://172.16.5.4/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://0.0.0.0/",
            "http://255.255.255.255/",
            "http://[::1]/",
            "http://[::]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://[::ffff:10.0.0.1]:8080/",
            "http://2130706433/",
            "http://0x7f.0.0.1/",
        ];
        for url in urls {
            assert!(denied(url, None), "{} should be denied", url);
            assert!(denied(url, Some(everything.as_slice())), "{} should be denied with allowlist", url);
        }
    }

    #[test]
    fn test_non_http_schemes_denied() {
        for url in [
            "file:///etc/passwd",
            "ftp://example.com/",
            "javascript:alert(1)",
            "data:text/html,hi",
            "chrome://settings",
            "ws://example.com/",
            "about:blank",
        ] {
            let verdict = validate(url, None);
            assert_eq!(verdict.decision, Decision::Deny, "{}", url);
        }
        assert!(validate("ftp://example.com/", None).reason.contains("scheme"));
    }

    #[test]
    fn test_unparseable_url_denied() {
        assert!(denied("not a url", None));
        assert!(denied("", None));
        assert!(denied("http://", None));
    }

    #[test]
    fn test_public_hosts_allowed_without_allowlist() {
        assert!(validate("https://example.com/path?q=1", None).is_allowed());
        assert!(validate("http://93.184.216.34/", None).is_allowed());
        assert!(validate("https://[2001:db8::1]/", None).is_allowed());
        let none: Vec<String> = Vec::new();
        assert!(validate("https://example.com", Some(none.as_slice())).is_allowed());
    }

    #[test]
    fn test_allowlist_exact_and_subdomain() {
        let list = allow(&["example.com"]);
        assert!(validate("https://example.com/", Some(list.as_slice())).is_allowed());
        assert!(validate("https://docs.Example.COM/", Some(list.as_slice())).is_allowed());
        assert!(validate("https://example.com./", Some(list.as_slice())).is_allowed());
        assert!(denied("https://notexample.com/", Some(list.as_slice())));
        assert!(denied("https://example.com.evil.test/", Some(list.as_slice())));
        assert!(denied("https://evil.test/", Some(list.as_slice())));
        assert!(denied("https://93.184.216.34/", Some(list.as_slice())));
    }

    #[test]
    fn test_empty_allowlist_matches_nothing() {
        let none: Vec<String> = Vec::new();
        assert!(denied("https://example.com/", Some(none.as_slice())));
        assert!(!host_matches_allowlist("example.com", &allow(&["", "*."])));
    }

    #[test]
    fn test_allowlist_wildcard_and_case() {
        let list = allow(&["*.Example.com", "shop.test."]);
        assert!(host_matches_allowlist("example.com", &list));
        assert!(host_matches_allowlist("a.b.example.com", &list));
        assert!(host_matches_allowlist("SHOP.TEST", &list));
        assert!(!host_matches_allowlist("other.com", &list));
        assert!(!host_matches_allowlist("myshop.test", &list));
    }

    #[test]
    fn test_deny_reason_names_host() {
        let list = allow(&["example.com"]);
        let verdict = validate("https://evil.test/login", Some(list.as_slice()));
        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reason.contains("evil.test"));
        assert!(verdict.to_string().starts_with("DENY"));
    }

    #[test]
    fn test_extract_destinations() {
        let found = extract_destinations(
            "Open https://shop.example.com:8443/cart then compare with Amazon.com, not foo_bar.com",
        );
        assert_eq!(
            found,
            vec![
                Destination::Url {
                    scheme: "https",
                    host: "shop.example.com:8443"
                },
                Destination::Bare("Amazon.com"),
            ]
        );
        assert!(extract_destinations("search for cheap flights").is_empty());
    }

    #[test]
    fn test_task_text_preflight() {
        let list = allow(&["example.com"]);
        assert!(validate_task_text("Find the price on example.com", Some(list.as_slice())).is_allowed());
        assert!(validate_task_text("Go to https://docs.example.com/x", Some(list.as_slice())).is_allowed());
        assert!(validate_task_text("Search the web for rust books", Some(list.as_slice())).is_allowed());

        let verdict = validate_task_text("Then visit evil.test and log in", Some(list.as_slice()));
        assert_eq!(verdict.decision, Decision::Deny);

        assert!(!validate_task_text("Open http://localhost:8080/admin", None).is_allowed());
        assert!(!validate_task_text("Open http://192.168.0.1/", None).is_allowed());
        assert!(!validate_task_text("Read file:///etc/passwd", None).is_allowed());
        assert!(!validate_task_text("try http://user@127.0.0.1/", None).is_allowed());
    }
}

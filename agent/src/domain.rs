//! Domain normalization for tracked hosts and exclusion lists.
//!
//! Every hostname that enters the agent, whether from a tab URL or from the
//! user's exclusion list, passes through [`normalize_domain`] so that
//! comparisons happen on one canonical form:
//!
//! - lowercase, punycoded (via the [`url`] crate)
//! - no scheme, port, path, query or trailing dot
//! - a leading `www.` label is dropped
//!
//! # Example
//!
//! ```
//! use tabpulse_agent::domain::{normalize_domain, ExclusionList};
//!
//! assert_eq!(
//!     normalize_domain("https://WWW.Example.com:8443/inbox").unwrap(),
//!     "example.com"
//! );
//!
//! let exclusions = ExclusionList::from_entries(["example.com"]);
//! assert!(exclusions.is_excluded("mail.example.com"));
//! assert!(!exclusions.is_excluded("example.org"));
//! ```

use std::collections::BTreeSet;
use std::net::Ipv6Addr;

use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

/// Maximum length of a full hostname.
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Schemes whose pages are tracked.
const WEB_SCHEMES: &[&str] = &["http", "https"];

/// Errors produced while normalizing a domain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The input was empty or whitespace.
    #[error("domain is empty")]
    Empty,

    /// The input could not be parsed as a host or URL.
    #[error("invalid URL or host: {0}")]
    InvalidUrl(String),

    /// The URL uses a scheme that is never tracked (e.g. `chrome://`).
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// A label contains forbidden characters or has a bad length.
    #[error("invalid domain label: {0}")]
    InvalidLabel(String),

    /// The hostname exceeds 253 characters.
    #[error("domain too long ({0} characters)")]
    TooLong(usize),
}

/// Normalizes a hostname or URL into its canonical tracked form.
///
/// Accepts bare hosts (`Example.COM`), hosts with ports (`localhost:3000`) and
/// full URLs. `localhost` and IP literals are returned verbatim.
///
/// # Errors
///
/// Returns a [`DomainError`] if the input is empty, unparsable, uses a
/// non-web scheme, or contains an invalid label.
pub fn normalize_domain(input: &str) -> Result<String, DomainError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Empty);
    }

    let url = parse_as_url(trimmed)?;

    let host = url
        .host()
        .ok_or_else(|| DomainError::InvalidUrl(trimmed.to_string()))?;

    match host {
        Host::Ipv4(addr) => Ok(addr.to_string()),
        Host::Ipv6(addr) => Ok(format!("[{addr}]")),
        Host::Domain(name) => canonicalize_name(name),
    }
}

/// Extracts the tracked domain from a tab URL.
///
/// Returns `None` for non-web pages (`chrome://`, `about:blank`, `file://`)
/// and for anything that fails normalization.
#[must_use]
pub fn domain_from_url(url: &str) -> Option<String> {
    normalize_domain(url).ok()
}

/// Parses the input as a URL, assuming `http://` when no scheme is present.
///
/// A bare IPv6 literal gets brackets first; its colons would otherwise read
/// as a scheme or port separator.
fn parse_as_url(input: &str) -> Result<Url, DomainError> {
    let candidate = if input.parse::<Ipv6Addr>().is_ok() {
        format!("http://[{input}]")
    } else if input.contains("://") {
        input.to_string()
    } else if let Some(scheme) = leading_scheme(input) {
        return Err(DomainError::UnsupportedScheme(scheme.to_ascii_lowercase()));
    } else {
        format!("http://{input}")
    };

    let url = Url::parse(&candidate).map_err(|_| DomainError::InvalidUrl(input.to_string()))?;

    if !WEB_SCHEMES.contains(&url.scheme()) {
        return Err(DomainError::UnsupportedScheme(url.scheme().to_string()));
    }

    Ok(url)
}

/// Detects `scheme:rest` inputs without `//`, such as `about:blank`.
///
/// `host:port` is not a scheme: the part after the colon starts with a digit.
fn leading_scheme(input: &str) -> Option<&str> {
    let (scheme, rest) = input.split_once(':')?;
    let looks_like_scheme = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic());
    let looks_like_port = rest.starts_with(|c: char| c.is_ascii_digit());

    (looks_like_scheme && !looks_like_port).then_some(scheme)
}

/// Validates a DNS name and applies the canonical rewrites.
fn canonicalize_name(name: &str) -> Result<String, DomainError> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return Err(DomainError::Empty);
    }

    let name = match name.strip_prefix("www.") {
        Some(rest) if rest.contains('.') => rest.to_string(),
        _ => name,
    };

    if name.len() > MAX_DOMAIN_LEN {
        return Err(DomainError::TooLong(name.len()));
    }

    for label in name.split('.') {
        validate_label(label)?;
    }

    Ok(name)
}

fn validate_label(label: &str) -> Result<(), DomainError> {
    let valid = !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidLabel(label.to_string()))
    }
}

/// A set of normalized domains excluded from tracking.
///
/// Matching covers subdomains: excluding `example.com` also excludes
/// `mail.example.com`, but not `notexample.com`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionList {
    domains: BTreeSet<String>,
}

impl ExclusionList {
    /// Creates an empty exclusion list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an exclusion list from raw entries.
    ///
    /// Entries are normalized and deduplicated; invalid entries are dropped
    /// with a warning.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for entry in entries {
            let raw = entry.as_ref();
            match normalize_domain(raw) {
                Ok(domain) => {
                    list.domains.insert(domain);
                }
                Err(e) => warn!(entry = %raw, error = %e, "Dropping invalid exclusion entry"),
            }
        }
        list
    }

    /// Adds an already-normalized domain. Returns `true` if it was new.
    pub fn insert(&mut self, domain: String) -> bool {
        self.domains.insert(domain)
    }

    /// Removes a normalized domain. Returns `true` if it was present.
    pub fn remove(&mut self, domain: &str) -> bool {
        self.domains.remove(domain)
    }

    /// Returns true if the exact normalized domain is listed.
    #[must_use]
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    /// Returns true if `domain` or one of its parent domains is listed.
    #[must_use]
    pub fn is_excluded(&self, domain: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }
        if self.domains.contains(domain) {
            return true;
        }
        // IP literals only ever match exactly.
        if domain.starts_with('[') || domain.parse::<std::net::Ipv4Addr>().is_ok() {
            return false;
        }

        let mut rest = domain;
        while let Some((_, parent)) = rest.split_once('.') {
            if self.domains.contains(parent) {
                return true;
            }
            rest = parent;
        }
        false
    }

    /// Number of listed domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns true if nothing is excluded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Iterates listed domains in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    /// Returns the listed domains as a sorted vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.domains.iter().cloned().collect()
    }
}

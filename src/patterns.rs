//! Pattern & naming utilities
//!
//! Leaf helpers used by the compiler:
//! - IP / CIDR parsing and validation
//! - CIDR → anchored prefix matcher for `$remote_addr` regex tests
//! - escaping and quoting of literals for the proxy engine's config syntax
//! - artifact file name sanitization

use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while interpreting address or pattern input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("value contains control characters: {0:?}")]
    ControlCharacters(String),
}

/// A parsed allow/deny list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSpec {
    /// Single address
    Addr(IpAddr),
    /// Network in CIDR notation
    Network { addr: IpAddr, prefix: u8 },
}

impl IpSpec {
    /// Parse an IP address or CIDR block
    pub fn parse(input: &str) -> Result<Self, PatternError> {
        let input = input.trim();

        if let Some((ip_part, prefix_part)) = input.split_once('/') {
            let prefix: u8 = prefix_part
                .parse()
                .map_err(|_| PatternError::InvalidCidr(input.to_string()))?;
            let addr = IpAddr::from_str(ip_part)
                .map_err(|_| PatternError::InvalidCidr(input.to_string()))?;

            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max_prefix {
                return Err(PatternError::InvalidCidr(input.to_string()));
            }

            return Ok(IpSpec::Network { addr, prefix });
        }

        IpAddr::from_str(input)
            .map(IpSpec::Addr)
            .map_err(|_| PatternError::InvalidIp(input.to_string()))
    }

    /// Canonical text form (`1.2.3.4` or `10.0.0.0/8`)
    pub fn canonical(&self) -> String {
        match self {
            IpSpec::Addr(addr) => addr.to_string(),
            IpSpec::Network { addr, prefix } => format!("{}/{}", addr, prefix),
        }
    }
}

/// Validate an IP address or CIDR block
pub fn validate_ip_or_cidr(input: &str) -> Result<(), PatternError> {
    IpSpec::parse(input).map(|_| ())
}

/// Number of leading IPv4 octets a matcher anchors for a given prefix length.
///
/// Prefixes shorter than /8 still anchor one octet. That over-matches very
/// broad ranges; matchers are only ever used for allow-lists.
pub fn anchored_octets(prefix: u8) -> usize {
    match prefix {
        24..=u8::MAX => 3,
        16..=23 => 2,
        _ => 1,
    }
}

/// Number of leading IPv6 hextets a matcher anchors for a given prefix length
pub fn anchored_hextets(prefix: u8) -> usize {
    usize::from(prefix / 16).clamp(1, 8)
}

/// Convert an IP or CIDR entry into a regex anchored at the start of the
/// client address.
///
/// `10.1.2.0/24` → `^10\.1\.2\.`, `10.1.0.0/16` → `^10\.1\.`,
/// `10.0.0.0/8` → `^10\.`. Anything without a `/` is matched as an exact,
/// escaped literal: `10.1.2.3` → `^10\.1\.2\.3$`.
pub fn cidr_to_matcher(input: &str) -> Result<String, PatternError> {
    let input = input.trim();

    if !input.contains('/') {
        return Ok(format!("^{}$", regex::escape(input)));
    }

    match IpSpec::parse(input)? {
        IpSpec::Network { addr: IpAddr::V4(v4), prefix } => {
            let octets = v4.octets();
            let anchored: Vec<String> = octets[..anchored_octets(prefix)]
                .iter()
                .map(|o| o.to_string())
                .collect();
            Ok(format!("^{}\\.", anchored.join("\\.")))
        }
        IpSpec::Network { addr: IpAddr::V6(v6), prefix } => {
            // $remote_addr carries the compressed form, which never zero-pads
            // a hextet, so the anchored groups are rendered unpadded too.
            let groups: Vec<String> = v6.segments()[..anchored_hextets(prefix)]
                .iter()
                .map(|s| format!("{:x}", s))
                .collect();
            Ok(format!("^{}:", groups.join(":")))
        }
        IpSpec::Addr(addr) => Ok(format!("^{}$", regex::escape(&addr.to_string()))),
    }
}

/// Quote a value for a double-quoted string in the proxy engine's config.
///
/// Embedded quotes are escaped; CR, LF and other control characters are
/// rejected since they could terminate the directive.
pub fn quote(value: &str) -> Result<String, PatternError> {
    if value.chars().any(|c| c.is_control()) {
        return Err(PatternError::ControlCharacters(value.to_string()));
    }
    Ok(format!("\"{}\"", value.replace('"', "\\\"")))
}

/// Sanitize a name into `[a-z0-9-_]`: every run of other characters becomes
/// a single `_`, leading/trailing `_` are trimmed and the result is
/// lower-cased. May return an empty string.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }

    out.trim_matches('_').to_string()
}

/// Deterministic artifact file name for an entity.
///
/// Uses the sanitized preferred name (a host's first domain) and falls back
/// to `<kind>_<id>` when nothing usable remains.
pub fn artifact_file_name(kind: &str, preferred: Option<&str>, id: &str) -> String {
    let stem = preferred.map(sanitize_name).unwrap_or_default();
    if stem.is_empty() {
        let id = sanitize_name(id);
        let id = if id.is_empty() { "unknown".to_string() } else { id };
        format!("{}_{}.conf", sanitize_name(kind), id)
    } else {
        format!("{}.conf", stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ip_and_cidr() {
        assert!(matches!(IpSpec::parse("192.168.1.1"), Ok(IpSpec::Addr(_))));
        assert!(matches!(
            IpSpec::parse("10.0.0.0/8"),
            Ok(IpSpec::Network { prefix: 8, .. })
        ));
        assert!(matches!(
            IpSpec::parse("2001:db8::/32"),
            Ok(IpSpec::Network { prefix: 32, .. })
        ));
        assert_eq!(
            IpSpec::parse("10.0.0.0/33"),
            Err(PatternError::InvalidCidr("10.0.0.0/33".to_string()))
        );
        assert_eq!(
            IpSpec::parse("10.0.0/8"),
            Err(PatternError::InvalidCidr("10.0.0/8".to_string()))
        );
        assert_eq!(
            IpSpec::parse("not-an-ip"),
            Err(PatternError::InvalidIp("not-an-ip".to_string()))
        );
    }

    #[test]
    fn test_cidr_matchers_by_prefix() {
        assert_eq!(cidr_to_matcher("192.168.1.0/24").unwrap(), r"^192\.168\.1\.");
        assert_eq!(cidr_to_matcher("192.168.1.7/32").unwrap(), r"^192\.168\.1\.");
        assert_eq!(cidr_to_matcher("172.16.0.0/16").unwrap(), r"^172\.16\.");
        assert_eq!(cidr_to_matcher("172.16.0.0/12").unwrap(), r"^172\.");
        assert_eq!(cidr_to_matcher("10.0.0.0/8").unwrap(), r"^10\.");
        // Broader than /8 degrades to one anchored octet
        assert_eq!(cidr_to_matcher("64.0.0.0/2").unwrap(), r"^64\.");
    }

    #[test]
    fn test_exact_literal_is_escaped() {
        assert_eq!(cidr_to_matcher("10.1.2.3").unwrap(), r"^10\.1\.2\.3$");
        assert_eq!(cidr_to_matcher(" ::1 ").unwrap(), r"^::1$");
    }

    #[test]
    fn test_ipv6_matcher() {
        assert_eq!(cidr_to_matcher("2001:db8::/32").unwrap(), "^2001:db8:");
        assert_eq!(cidr_to_matcher("fd00::/8").unwrap(), "^fd00:");
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        assert!(cidr_to_matcher("10.0.0.0/abc").is_err());
        assert!(cidr_to_matcher("300.0.0.0/8").is_err());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("^/admin").unwrap(), "\"^/admin\"");
        assert_eq!(quote("a\"b").unwrap(), "\"a\\\"b\"");
        assert!(quote("evil\r\nreturn 200").is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("www.Example.com"), "www_example_com");
        assert_eq!(sanitize_name("*.api.example.com"), "api_example_com");
        assert_eq!(sanitize_name("my-site..io"), "my-site_io");
        assert_eq!(sanitize_name("***"), "");
    }

    #[test]
    fn test_artifact_file_name_fallback() {
        assert_eq!(
            artifact_file_name("host", Some("shop.example.com"), "42"),
            "shop_example_com.conf"
        );
        assert_eq!(artifact_file_name("host", Some("..."), "42"), "host_42.conf");
        assert_eq!(artifact_file_name("host", None, "42"), "host_42.conf");
        assert_eq!(artifact_file_name("host", None, "///"), "host_unknown.conf");
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_deterministic_and_clean(raw in ".{0,64}") {
            let a = sanitize_name(&raw);
            let b = sanitize_name(&raw);
            prop_assert_eq!(&a, &b);
            prop_assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
            prop_assert!(!a.starts_with('_') && !a.ends_with('_'));
            prop_assert!(!a.contains("__"));
        }

        #[test]
        fn prop_ipv4_matcher_anchors_expected_octets(
            a in any::<u8>(),
            b in any::<u8>(),
            c in any::<u8>(),
            d in any::<u8>(),
            prefix in 0u8..=32,
        ) {
            let matcher = cidr_to_matcher(&format!("{}.{}.{}.{}/{}", a, b, c, d, prefix)).unwrap();
            let expected = if prefix >= 24 { 3 } else if prefix >= 16 { 2 } else { 1 };
            prop_assert!(matcher.starts_with('^'));
            prop_assert_eq!(matcher.matches("\\.").count(), expected);
            let first_octet = format!("^{}\\.", a);
            prop_assert!(matcher.starts_with(&first_octet));
        }
    }
}

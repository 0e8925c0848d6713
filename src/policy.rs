/// Security Policy Definitions
///
/// Declarative per-host and global security profiles as stored by the
/// policy store, plus the banned-IP record. Absence of a sub-config means
/// the capability is disabled for that host.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::patterns::{validate_ip_or_cidr, PatternError};

// =============================================================================
// VALIDATION CONSTANTS
// =============================================================================

/// WAF paranoia bounds (OWASP CRS)
pub const MIN_PARANOIA_LEVEL: u8 = 1;
pub const MAX_PARANOIA_LEVEL: u8 = 4;

/// Maximum domain name length
pub const MAX_DOMAIN_LENGTH: usize = 253;

/// Default cache TTL emitted for hosts that don't set one
pub const DEFAULT_CACHE_TTL: &str = "7d";

/// Default CAPTCHA token validity (24 hours)
pub const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 86_400;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("static domain regex")
});

static NGINX_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(ms|s|m|h|d|w|M|y)?$").expect("static time regex"));

static HOST_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").expect("static host id regex"));

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static slug regex"));

/// Host identifier as issued by the policy store
pub type HostId = String;

// =============================================================================
// ERROR TYPES
// =============================================================================

/// A policy rule that cannot be compiled, always attributable to one rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid rule '{rule}': {reason}")]
pub struct ValidationError {
    /// Dotted path of the offending rule, e.g. `uri_block.rules[2].pattern`
    pub rule: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    fn from_pattern(rule: impl Into<String>, err: PatternError) -> Self {
        Self::new(rule, err.to_string())
    }
}

// =============================================================================
// WAF
// =============================================================================

/// WAF enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WafMode {
    /// Log matches, never block
    Detect,
    /// Block matching requests
    #[default]
    Block,
}

/// Disable one WAF rule, optionally only below a path prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WafExclusion {
    pub rule_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Automatic ban after repeated WAF hits from one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoBanConfig {
    /// Events within the window that trigger a ban
    pub threshold: u64,
    #[serde(default = "default_auto_ban_window_secs")]
    pub window_secs: u64,
    /// Ban duration; 0 bans permanently
    #[serde(default = "default_auto_ban_secs")]
    pub ban_secs: u64,
}

fn default_auto_ban_window_secs() -> u64 { 300 }
fn default_auto_ban_secs() -> u64 { 3600 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WafConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: WafMode,
    /// OWASP CRS paranoia level, clamped to 1-4 at compile time
    #[serde(default = "default_paranoia_level")]
    pub paranoia_level: u8,
    #[serde(default)]
    pub exclusions: Vec<WafExclusion>,
    #[serde(default)]
    pub auto_ban: Option<AutoBanConfig>,
}

fn default_paranoia_level() -> u8 { 1 }

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: WafMode::Block,
            paranoia_level: 1,
            exclusions: Vec::new(),
            auto_ban: None,
        }
    }
}

impl WafConfig {
    pub fn effective_paranoia(&self) -> u8 {
        self.paranoia_level.clamp(MIN_PARANOIA_LEVEL, MAX_PARANOIA_LEVEL)
    }
}

// =============================================================================
// GEO
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeoMode {
    /// Only listed countries may pass
    Whitelist,
    /// Listed countries are denied
    #[default]
    Blacklist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoConfig {
    #[serde(default)]
    pub mode: GeoMode,
    /// ISO 3166-1 alpha-2 codes; empty means no geo restriction
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub allow_private_ips: bool,
    #[serde(default)]
    pub allow_search_bots: bool,
    /// Selects the challenge pipeline instead of direct blocking
    #[serde(default)]
    pub challenge_mode: bool,
}

impl GeoConfig {
    /// Upper-cased, de-duplicated, sorted country codes
    pub fn normalized_countries(&self) -> Vec<String> {
        let mut countries: Vec<String> = self
            .countries
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        countries.sort();
        countries.dedup();
        countries
    }

    /// Whether this config restricts anything at all
    pub fn is_restrictive(&self) -> bool {
        !self.normalized_countries().is_empty()
    }

    fn validate(&self, prefix: &str) -> Result<(), ValidationError> {
        for (i, country) in self.countries.iter().enumerate() {
            let code = country.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ValidationError::new(
                    format!("{}.countries[{}]", prefix, i),
                    format!("'{}' is not an ISO 3166-1 alpha-2 country code", country),
                ));
            }
        }
        validate_ip_list(&format!("{}.allowed_ips", prefix), &self.allowed_ips)
    }
}

// =============================================================================
// BOT FILTER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BotFilterConfig {
    #[serde(default)]
    pub block_bad_bots: bool,
    #[serde(default)]
    pub block_ai_bots: bool,
    #[serde(default)]
    pub allow_search_engines: bool,
    /// Mark automation clients for a challenge (challenge pipeline only)
    #[serde(default)]
    pub challenge_suspicious: bool,
    /// Extra User-Agent patterns to block (regex)
    #[serde(default)]
    pub custom_blocked_agents: Vec<String>,
    /// Extra User-Agent patterns that bypass the bot filter (regex)
    #[serde(default)]
    pub custom_allowed_agents: Vec<String>,
}

// =============================================================================
// RATE LIMIT
// =============================================================================

/// What a rate-limit window is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    Ip,
    Uri,
    IpUri,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Ip => "ip",
            RateLimitScope::Uri => "uri",
            RateLimitScope::IpUri => "ip_uri",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub scope: RateLimitScope,
    #[serde(default = "default_rate_limit_response_code")]
    pub response_code: u16,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

fn default_burst() -> u32 { 10 }
fn default_rate_limit_response_code() -> u16 { 429 }

impl RateLimitConfig {
    /// Requests admitted per one-second window (steady rate plus burst)
    pub fn window_limit(&self) -> u64 {
        u64::from(self.rps) + u64::from(self.burst)
    }

    /// Sliding-window key for one request
    pub fn limiter_key(&self, host_id: &str, client_ip: &str, uri: &str) -> String {
        match self.scope {
            RateLimitScope::Ip => format!("{}:ip:{}", host_id, client_ip),
            RateLimitScope::Uri => format!("{}:uri:{}", host_id, uri),
            RateLimitScope::IpUri => format!("{}:ip_uri:{}:{}", host_id, client_ip, uri),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.rps == 0 {
            return Err(ValidationError::new("rate_limit.rps", "must be a positive integer"));
        }
        if self.burst == 0 {
            return Err(ValidationError::new("rate_limit.burst", "must be a positive integer"));
        }
        if !(400..=599).contains(&self.response_code) {
            return Err(ValidationError::new(
                "rate_limit.response_code",
                format!("{} is not a 4xx/5xx status", self.response_code),
            ));
        }
        validate_ip_list("rate_limit.whitelist", &self.whitelist)
    }
}

// =============================================================================
// FAIL2BAN
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Fail2banAction {
    #[default]
    BanHost,
    BanGlobal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fail2banConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Window in seconds
    #[serde(default = "default_find_time")]
    pub find_time: u64,
    /// Ban duration in seconds; 0 bans permanently
    #[serde(default = "default_ban_time")]
    pub ban_time: u64,
    #[serde(default = "default_fail_codes")]
    pub fail_codes: Vec<u16>,
    #[serde(default)]
    pub action: Fail2banAction,
}

fn default_max_retries() -> u32 { 5 }
fn default_find_time() -> u64 { 600 }
fn default_ban_time() -> u64 { 3600 }
fn default_fail_codes() -> Vec<u16> { vec![401, 403] }

impl Default for Fail2banConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            find_time: default_find_time(),
            ban_time: default_ban_time(),
            fail_codes: default_fail_codes(),
            action: Fail2banAction::BanHost,
        }
    }
}

impl Fail2banConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retries == 0 {
            return Err(ValidationError::new("fail2ban.max_retries", "must be positive"));
        }
        if self.find_time == 0 {
            return Err(ValidationError::new("fail2ban.find_time", "must be positive"));
        }
        for (i, code) in self.fail_codes.iter().enumerate() {
            if !(100..=599).contains(code) {
                return Err(ValidationError::new(
                    format!("fail2ban.fail_codes[{}]", i),
                    format!("{} is not an HTTP status", code),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// URI BLOCK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UriMatchType {
    Exact,
    #[default]
    Prefix,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriBlockRule {
    pub pattern: String,
    #[serde(default)]
    pub match_type: UriMatchType,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UriBlockConfig {
    #[serde(default)]
    pub rules: Vec<UriBlockRule>,
    #[serde(default)]
    pub exception_ips: Vec<String>,
    #[serde(default)]
    pub allow_private_ips: bool,
}

impl UriBlockConfig {
    fn validate(&self, prefix: &str) -> Result<(), ValidationError> {
        for (i, rule) in self.rules.iter().enumerate() {
            let path = format!("{}.rules[{}].pattern", prefix, i);
            if rule.pattern.trim().is_empty() {
                return Err(ValidationError::new(path, "pattern is empty"));
            }
            validate_literal(&path, &rule.pattern)?;
            if rule.match_type == UriMatchType::Regex {
                validate_regex(&path, &rule.pattern)?;
            }
        }
        validate_ip_list(&format!("{}.exception_ips", prefix), &self.exception_ips)
    }
}

// =============================================================================
// CLOUD PROVIDER BLOCK
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CloudProviderBlockConfig {
    /// Provider slugs as known to the engine's provider-range map (`aws`, `gcp`, ...)
    #[serde(default)]
    pub blocked_provider_slugs: Vec<String>,
    #[serde(default)]
    pub challenge_mode: bool,
}

// =============================================================================
// CHALLENGE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    RecaptchaV2,
    RecaptchaV3,
    Hcaptcha,
    #[default]
    Turnstile,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::RecaptchaV2 => "recaptcha_v2",
            ChallengeType::RecaptchaV3 => "recaptcha_v3",
            ChallengeType::Hcaptcha => "hcaptcha",
            ChallengeType::Turnstile => "turnstile",
        }
    }
}

/// Secret that never shows up in Debug output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default, rename = "type")]
    pub challenge_type: ChallengeType,
    pub site_key: String,
    #[serde(default)]
    pub secret_key: SecretString,
    #[serde(default = "default_token_validity")]
    pub token_validity_secs: u64,
    /// Minimum score for score-based providers (reCAPTCHA v3)
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_token_validity() -> u64 { DEFAULT_TOKEN_VALIDITY_SECS }
fn default_min_score() -> f32 { 0.5 }

impl ChallengeConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.site_key.trim().is_empty() {
            return Err(ValidationError::new("challenge.site_key", "site key is empty"));
        }
        validate_literal("challenge.site_key", &self.site_key)?;
        if self.token_validity_secs == 0 {
            return Err(ValidationError::new("challenge.token_validity_secs", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(ValidationError::new(
                "challenge.min_score",
                format!("{} is outside 0.0-1.0", self.min_score),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// ACCESS LIST / EXPLOIT BLOCK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub action: AccessAction,
    /// IP, CIDR or `all`
    pub address: String,
}

/// Ordered allow/deny rules; first match wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccessListConfig {
    #[serde(default)]
    pub rules: Vec<AccessRule>,
    /// Applied when no rule matches
    #[serde(default)]
    pub default_action: AccessAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploitCategory {
    Sqli,
    Xss,
    PathTraversal,
    Rce,
    Scanner,
}

impl ExploitCategory {
    pub const ALL: [ExploitCategory; 5] = [
        ExploitCategory::Sqli,
        ExploitCategory::Xss,
        ExploitCategory::PathTraversal,
        ExploitCategory::Rce,
        ExploitCategory::Scanner,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploitBlockConfig {
    #[serde(default = "default_exploit_categories")]
    pub categories: Vec<ExploitCategory>,
    #[serde(default)]
    pub exception_ips: Vec<String>,
}

fn default_exploit_categories() -> Vec<ExploitCategory> {
    ExploitCategory::ALL.to_vec()
}

impl Default for ExploitBlockConfig {
    fn default() -> Self {
        Self {
            categories: default_exploit_categories(),
            exception_ips: Vec::new(),
        }
    }
}

// =============================================================================
// PROFILES
// =============================================================================

/// Complete security policy for one proxied host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSecurityProfile {
    pub id: HostId,
    pub domains: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub waf: Option<WafConfig>,
    #[serde(default)]
    pub geo: Option<GeoConfig>,
    #[serde(default)]
    pub bot_filter: Option<BotFilterConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub fail2ban: Option<Fail2banConfig>,
    #[serde(default)]
    pub uri_block: Option<UriBlockConfig>,
    #[serde(default)]
    pub cloud_provider_block: Option<CloudProviderBlockConfig>,
    #[serde(default)]
    pub challenge: Option<ChallengeConfig>,
    #[serde(default)]
    pub access_list: Option<AccessListConfig>,
    #[serde(default)]
    pub exploit_block: Option<ExploitBlockConfig>,
    /// Priority allow IP/CIDR entries honoured by every layer
    #[serde(default)]
    pub priority_allow_ips: Vec<String>,
    /// URI path prefixes exempt from blocking layers
    #[serde(default)]
    pub bypass_paths: Vec<String>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
}

fn default_true() -> bool { true }
fn default_cache_ttl() -> String { DEFAULT_CACHE_TTL.to_string() }

impl HostSecurityProfile {
    /// Bare profile with every capability disabled
    pub fn new(id: impl Into<HostId>, domains: Vec<String>) -> Self {
        Self {
            id: id.into(),
            domains,
            enabled: true,
            waf: None,
            geo: None,
            bot_filter: None,
            rate_limit: None,
            fail2ban: None,
            uri_block: None,
            cloud_provider_block: None,
            challenge: None,
            access_list: None,
            exploit_block: None,
            priority_allow_ips: Vec::new(),
            bypass_paths: Vec::new(),
            cache_ttl: default_cache_ttl(),
        }
    }

    /// First domain name, which names the artifact
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.iter().map(|d| d.trim()).find(|d| !d.is_empty())
    }

    /// Whether GeoIP runs in challenge (mark-only) mode
    pub fn geo_challenge_mode(&self) -> bool {
        self.geo.as_ref().map_or(false, |g| g.challenge_mode)
    }

    /// Validate everything the compiler will render. Zero domains is
    /// checked separately by the compiler since it is an input error
    /// rather than a rule error.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !HOST_ID_RE.is_match(&self.id) {
            return Err(ValidationError::new("id", format!("'{}' is not a valid host id", self.id.escape_debug())));
        }

        for (i, domain) in self.domains.iter().enumerate() {
            let domain = domain.trim();
            if domain.len() > MAX_DOMAIN_LENGTH || !DOMAIN_RE.is_match(domain) {
                return Err(ValidationError::new(
                    format!("domains[{}]", i),
                    format!("'{}' is not a valid domain name", domain),
                ));
            }
        }

        if !NGINX_TIME_RE.is_match(&self.cache_ttl) {
            return Err(ValidationError::new(
                "cache_ttl",
                format!("'{}' is not a duration like 30m or 7d", self.cache_ttl),
            ));
        }

        validate_ip_list("priority_allow_ips", &self.priority_allow_ips)?;
        for (i, path) in self.bypass_paths.iter().enumerate() {
            validate_path(&format!("bypass_paths[{}]", i), path)?;
        }

        if let Some(waf) = &self.waf {
            validate_waf_exclusions("waf.exclusions", &waf.exclusions)?;
            if let Some(auto_ban) = &waf.auto_ban {
                if auto_ban.threshold == 0 || auto_ban.window_secs == 0 {
                    return Err(ValidationError::new(
                        "waf.auto_ban",
                        "threshold and window_secs must be positive",
                    ));
                }
            }
        }
        if let Some(geo) = &self.geo {
            geo.validate("geo")?;
        }
        if let Some(bots) = &self.bot_filter {
            for (i, agent) in bots.custom_blocked_agents.iter().enumerate() {
                let path = format!("bot_filter.custom_blocked_agents[{}]", i);
                validate_literal(&path, agent)?;
                validate_regex(&path, agent)?;
            }
            for (i, agent) in bots.custom_allowed_agents.iter().enumerate() {
                let path = format!("bot_filter.custom_allowed_agents[{}]", i);
                validate_literal(&path, agent)?;
                validate_regex(&path, agent)?;
            }
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(fail2ban) = &self.fail2ban {
            fail2ban.validate()?;
        }
        if let Some(uri_block) = &self.uri_block {
            uri_block.validate("uri_block")?;
        }
        if let Some(cloud) = &self.cloud_provider_block {
            for (i, slug) in cloud.blocked_provider_slugs.iter().enumerate() {
                if !SLUG_RE.is_match(slug) {
                    return Err(ValidationError::new(
                        format!("cloud_provider_block.blocked_provider_slugs[{}]", i),
                        format!("'{}' is not a provider slug", slug),
                    ));
                }
            }
        }
        if let Some(challenge) = &self.challenge {
            challenge.validate()?;
        }
        if let Some(access) = &self.access_list {
            for (i, rule) in access.rules.iter().enumerate() {
                if rule.address != "all" {
                    validate_ip_or_cidr(&rule.address).map_err(|e| {
                        ValidationError::from_pattern(format!("access_list.rules[{}].address", i), e)
                    })?;
                }
            }
        }
        if let Some(exploit) = &self.exploit_block {
            validate_ip_list("exploit_block.exception_ips", &exploit.exception_ips)?;
        }

        Ok(())
    }
}

/// Global security settings, evaluated ahead of and unioned with every host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GlobalSecurityProfile {
    #[serde(default)]
    pub geo: Option<GeoConfig>,
    #[serde(default)]
    pub uri_block: Option<UriBlockConfig>,
    #[serde(default)]
    pub waf_exclusions: Vec<WafExclusion>,
}

impl GlobalSecurityProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(geo) = &self.geo {
            geo.validate("global.geo")?;
        }
        if let Some(uri_block) = &self.uri_block {
            uri_block.validate("global.uri_block")?;
        }
        validate_waf_exclusions("global.waf_exclusions", &self.waf_exclusions)
    }
}

// =============================================================================
// BANNED IPS
// =============================================================================

/// Where a ban applies
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanScope {
    Global,
    Host(HostId),
}

impl fmt::Display for BanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanScope::Global => write!(f, "global"),
            BanScope::Host(id) => write!(f, "host:{}", id),
        }
    }
}

/// Ban record as kept by the system of record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedIpEntry {
    pub ip: String,
    pub scope: BanScope,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// `None` means permanent
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BannedIpEntry {
    /// New ban starting now; a zero TTL is permanent
    pub fn new(ip: impl Into<String>, scope: BanScope, reason: impl Into<String>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = if ttl.is_zero() {
            None
        } else {
            chrono::Duration::from_std(ttl).ok().map(|d| created_at + d)
        };

        Self {
            ip: ip.into(),
            scope,
            reason: reason.into(),
            created_at,
            expires_at,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }

    /// Remaining lifetime: `None` when permanent, `Some(ZERO)` once expired
    pub fn remaining_ttl_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires| (expires - now).to_std().unwrap_or(Duration::ZERO))
    }
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn validate_ip_list(prefix: &str, entries: &[String]) -> Result<(), ValidationError> {
    for (i, entry) in entries.iter().enumerate() {
        validate_ip_or_cidr(entry)
            .map_err(|e| ValidationError::from_pattern(format!("{}[{}]", prefix, i), e))?;
    }
    Ok(())
}

fn validate_regex(path: &str, pattern: &str) -> Result<(), ValidationError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ValidationError::new(path, format!("invalid regex: {}", e)))
}

fn validate_literal(path: &str, value: &str) -> Result<(), ValidationError> {
    if value.chars().any(|c| c.is_control()) {
        return Err(ValidationError::new(path, "contains control characters"));
    }
    Ok(())
}

fn validate_path(path: &str, value: &str) -> Result<(), ValidationError> {
    validate_literal(path, value)?;
    if !value.starts_with('/') {
        return Err(ValidationError::new(path, format!("'{}' must start with '/'", value)));
    }
    if value.contains(['\'', '"', ' ']) {
        return Err(ValidationError::new(path, "quotes and spaces are not allowed in paths"));
    }
    Ok(())
}

fn validate_waf_exclusions(prefix: &str, exclusions: &[WafExclusion]) -> Result<(), ValidationError> {
    for (i, exclusion) in exclusions.iter().enumerate() {
        if exclusion.rule_id == 0 {
            return Err(ValidationError::new(format!("{}[{}].rule_id", prefix, i), "rule id 0 is reserved"));
        }
        if let Some(path) = &exclusion.path {
            validate_path(&format!("{}[{}].path", prefix, i), path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> HostSecurityProfile {
        HostSecurityProfile::new("7", vec!["example.com".to_string()])
    }

    #[test]
    fn test_bare_profile_is_valid() {
        assert!(profile().validate().is_ok());
        assert_eq!(profile().primary_domain(), Some("example.com"));
        assert_eq!(profile().cache_ttl, "7d");
    }

    #[test]
    fn test_paranoia_is_clamped() {
        let mut waf = WafConfig::default();
        waf.paranoia_level = 9;
        assert_eq!(waf.effective_paranoia(), 4);
        waf.paranoia_level = 0;
        assert_eq!(waf.effective_paranoia(), 1);
    }

    #[test]
    fn test_invalid_cidr_names_the_rule() {
        let mut p = profile();
        p.uri_block = Some(UriBlockConfig {
            rules: vec![],
            exception_ips: vec!["10.0.0.0/8".into(), "10.0.0.0/99".into()],
            allow_private_ips: false,
        });
        let err = p.validate().unwrap_err();
        assert_eq!(err.rule, "uri_block.exception_ips[1]");
    }

    #[test]
    fn test_invalid_regex_names_the_rule() {
        let mut p = profile();
        p.uri_block = Some(UriBlockConfig {
            rules: vec![
                UriBlockRule { pattern: "/wp-admin".into(), match_type: UriMatchType::Prefix, enabled: true },
                UriBlockRule { pattern: "^/(unclosed".into(), match_type: UriMatchType::Regex, enabled: true },
            ],
            ..Default::default()
        });
        let err = p.validate().unwrap_err();
        assert_eq!(err.rule, "uri_block.rules[1].pattern");
        assert!(err.reason.contains("invalid regex"));
    }

    #[test]
    fn test_rate_limit_requires_positive_values() {
        let mut p = profile();
        p.rate_limit = Some(RateLimitConfig {
            rps: 0,
            burst: 5,
            scope: RateLimitScope::Ip,
            response_code: 429,
            whitelist: vec![],
        });
        assert_eq!(p.validate().unwrap_err().rule, "rate_limit.rps");
    }

    #[test]
    fn test_country_code_validation() {
        let mut p = profile();
        p.geo = Some(GeoConfig {
            countries: vec!["cn".into(), "USA".into()],
            ..Default::default()
        });
        assert_eq!(p.validate().unwrap_err().rule, "geo.countries[1]");
    }

    #[test]
    fn test_normalized_countries() {
        let geo = GeoConfig {
            countries: vec!["ru".into(), "CN".into(), " cn ".into()],
            ..Default::default()
        };
        assert_eq!(geo.normalized_countries(), vec!["CN", "RU"]);
        assert!(!GeoConfig::default().is_restrictive());
    }

    #[test]
    fn test_limiter_key_by_scope() {
        let mut rl = RateLimitConfig {
            rps: 10,
            burst: 5,
            scope: RateLimitScope::Ip,
            response_code: 429,
            whitelist: vec![],
        };
        assert_eq!(rl.limiter_key("h1", "1.2.3.4", "/a"), "h1:ip:1.2.3.4");
        rl.scope = RateLimitScope::IpUri;
        assert_eq!(rl.limiter_key("h1", "1.2.3.4", "/a"), "h1:ip_uri:1.2.3.4:/a");
        assert_eq!(rl.window_limit(), 15);
    }

    #[test]
    fn test_banned_entry_ttl() {
        let permanent = BannedIpEntry::new("1.2.3.4", BanScope::Global, "manual", Duration::ZERO);
        assert!(permanent.is_permanent());
        assert_eq!(permanent.remaining_ttl_at(Utc::now()), None);

        let temporary = BannedIpEntry::new("1.2.3.4", BanScope::Global, "manual", Duration::from_secs(60));
        let remaining = temporary.remaining_ttl_at(Utc::now()).unwrap();
        assert!(remaining <= Duration::from_secs(60) && remaining > Duration::from_secs(58));

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(temporary.is_expired_at(later));
        assert_eq!(temporary.remaining_ttl_at(later), Some(Duration::ZERO));
    }

    #[test]
    fn test_profile_yaml_defaults() {
        let yaml = r#"
id: "12"
domains: ["shop.example.com"]
waf:
  mode: detect
  paranoia_level: 3
geo:
  mode: whitelist
  countries: [US, CA]
  challenge_mode: true
challenge:
  type: recaptcha_v3
  site_key: "site"
  secret_key: "secret"
"#;
        let p: HostSecurityProfile = serde_yaml::from_str(yaml).unwrap();
        assert!(p.enabled);
        assert_eq!(p.waf.as_ref().unwrap().mode, WafMode::Detect);
        assert!(p.waf.as_ref().unwrap().enabled);
        assert!(p.geo_challenge_mode());
        let challenge = p.challenge.as_ref().unwrap();
        assert_eq!(challenge.token_validity_secs, DEFAULT_TOKEN_VALIDITY_SECS);
        assert_eq!(challenge.secret_key.expose(), "secret");
        assert!(!format!("{:?}", challenge).contains("secret\""));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_ban_scope_serialization() {
        assert_eq!(serde_json::to_string(&BanScope::Global).unwrap(), "\"global\"");
        assert_eq!(
            serde_json::to_string(&BanScope::Host("9".into())).unwrap(),
            r#"{"host":"9"}"#
        );
    }
}

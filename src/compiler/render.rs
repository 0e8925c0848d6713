//! Directive rendering for compiled artifacts.
//!
//! Output is an OpenResty server-context snippet. Every layer follows the
//! same shape: bypass conditions first (search bot, private IP, priority
//! allow, URI path), then hit conditions, then a verdict guard combining
//! the two so the action only fires on hit without bypass.
//!
//! Server-level `if` blocks run in nginx's server-rewrite phase, ahead of
//! ModSecurity (rewrite) and `allow`/`deny` (access), whatever their order in
//! the text. Stage order is therefore a contract on the emitted text and on
//! which stage may act, not on phase timing. The challenge verdict is an
//! `access_by_lua_block`, so it runs after every marking layer and after the
//! WAF.
//!
//! The challenge stage expects the engine's http-level config to define
//! `$aegis_challenge_signing_key` (HMAC key shared with the challenge page)
//! and `$aegis_cache_host` / `$aegis_cache_port` for the token blacklist.

use std::collections::BTreeSet;
use tracing::warn;

use super::pipeline::{CompileMode, Pipeline, Stage};
use super::CompileError;
use crate::enforcement::{token_blacklist_key, DEFAULT_KEY_PREFIX};
use crate::patterns::{cidr_to_matcher, quote, IpSpec, PatternError};
use crate::policy::{
    AccessAction, BanScope, BannedIpEntry, ExploitCategory, GeoConfig, GeoMode,
    GlobalSecurityProfile, HostSecurityProfile, UriBlockRule, UriMatchType, WafExclusion,
    WafMode,
};

pub const GENERATOR_BANNER: &str =
    "# Generated by aegis-control-plane. Do not edit: regenerated on every policy change.";

/// Header line prefix carrying the owning host id
pub const HOST_ID_HEADER: &str = "# host_id: ";

/// Owner id written into the global banned-IP artifact
pub const GLOBAL_ARTIFACT_ID: &str = "__global__";

pub const PRIVATE_IP_PATTERN: &str =
    r"^(10\.|127\.|192\.168\.|172\.(1[6-9]|2[0-9]|3[01])\.|::1$|f[cd][0-9a-f]{2}:|fe80:)";

pub const SEARCH_BOT_PATTERN: &str =
    "(googlebot|bingbot|slurp|duckduckbot|baiduspider|yandexbot|applebot)";

pub const BAD_BOT_PATTERN: &str =
    "(nikto|sqlmap|nmap|masscan|zgrab|dirbuster|acunetix|mj12bot|dotbot|petalbot|semrushbot|ahrefsbot)";

pub const AI_BOT_PATTERN: &str =
    "(gptbot|chatgpt-user|ccbot|claudebot|anthropic-ai|google-extended|bytespider|perplexitybot|amazonbot|cohere-ai)";

pub const SUSPICIOUS_AGENT_PATTERN: &str = "(python-requests|^curl/|wget|go-http-client|java/[0-9])";

/// Path prefix served by the challenge page; always exempt from verification
pub const CHALLENGE_PATH: &str = "/__aegis/";

/// Cookie carrying `<token id>.<expires unix secs>.<base64url HMAC-SHA1>`,
/// signed over `host_id|client ip|token id|expires`
pub const CHALLENGE_COOKIE: &str = "aegis_challenge_token";

/// Deadline for the token blacklist lookup; the check fails open past it
const TOKEN_LOOKUP_TIMEOUT_MS: u32 = 100;

const WAF_PARANOIA_RULE_ID: u32 = 900_000;
const WAF_PRIORITY_BYPASS_RULE_ID: u32 = 900_101;
const WAF_PATH_BYPASS_RULE_ID: u32 = 900_102;
const WAF_SCOPED_EXCLUSION_BASE_ID: u32 = 900_200;

const DENY_STATUS: u16 = 403;

fn exploit_condition(category: ExploitCategory) -> (&'static str, &'static str) {
    match category {
        ExploitCategory::Sqli => (
            "$request_uri",
            "(union.*select|select.*from|insert.*into|delete.*from|drop.*table|exec.*xp_)",
        ),
        ExploitCategory::Xss => (
            "$request_uri",
            "(<script|%3cscript|javascript:|onerror=|onload=|<iframe|%3ciframe)",
        ),
        ExploitCategory::PathTraversal => (
            "$request_uri",
            r"(\.\./|\.\.%2f|%2e%2e|/etc/passwd|/etc/shadow)",
        ),
        ExploitCategory::Rce => (
            "$request_uri",
            r"(;\s*(ls|cat|wget|curl|bash|sh)\b|\$\(|cmd\.exe|powershell|wscript)",
        ),
        ExploitCategory::Scanner => ("$http_user_agent", "(nikto|nmap|masscan|sqlmap|dirbuster|acunetix)"),
    }
}

/// What a layer does when it hits without bypass
#[derive(Debug, Clone, Copy)]
enum Action {
    Deny(u16),
    /// Raise the challenge flag; never affected by compile mode
    Mark,
    /// Record a global denial for the challenge stage to enforce
    DeferredDeny,
}

/// One `if (<variable> <op> "<pattern>")` hit test
struct Condition {
    variable: &'static str,
    operator: &'static str,
    pattern: String,
}

impl Condition {
    fn new(variable: &'static str, operator: &'static str, pattern: impl Into<String>) -> Self {
        Self {
            variable,
            operator,
            pattern: pattern.into(),
        }
    }
}

/// Exceptions evaluated ahead of one layer's action
#[derive(Debug, Default)]
struct Bypass {
    search_bots: bool,
    allowed_agents: BTreeSet<String>,
    private_ips: bool,
    ips: BTreeSet<String>,
    paths: BTreeSet<String>,
}

impl Bypass {
    fn with_ips<'a>(mut self, rule: &str, ips: impl IntoIterator<Item = &'a String>) -> Result<Self, CompileError> {
        for ip in ips {
            let spec = IpSpec::parse(ip).map_err(|e| pattern_error(rule, e))?;
            self.ips.insert(spec.canonical());
        }
        Ok(self)
    }

    fn with_paths<'a>(mut self, paths: impl IntoIterator<Item = &'a String>) -> Self {
        self.paths.extend(paths.into_iter().cloned());
        self
    }
}

fn pattern_error(rule: &str, err: PatternError) -> CompileError {
    CompileError::Validation {
        rule: rule.to_string(),
        reason: err.to_string(),
    }
}

/// Renders one host profile into artifact text
pub(crate) struct Renderer<'a> {
    host: &'a HostSecurityProfile,
    global: &'a GlobalSecurityProfile,
    pipeline: Pipeline,
    mode: CompileMode,
    key_prefix: &'a str,
    lines: Vec<String>,
}

impl<'a> Renderer<'a> {
    pub(crate) fn new(
        host: &'a HostSecurityProfile,
        global: &'a GlobalSecurityProfile,
        pipeline: Pipeline,
        mode: CompileMode,
    ) -> Self {
        Self {
            host,
            global,
            pipeline,
            mode,
            key_prefix: DEFAULT_KEY_PREFIX,
            lines: Vec::new(),
        }
    }

    pub(crate) fn with_key_prefix(mut self, key_prefix: &'a str) -> Self {
        self.key_prefix = key_prefix;
        self
    }

    pub(crate) fn render(mut self) -> Result<String, CompileError> {
        self.render_header();

        if self.host.access_list.is_some() && !self.pipeline.stages().contains(&Stage::AccessList) {
            warn!(
                host_id = %self.host.id,
                pipeline = %self.pipeline,
                "access_list has no stage in this pipeline and is ignored"
            );
        }

        for stage in self.pipeline.stages() {
            self.lines.push(String::new());
            self.lines.push(stage.marker());
            let configured = match stage {
                Stage::GeoipBlock | Stage::GeoipMark => self.render_geo(*stage)?,
                Stage::Waf => self.render_waf()?,
                Stage::AccessList => self.render_access_list()?,
                Stage::ExploitBlock => self.render_exploit_block()?,
                Stage::BotFilter => self.render_bot_filter()?,
                Stage::UriBlock => self.render_uri_block()?,
                Stage::ChallengeVerify => self.render_challenge_verify()?,
            };
            if !configured {
                self.lines.push("# not configured".to_string());
            }
        }

        self.render_runtime()?;

        let mut text = self.lines.join("\n");
        text.push('\n');
        Ok(text)
    }

    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn quoted(&self, rule: &str, value: &str) -> Result<String, CompileError> {
        quote(value).map_err(|e| pattern_error(rule, e))
    }

    fn render_header(&mut self) {
        let host = self.host;
        let domains: Vec<&str> = host
            .domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect();

        self.line(GENERATOR_BANNER);
        self.line(format!("{}{}", HOST_ID_HEADER, host.id));
        self.line(format!("# domains: {}", domains.join(" ")));
        self.line(format!("# pipeline: {}", self.pipeline));
        self.line(format!("# mode: {}", self.mode.as_str()));
        self.line(String::new());
        self.line(format!("set $aegis_host_id \"{}\";", host.id));
        if self.pipeline == Pipeline::Challenge {
            self.line("set $aegis_challenge_required 0;");
            self.line("set $aegis_global_geo_denied 0;");
        }
        if self.mode == CompileMode::Monitor {
            self.line("set $aegis_monitor_hit \"\";");
        }
    }

    // =========================================================================
    // LAYER PRIMITIVES
    // =========================================================================

    /// Emit the bypass block for `layer` and return its variable name
    fn render_bypass(&mut self, layer: &str, bypass: &Bypass) -> Result<String, CompileError> {
        let var = format!("aegis_{}_bypass", layer);
        let set = format!("{{ set ${} 1; }}", var);
        self.line(format!("set ${} 0;", var));

        if bypass.search_bots {
            self.line(format!("if ($http_user_agent ~* \"{}\") {}", SEARCH_BOT_PATTERN, set));
        }
        if !bypass.allowed_agents.is_empty() {
            let alternation: Vec<String> =
                bypass.allowed_agents.iter().map(|a| format!("(?:{})", a)).collect();
            let pattern = self.quoted(layer, &alternation.join("|"))?;
            self.line(format!("if ($http_user_agent ~* {}) {}", pattern, set));
        }
        if bypass.private_ips {
            self.line(format!("if ($remote_addr ~ \"{}\") {}", PRIVATE_IP_PATTERN, set));
        }
        if !bypass.ips.is_empty() {
            let mut matchers = BTreeSet::new();
            for ip in &bypass.ips {
                matchers.insert(cidr_to_matcher(ip).map_err(|e| pattern_error(layer, e))?);
            }
            let matchers: Vec<String> = matchers.into_iter().collect();
            let pattern = self.quoted(layer, &matchers.join("|"))?;
            self.line(format!("if ($remote_addr ~ {}) {}", pattern, set));
        }
        if !bypass.paths.is_empty() {
            let escaped: Vec<String> = bypass.paths.iter().map(|p| regex::escape(p)).collect();
            let pattern = self.quoted(layer, &format!("^(?:{})", escaped.join("|")))?;
            self.line(format!("if ($uri ~ {}) {}", pattern, set));
        }

        Ok(var)
    }

    /// Emit hit tests and the verdict guard for one layer
    fn render_layer(
        &mut self,
        stage: Stage,
        layer: &str,
        bypass_var: &str,
        conditions: &[Condition],
        action: Action,
    ) -> Result<(), CompileError> {
        let hit_var = format!("aegis_{}_hit", layer);
        self.line(format!("set ${} 0;", hit_var));
        for condition in conditions {
            let pattern = self.quoted(layer, &condition.pattern)?;
            self.line(format!(
                "if ({} {} {}) {{ set ${} 1; }}",
                condition.variable, condition.operator, pattern, hit_var
            ));
        }

        let verdict_var = format!("aegis_{}_verdict", layer);
        self.line(format!("set ${} \"${{{}}}${{{}}}\";", verdict_var, hit_var, bypass_var));
        let body = self.action_body(stage, action);
        self.line(format!("if (${} = \"10\") {{ {} }}", verdict_var, body));
        Ok(())
    }

    fn action_body(&self, stage: Stage, action: Action) -> String {
        match (action, self.mode) {
            (Action::Mark, _) => "set $aegis_challenge_required 1;".to_string(),
            (Action::DeferredDeny, _) => "set $aegis_global_geo_denied 1;".to_string(),
            (_, CompileMode::Monitor) => format!("set $aegis_monitor_hit \"{}\";", stage),
            (Action::Deny(status), CompileMode::Enforce) => format!("return {};", status),
        }
    }

    // =========================================================================
    // STAGES
    // =========================================================================

    fn geo_conditions(geo: &GeoConfig) -> Option<Condition> {
        let countries = geo.normalized_countries();
        if countries.is_empty() {
            return None;
        }
        let operator = match geo.mode {
            GeoMode::Whitelist => "!~",
            GeoMode::Blacklist => "~",
        };
        Some(Condition::new(
            "$geoip2_data_country_code",
            operator,
            format!("^({})$", countries.join("|")),
        ))
    }

    /// Bypass shared by the host geo and cloud-provider layers
    fn host_geo_bypass(&self) -> Result<Bypass, CompileError> {
        let geo = self.host.geo.clone().unwrap_or_default();
        let bypass = Bypass {
            search_bots: geo.allow_search_bots,
            private_ips: geo.allow_private_ips,
            ..Default::default()
        };
        Ok(bypass
            .with_ips("geo.allowed_ips", geo.allowed_ips.iter().chain(&self.host.priority_allow_ips))?
            .with_paths(&self.host.bypass_paths))
    }

    fn render_geo(&mut self, stage: Stage) -> Result<bool, CompileError> {
        let (action, global_action) = match stage {
            Stage::GeoipMark => (Action::Mark, Action::DeferredDeny),
            _ => (Action::Deny(DENY_STATUS), Action::Deny(DENY_STATUS)),
        };
        let (host, global) = (self.host, self.global);
        let mut configured = false;

        // Global first; host settings cannot exempt from it, and a challenge
        // never stands in for a global denial.
        if let Some(global_geo) = &global.geo {
            if let Some(condition) = Self::geo_conditions(global_geo) {
                let bypass = Bypass {
                    search_bots: global_geo.allow_search_bots,
                    private_ips: global_geo.allow_private_ips,
                    ..Default::default()
                }
                .with_ips("global.geo.allowed_ips", &global_geo.allowed_ips)?;
                let var = self.render_bypass("global_geo", &bypass)?;
                self.render_layer(stage, "global_geo", &var, &[condition], global_action)?;
                configured = true;
            }
        }

        let host_condition = host.geo.as_ref().and_then(Self::geo_conditions);
        let cloud = host
            .cloud_provider_block
            .as_ref()
            .filter(|c| !c.blocked_provider_slugs.is_empty());

        if host_condition.is_none() && cloud.is_none() {
            return Ok(configured);
        }

        let bypass = self.host_geo_bypass()?;
        let var = self.render_bypass("geo", &bypass)?;

        if let Some(condition) = host_condition {
            self.render_layer(stage, "geo", &var, &[condition], action)?;
        }

        if let Some(cloud) = cloud {
            if cloud.challenge_mode && stage == Stage::GeoipBlock {
                warn!(
                    host_id = %host.id,
                    "cloud_provider_block.challenge_mode needs the challenge pipeline; blocking instead"
                );
            }
            let slugs: BTreeSet<&str> = cloud.blocked_provider_slugs.iter().map(String::as_str).collect();
            let slugs: Vec<&str> = slugs.into_iter().collect();
            let condition = Condition::new("$aegis_cloud_provider", "~", format!("^({})$", slugs.join("|")));
            self.render_layer(stage, "cloud", &var, &[condition], action)?;
        }

        Ok(true)
    }

    fn render_waf(&mut self) -> Result<bool, CompileError> {
        let (host, global) = (self.host, self.global);
        let waf = match host.waf.as_ref().filter(|w| w.enabled) {
            Some(waf) => waf.clone(),
            None => {
                self.line("modsecurity off;");
                return Ok(false);
            }
        };

        let engine = if waf.mode == WafMode::Detect || self.mode == CompileMode::Monitor {
            "DetectionOnly"
        } else {
            "On"
        };

        let priority = Bypass::default().with_ips("priority_allow_ips", &host.priority_allow_ips)?;
        let exclusions: BTreeSet<&WafExclusion> =
            global.waf_exclusions.iter().chain(&waf.exclusions).collect();

        self.line("modsecurity on;");
        self.line("modsecurity_rules '");
        self.line(format!("    SecRuleEngine {}", engine));
        self.line(format!(
            "    SecAction \"id:{},phase:1,nolog,pass,t:none,setvar:tx.blocking_paranoia_level={}\"",
            WAF_PARANOIA_RULE_ID,
            waf.effective_paranoia()
        ));
        if !priority.ips.is_empty() {
            let ips: Vec<&str> = priority.ips.iter().map(String::as_str).collect();
            self.line(format!(
                "    SecRule REMOTE_ADDR \"@ipMatch {}\" \"id:{},phase:1,nolog,pass,ctl:ruleEngine=Off\"",
                ips.join(","),
                WAF_PRIORITY_BYPASS_RULE_ID
            ));
        }
        if !host.bypass_paths.is_empty() {
            let paths: BTreeSet<String> = host.bypass_paths.iter().map(|p| regex::escape(p)).collect();
            let paths: Vec<String> = paths.into_iter().collect();
            self.line(format!(
                "    SecRule REQUEST_FILENAME \"@rx ^(?:{})\" \"id:{},phase:1,nolog,pass,ctl:ruleEngine=Off\"",
                paths.join("|"),
                WAF_PATH_BYPASS_RULE_ID
            ));
        }

        let mut scoped_id = WAF_SCOPED_EXCLUSION_BASE_ID;
        for exclusion in exclusions {
            match &exclusion.path {
                None => self.line(format!("    SecRuleRemoveById {}", exclusion.rule_id)),
                Some(path) => {
                    self.line(format!(
                        "    SecRule REQUEST_FILENAME \"@beginsWith {}\" \"id:{},phase:1,nolog,pass,ctl:ruleRemoveById={}\"",
                        path, scoped_id, exclusion.rule_id
                    ));
                    scoped_id += 1;
                }
            }
        }
        self.line("';");

        Ok(true)
    }

    fn render_access_list(&mut self) -> Result<bool, CompileError> {
        let access = match &self.host.access_list {
            Some(access) => access.clone(),
            None => return Ok(false),
        };

        // ngx_http_access_module has no marking form; monitor keeps the rules visible only
        let prefix = match self.mode {
            CompileMode::Enforce => "",
            CompileMode::Monitor => "# monitor: ",
        };

        let priority = Bypass::default().with_ips("priority_allow_ips", &self.host.priority_allow_ips)?;
        for ip in &priority.ips {
            self.line(format!("{}allow {};", prefix, ip));
        }

        for (i, rule) in access.rules.iter().enumerate() {
            let address = if rule.address == "all" {
                "all".to_string()
            } else {
                IpSpec::parse(&rule.address)
                    .map_err(|e| pattern_error(&format!("access_list.rules[{}].address", i), e))?
                    .canonical()
            };
            let directive = match rule.action {
                AccessAction::Allow => "allow",
                AccessAction::Deny => "deny",
            };
            self.line(format!("{}{} {};", prefix, directive, address));
        }

        let default = match access.default_action {
            AccessAction::Allow => "allow",
            AccessAction::Deny => "deny",
        };
        self.line(format!("{}{} all;", prefix, default));

        Ok(true)
    }

    fn render_exploit_block(&mut self) -> Result<bool, CompileError> {
        let exploit = match &self.host.exploit_block {
            Some(exploit) if !exploit.categories.is_empty() => exploit.clone(),
            _ => return Ok(false),
        };

        let bypass = Bypass::default()
            .with_ips(
                "exploit_block.exception_ips",
                exploit.exception_ips.iter().chain(&self.host.priority_allow_ips),
            )?
            .with_paths(&self.host.bypass_paths);
        let var = self.render_bypass("exploit", &bypass)?;

        let categories: BTreeSet<ExploitCategory> = exploit.categories.iter().copied().collect();
        let conditions: Vec<Condition> = categories
            .into_iter()
            .map(|category| {
                let (variable, pattern) = exploit_condition(category);
                Condition::new(variable, "~*", pattern)
            })
            .collect();

        self.render_layer(Stage::ExploitBlock, "exploit", &var, &conditions, Action::Deny(DENY_STATUS))?;
        Ok(true)
    }

    fn render_bot_filter(&mut self) -> Result<bool, CompileError> {
        let bots = match &self.host.bot_filter {
            Some(bots) => bots.clone(),
            None => return Ok(false),
        };

        let mut conditions = Vec::new();
        if bots.block_bad_bots {
            conditions.push(Condition::new("$http_user_agent", "~*", BAD_BOT_PATTERN));
        }
        if bots.block_ai_bots {
            conditions.push(Condition::new("$http_user_agent", "~*", AI_BOT_PATTERN));
        }
        let custom: BTreeSet<&String> = bots.custom_blocked_agents.iter().collect();
        for agent in custom {
            conditions.push(Condition::new("$http_user_agent", "~*", agent.clone()));
        }

        let challenge_suspicious = match (bots.challenge_suspicious, self.pipeline) {
            (true, Pipeline::Challenge) => true,
            (true, Pipeline::DirectBlock) => {
                warn!(
                    host_id = %self.host.id,
                    "bot_filter.challenge_suspicious has no effect in the direct_block pipeline"
                );
                false
            }
            (false, _) => false,
        };

        if conditions.is_empty() && !challenge_suspicious {
            return Ok(false);
        }

        let bypass = Bypass {
            search_bots: bots.allow_search_engines,
            allowed_agents: bots.custom_allowed_agents.iter().cloned().collect(),
            ..Default::default()
        }
        .with_ips("priority_allow_ips", &self.host.priority_allow_ips)?
        .with_paths(&self.host.bypass_paths);
        let var = self.render_bypass("bot", &bypass)?;

        if !conditions.is_empty() {
            self.render_layer(Stage::BotFilter, "bot", &var, &conditions, Action::Deny(DENY_STATUS))?;
        }
        if challenge_suspicious {
            let suspect = [Condition::new("$http_user_agent", "~*", SUSPICIOUS_AGENT_PATTERN)];
            self.render_layer(Stage::BotFilter, "bot_suspect", &var, &suspect, Action::Mark)?;
        }

        Ok(true)
    }

    fn uri_conditions(rules: &[UriBlockRule]) -> Vec<Condition> {
        rules
            .iter()
            .filter(|r| r.enabled)
            .map(|rule| {
                let pattern = match rule.match_type {
                    UriMatchType::Exact => format!("^{}$", regex::escape(&rule.pattern)),
                    UriMatchType::Prefix => format!("^{}", regex::escape(&rule.pattern)),
                    UriMatchType::Regex => rule.pattern.clone(),
                };
                Condition::new("$uri", "~", pattern)
            })
            .collect()
    }

    fn render_uri_block(&mut self) -> Result<bool, CompileError> {
        let global = self.global;
        let mut configured = false;

        if let Some(global_uri) = &global.uri_block {
            let conditions = Self::uri_conditions(&global_uri.rules);
            if !conditions.is_empty() {
                let bypass = Bypass {
                    private_ips: global_uri.allow_private_ips,
                    ..Default::default()
                }
                .with_ips("global.uri_block.exception_ips", &global_uri.exception_ips)?;
                let var = self.render_bypass("global_uri", &bypass)?;
                self.render_layer(Stage::UriBlock, "global_uri", &var, &conditions, Action::Deny(DENY_STATUS))?;
                configured = true;
            }
        }

        if let Some(uri) = self.host.uri_block.clone() {
            let conditions = Self::uri_conditions(&uri.rules);
            if !conditions.is_empty() {
                let bypass = Bypass {
                    private_ips: uri.allow_private_ips,
                    ..Default::default()
                }
                .with_ips(
                    "uri_block.exception_ips",
                    uri.exception_ips.iter().chain(&self.host.priority_allow_ips),
                )?
                .with_paths(&self.host.bypass_paths);
                let var = self.render_bypass("uri", &bypass)?;
                self.render_layer(Stage::UriBlock, "uri", &var, &conditions, Action::Deny(DENY_STATUS))?;
                configured = true;
            }
        }

        Ok(configured)
    }

    fn render_challenge_verify(&mut self) -> Result<bool, CompileError> {
        let challenge = match &self.host.challenge {
            Some(challenge) => challenge.clone(),
            None => {
                return Err(CompileError::Validation {
                    rule: "challenge".to_string(),
                    reason: "the challenge pipeline requires a challenge configuration".to_string(),
                })
            }
        };

        let site_key = self.quoted("challenge.site_key", &challenge.site_key)?;
        self.line(format!("set $aegis_challenge_type \"{}\";", challenge.challenge_type.as_str()));
        self.line(format!("set $aegis_challenge_site_key {};", site_key));
        self.line(format!("set $aegis_challenge_token_validity {};", challenge.token_validity_secs));
        self.line(format!("set $aegis_challenge_min_score \"{}\";", challenge.min_score));

        let challenge_path = CHALLENGE_PATH.to_string();
        let bypass = Bypass::default()
            .with_ips("priority_allow_ips", &self.host.priority_allow_ips)?
            .with_paths(self.host.bypass_paths.iter().chain(std::iter::once(&challenge_path)));
        let var = self.render_bypass("challenge", &bypass)?;
        self.line(format!("if (${} = 1) {{ set $aegis_challenge_required 0; }}", var));

        self.render_challenge_verdict(challenge.token_validity_secs);

        Ok(true)
    }

    /// Final verdict of the challenge pipeline. A global denial answers 403;
    /// a raised challenge flag passes only with a token that is correctly
    /// signed for this host and client, unexpired, issued for no longer than
    /// `token_validity_secs` and not revoked. Anything else is redirected to
    /// the challenge page.
    fn render_challenge_verdict(&mut self, token_validity_secs: u64) {
        let revoked_key = lua_string(&token_blacklist_key(self.key_prefix, ""));
        let (deny, challenge) = match self.mode {
            CompileMode::Enforce => (
                "return ngx.exit(403)".to_string(),
                format!(
                    "return ngx.redirect(\"{}challenge?return_to=\" .. ngx.escape_uri(ngx.var.request_uri), 302)",
                    CHALLENGE_PATH
                ),
            ),
            CompileMode::Monitor => {
                let hit = format!("ngx.var.aegis_monitor_hit = \"{}\"", Stage::ChallengeVerify);
                (hit.clone(), hit)
            }
        };

        let lua = [
            "access_by_lua_block {".to_string(),
            "    local denied = ngx.var.aegis_global_geo_denied == \"1\"".to_string(),
            "    if not denied and ngx.var.aegis_challenge_required ~= \"1\" then".to_string(),
            "        return".to_string(),
            "    end".to_string(),
            "    if not denied then".to_string(),
            format!("        local token = ngx.var.cookie_{} or \"\"", CHALLENGE_COOKIE),
            "        local id, expires, sig = token:match(\"^([%w_-]+)%.(%d+)%.([%w_-]+)$\")".to_string(),
            "        local key = ngx.var.aegis_challenge_signing_key".to_string(),
            "        local now = ngx.time()".to_string(),
            "        expires = tonumber(expires)".to_string(),
            format!(
                "        if id and expires and key and key ~= \"\" and expires > now and expires - now <= {} then",
                token_validity_secs
            ),
            "            local payload = ngx.var.aegis_host_id .. \"|\" .. ngx.var.remote_addr .. \"|\" .. id .. \"|\" .. expires".to_string(),
            "            local expected = ngx.encode_base64(ngx.hmac_sha1(key, payload), true):gsub(\"%+\", \"-\"):gsub(\"/\", \"_\")".to_string(),
            "            if expected == sig then".to_string(),
            "                local red = require(\"resty.redis\"):new()".to_string(),
            format!(
                "                red:set_timeouts({0}, {0}, {0})",
                TOKEN_LOOKUP_TIMEOUT_MS
            ),
            "                local revoked = false".to_string(),
            "                if red:connect(ngx.var.aegis_cache_host, tonumber(ngx.var.aegis_cache_port)) then".to_string(),
            format!("                    revoked = red:exists({} .. id) == 1", revoked_key),
            "                    red:set_keepalive(10000, 64)".to_string(),
            "                end".to_string(),
            "                if not revoked then".to_string(),
            "                    return".to_string(),
            "                end".to_string(),
            "            end".to_string(),
            "        end".to_string(),
            "    end".to_string(),
            "    if denied then".to_string(),
            format!("        {}", deny),
            "    else".to_string(),
            format!("        {}", challenge),
            "    end".to_string(),
            "}".to_string(),
        ];
        self.lines.extend(lua);
    }

    fn render_runtime(&mut self) -> Result<(), CompileError> {
        let host = self.host;
        self.line(String::new());
        self.line("# [runtime]");
        self.line(format!("set $aegis_cache_ttl \"{}\";", self.host.cache_ttl));

        match self.host.rate_limit.clone() {
            Some(rl) => {
                self.line(format!(
                    "set $aegis_rate_limit \"{}:{}:{}:{}\";",
                    rl.rps,
                    rl.burst,
                    rl.scope.as_str(),
                    rl.response_code
                ));
                let bypass = Bypass::default()
                    .with_ips("rate_limit.whitelist", rl.whitelist.iter().chain(&self.host.priority_allow_ips))?
                    .with_paths(&self.host.bypass_paths);
                self.render_bypass("rate_limit", &bypass)?;
            }
            None => self.line("# rate_limit: not configured"),
        }

        match &host.fail2ban {
            Some(f2b) => {
                let codes: BTreeSet<u16> = f2b.fail_codes.iter().copied().collect();
                let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
                let action = match f2b.action {
                    crate::policy::Fail2banAction::BanHost => "ban_host",
                    crate::policy::Fail2banAction::BanGlobal => "ban_global",
                };
                self.line(format!(
                    "set $aegis_fail2ban \"{}:{}:{}:{}:{}\";",
                    f2b.max_retries,
                    f2b.find_time,
                    f2b.ban_time,
                    codes.join(","),
                    action
                ));
            }
            None => self.line("# fail2ban: not configured"),
        }

        if let Some(auto_ban) = host.waf.as_ref().filter(|w| w.enabled).and_then(|w| w.auto_ban.clone()) {
            self.line(format!(
                "set $aegis_waf_auto_ban \"{}:{}:{}\";",
                auto_ban.threshold, auto_ban.window_secs, auto_ban.ban_secs
            ));
        }

        Ok(())
    }
}

/// Double-quoted Lua string literal
fn lua_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render the global banned-IP artifact: one `deny` per active global ban.
pub fn render_global_bans(
    entries: &[BannedIpEntry],
    now: chrono::DateTime<chrono::Utc>,
) -> Result<String, CompileError> {
    let mut ips = BTreeSet::new();
    for entry in entries {
        if entry.scope != BanScope::Global || entry.is_expired_at(now) {
            continue;
        }
        let spec = IpSpec::parse(&entry.ip).map_err(|e| pattern_error("banned_ips", e))?;
        ips.insert(spec.canonical());
    }

    let mut lines = vec![
        GENERATOR_BANNER.to_string(),
        format!("{}{}", HOST_ID_HEADER, GLOBAL_ARTIFACT_ID),
        "# kind: global_banned_ips".to_string(),
        String::new(),
    ];
    if ips.is_empty() {
        lines.push("# no active global bans".to_string());
    }
    lines.extend(ips.into_iter().map(|ip| format!("deny {};", ip)));

    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

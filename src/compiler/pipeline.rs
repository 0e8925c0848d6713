//! The two fixed enforcement pipelines.
//!
//! A host compiles to exactly one of them, chosen by `geo.challenge_mode`.
//! Stage order is a constant of the variant rather than something derived
//! from profile data, so ordering can be asserted directly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policy::HostSecurityProfile;

/// One enforcement stage of a compiled artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// GeoIP / cloud-provider denial
    GeoipBlock,
    /// GeoIP / cloud-provider decision flag, never denies
    GeoipMark,
    Waf,
    AccessList,
    ExploitBlock,
    BotFilter,
    UriBlock,
    /// Only stage of the challenge pipeline allowed to redirect on the flag
    ChallengeVerify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GeoipBlock => "geoip_block",
            Stage::GeoipMark => "geoip_mark",
            Stage::Waf => "waf",
            Stage::AccessList => "access_list",
            Stage::ExploitBlock => "exploit_block",
            Stage::BotFilter => "bot_filter",
            Stage::UriBlock => "uri_block",
            Stage::ChallengeVerify => "challenge_verify",
        }
    }

    /// Marker line introducing the stage block in an artifact
    pub fn marker(&self) -> String {
        format!("# [stage:{}]", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing pipeline a host compiles to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    /// GeoIP denies before the WAF runs
    DirectBlock,
    /// GeoIP only marks; the final decision is made at token verification
    Challenge,
}

const DIRECT_BLOCK_STAGES: [Stage; 6] = [
    Stage::GeoipBlock,
    Stage::Waf,
    Stage::AccessList,
    Stage::ExploitBlock,
    Stage::BotFilter,
    Stage::UriBlock,
];

const CHALLENGE_STAGES: [Stage; 6] = [
    Stage::Waf,
    Stage::GeoipMark,
    Stage::ExploitBlock,
    Stage::BotFilter,
    Stage::UriBlock,
    Stage::ChallengeVerify,
];

impl Pipeline {
    /// Pipeline selected by the host's geo challenge mode
    pub fn for_profile(profile: &HostSecurityProfile) -> Self {
        if profile.geo_challenge_mode() {
            Pipeline::Challenge
        } else {
            Pipeline::DirectBlock
        }
    }

    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Pipeline::DirectBlock => &DIRECT_BLOCK_STAGES,
            Pipeline::Challenge => &CHALLENGE_STAGES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::DirectBlock => "direct_block",
            Pipeline::Challenge => "challenge",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the compiled rules do when a layer matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    /// Deny and redirect as configured
    #[default]
    Enforce,
    /// Record the matching stage in `$aegis_monitor_hit` instead of acting
    Monitor,
}

impl CompileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompileMode::Enforce => "enforce",
            CompileMode::Monitor => "monitor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::GeoConfig;

    fn position(pipeline: Pipeline, stage: Stage) -> Option<usize> {
        pipeline.stages().iter().position(|s| *s == stage)
    }

    #[test]
    fn test_direct_block_geoip_precedes_waf() {
        let geo = position(Pipeline::DirectBlock, Stage::GeoipBlock).unwrap();
        let waf = position(Pipeline::DirectBlock, Stage::Waf).unwrap();
        assert!(geo < waf);
        assert_eq!(position(Pipeline::DirectBlock, Stage::GeoipMark), None);
        assert_eq!(position(Pipeline::DirectBlock, Stage::ChallengeVerify), None);
    }

    #[test]
    fn test_challenge_verification_is_last() {
        let stages = Pipeline::Challenge.stages();
        assert_eq!(stages.last(), Some(&Stage::ChallengeVerify));
        assert_eq!(stages.first(), Some(&Stage::Waf));
        assert_eq!(position(Pipeline::Challenge, Stage::GeoipBlock), None);
    }

    #[test]
    fn test_pipeline_selection() {
        let mut host = HostSecurityProfile::new("1", vec!["a.example.com".into()]);
        assert_eq!(Pipeline::for_profile(&host), Pipeline::DirectBlock);

        host.geo = Some(GeoConfig {
            challenge_mode: true,
            ..Default::default()
        });
        assert_eq!(Pipeline::for_profile(&host), Pipeline::Challenge);
    }

    #[test]
    fn test_stage_marker() {
        assert_eq!(Stage::UriBlock.marker(), "# [stage:uri_block]");
    }
}

//! Rate limit rules configuration and matching.
//!
//! A rule binds a set of route patterns to one limit. Rules are matched
//! against the request path; every matching rule applies, in configuration
//! order. The `tiered` limit picks its window and quota from the caller's
//! roles through the [`TierTable`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use super::key::{AdmissionRequest, Identity, KeySource};
use super::policy::PolicyConfig;
use crate::error::ConfigError;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Configuration for one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Rule name, also the counter namespace.
    pub name: String,
    /// Express-style mount patterns; an empty list disables the rule.
    #[serde(default)]
    pub paths: Vec<String>,
    /// The limit applied to matching requests
    pub limit: LimitConfig,
    /// Request attribute the quota is keyed on
    #[serde(default)]
    pub key_by: KeySource,
    /// Give every route its own bucket (`{name}:{route_path}` namespace)
    #[serde(default)]
    pub per_route: bool,
    /// Only apply when the request carries an API key
    #[serde(default)]
    pub requires_api_key: bool,
    /// Denial message; `{retry_after}` is replaced with the wait in seconds
    #[serde(default)]
    pub message: Option<String>,
}

/// The limit attached to a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum LimitConfig {
    FixedWindow {
        window_ms: u64,
        max_requests: u64,
        #[serde(default)]
        skip_successful: bool,
    },
    TokenBucket {
        points: u64,
        duration_ms: u64,
        block_duration_ms: u64,
    },
    Concurrency {
        max_slots: u64,
        #[serde(default = "default_slot_ttl_ms")]
        slot_ttl_ms: u64,
    },
    Tiered,
}

fn default_slot_ttl_ms() -> u64 {
    300_000
}

/// Role tiers for the `tiered` limit, highest privilege first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierTableConfig {
    #[serde(default)]
    pub levels: Vec<TierConfig>,
    /// Authenticated callers holding none of the listed roles
    pub authenticated: TierLimit,
    /// Callers without an identity
    pub anonymous: TierLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub role: String,
    pub window_ms: u64,
    pub max_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimit {
    pub window_ms: u64,
    pub max_requests: u64,
}

const MINUTE_MS: u64 = 60 * 1000;

impl Default for TierTableConfig {
    fn default() -> Self {
        let per_minute = |role: &str, max_requests| TierConfig {
            role: role.to_string(),
            window_ms: MINUTE_MS,
            max_requests,
        };
        Self {
            levels: vec![
                per_minute("system_admin", 1000),
                per_minute("company_admin", 500),
                per_minute("property_manager", 300),
                per_minute("landlord", 200),
                per_minute("tenant", 100),
            ],
            authenticated: TierLimit {
                window_ms: 15 * MINUTE_MS,
                max_requests: 50,
            },
            anonymous: TierLimit {
                window_ms: 15 * MINUTE_MS,
                max_requests: 30,
            },
        }
    }
}

/// The rules the service starts with when none are configured.
pub fn default_rules() -> Vec<RuleConfig> {
    let fixed = |window_ms, max_requests| LimitConfig::FixedWindow {
        window_ms,
        max_requests,
        skip_successful: false,
    };
    let rule = |name: &str, paths: &[&str], limit, message: &str| RuleConfig {
        name: name.to_string(),
        paths: paths.iter().map(|p| p.to_string()).collect(),
        limit,
        key_by: KeySource::Identity,
        per_route: false,
        requires_api_key: false,
        message: Some(message.to_string()),
    };
    const HOUR_MS: u64 = 60 * MINUTE_MS;

    vec![
        RuleConfig {
            key_by: KeySource::ClientAddress,
            ..rule(
                "api",
                &["/api/"],
                fixed(15 * MINUTE_MS, 100),
                "Too many requests from this IP, please try again after 15 minutes",
            )
        },
        RuleConfig {
            key_by: KeySource::ClientAddress,
            ..rule(
                "auth",
                &["/api/auth/login", "/api/auth/register", "/api/auth/forgot-password"],
                LimitConfig::FixedWindow {
                    window_ms: HOUR_MS,
                    max_requests: 5,
                    skip_successful: true,
                },
                "Too many login attempts, please try again after an hour",
            )
        },
        rule(
            "upload",
            &["/api/*/upload"],
            fixed(HOUR_MS, 50),
            "Too many uploads, please try again after an hour",
        ),
        RuleConfig {
            key_by: KeySource::ApiKey,
            requires_api_key: true,
            ..rule("apikey", &["/api/"], fixed(MINUTE_MS, 60), "API rate limit exceeded")
        },
        rule(
            "download",
            &[],
            fixed(HOUR_MS, 20),
            "Download limit exceeded. Please try again in an hour.",
        ),
        rule(
            "dynamic",
            &[],
            LimitConfig::Tiered,
            "Rate limit exceeded for your account type",
        ),
        RuleConfig {
            per_route: true,
            ..rule(
                "burst",
                &[],
                LimitConfig::TokenBucket {
                    points: 10,
                    duration_ms: 1000,
                    block_duration_ms: MINUTE_MS,
                },
                "Too many requests. Please try again in {retry_after} seconds.",
            )
        },
        rule(
            "concurrent",
            &[],
            LimitConfig::Concurrency {
                max_slots: 5,
                slot_ttl_ms: default_slot_ttl_ms(),
            },
            "Too many concurrent requests. Please wait a moment.",
        ),
    ]
}

/// An Express-style mount pattern such as `/api/` or `/api/*/upload`.
///
/// A pattern matches a path when each of its segments matches the path's
/// leading segments; `*` matches exactly one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Option<String>>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if !pattern.starts_with('/') {
            return Err(ConfigError::invalid(
                "rules.paths",
                format!("{:?} must start with '/'", pattern),
            ));
        }
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| (s != "*").then(|| s.to_string()))
            .collect();
        Ok(Self { segments })
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        self.segments.iter().all(|segment| match (segment, parts.next()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(literal), Some(part)) => literal == part,
        })
    }
}

/// Which algorithm a selection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVariant {
    FixedWindow,
    TokenBucket,
    Concurrency,
}

#[derive(Debug, Clone)]
enum RuleLimit {
    Static(PolicyVariant, PolicyConfig),
    Tiered,
}

/// A validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    patterns: Vec<PathPattern>,
    limit: RuleLimit,
    key_by: KeySource,
    per_route: bool,
    requires_api_key: bool,
    message: String,
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Result<Self, ConfigError> {
        let field = |name: &str| format!("rules.{}.{}", config.name, name);
        if config.name.trim().is_empty() || config.name.contains(':') {
            return Err(ConfigError::invalid(
                "rules.name",
                format!("{:?} must be non-empty and contain no ':'", config.name),
            ));
        }

        let patterns = config
            .paths
            .iter()
            .map(|p| PathPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;

        let positive = |name: &str, value: u64| {
            if value == 0 {
                Err(ConfigError::invalid(field(name), "must be greater than zero"))
            } else {
                Ok(value)
            }
        };
        let millis = |name: &str, value: u64| positive(name, value).map(Duration::from_millis);

        let limit = match &config.limit {
            LimitConfig::FixedWindow {
                window_ms,
                max_requests,
                skip_successful,
            } => {
                let mut cfg = PolicyConfig::fixed_window(
                    millis("window_ms", *window_ms)?,
                    positive("max_requests", *max_requests)?,
                );
                cfg.skip_successful = *skip_successful;
                RuleLimit::Static(PolicyVariant::FixedWindow, cfg)
            }
            LimitConfig::TokenBucket {
                points,
                duration_ms,
                block_duration_ms,
            } => RuleLimit::Static(
                PolicyVariant::TokenBucket,
                PolicyConfig::token_bucket(
                    positive("points", *points)?,
                    millis("duration_ms", *duration_ms)?,
                    millis("block_duration_ms", *block_duration_ms)?,
                ),
            ),
            LimitConfig::Concurrency {
                max_slots,
                slot_ttl_ms,
            } => RuleLimit::Static(
                PolicyVariant::Concurrency,
                PolicyConfig::concurrency(
                    positive("max_slots", *max_slots)?,
                    millis("slot_ttl_ms", *slot_ttl_ms)?,
                ),
            ),
            LimitConfig::Tiered => RuleLimit::Tiered,
        };

        Ok(Self {
            name: config.name.clone(),
            patterns,
            limit,
            key_by: config.key_by,
            per_route: config.per_route,
            requires_api_key: config.requires_api_key,
            message: config
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_by(&self) -> KeySource {
        self.key_by
    }

    pub fn is_per_route(&self) -> bool {
        self.per_route
    }

    pub fn is_tiered(&self) -> bool {
        matches!(self.limit, RuleLimit::Tiered)
    }

    /// The algorithm this rule runs. Tiered rules are fixed windows.
    pub fn variant(&self) -> PolicyVariant {
        match &self.limit {
            RuleLimit::Static(variant, _) => *variant,
            RuleLimit::Tiered => PolicyVariant::FixedWindow,
        }
    }

    /// The denial message with `{retry_after}` filled in.
    pub fn message(&self, retry_after_secs: Option<u64>) -> String {
        match retry_after_secs {
            Some(secs) => self.message.replace("{retry_after}", &secs.to_string()),
            None => self.message.clone(),
        }
    }

    fn applies_to(&self, request: &AdmissionRequest) -> bool {
        (!self.requires_api_key || request.api_key.is_some())
            && self.patterns.iter().any(|p| p.matches(&request.route_path))
    }

    fn namespace(&self, request: &AdmissionRequest) -> String {
        if self.per_route {
            format!("{}:{}", self.name, request.route_path)
        } else {
            self.name.clone()
        }
    }
}

/// A validated tier table.
#[derive(Debug, Clone)]
pub struct TierTable {
    levels: Vec<(String, PolicyConfig)>,
    authenticated: PolicyConfig,
    anonymous: PolicyConfig,
}

impl TierTable {
    pub fn from_config(config: &TierTableConfig) -> Result<Self, ConfigError> {
        let limit = |field: String, window_ms: u64, max_requests: u64| {
            if window_ms == 0 || max_requests == 0 {
                return Err(ConfigError::invalid(
                    field,
                    "window_ms and max_requests must be greater than zero",
                ));
            }
            Ok(PolicyConfig::fixed_window(
                Duration::from_millis(window_ms),
                max_requests,
            ))
        };

        let mut seen = HashSet::new();
        let mut levels = Vec::with_capacity(config.levels.len());
        for level in &config.levels {
            if level.role.trim().is_empty() {
                return Err(ConfigError::invalid("tiers.levels.role", "must not be empty"));
            }
            if !seen.insert(level.role.as_str()) {
                return Err(ConfigError::invalid(
                    "tiers.levels.role",
                    format!("duplicate tier for role {:?}", level.role),
                ));
            }
            let cfg = limit(
                format!("tiers.levels.{}", level.role),
                level.window_ms,
                level.max_requests,
            )?;
            levels.push((level.role.clone(), cfg));
        }

        Ok(Self {
            levels,
            authenticated: limit(
                "tiers.authenticated".to_string(),
                config.authenticated.window_ms,
                config.authenticated.max_requests,
            )?,
            anonymous: limit(
                "tiers.anonymous".to_string(),
                config.anonymous.window_ms,
                config.anonymous.max_requests,
            )?,
        })
    }

    /// The tier for a caller: the first listed role the caller holds, the
    /// authenticated fallback, or the anonymous tier.
    pub fn select(&self, identity: Option<&Identity>) -> (&str, &PolicyConfig) {
        let Some(identity) = identity else {
            return ("anonymous", &self.anonymous);
        };
        self.levels
            .iter()
            .find(|(role, _)| identity.has_role(role))
            .map(|(role, cfg)| (role.as_str(), cfg))
            .unwrap_or(("authenticated", &self.authenticated))
    }
}

/// The policy and configuration chosen for one rule on one request.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub rule: &'a Rule,
    pub variant: PolicyVariant,
    pub config: PolicyConfig,
    pub namespace: String,
    /// The tier that supplied `config`, for tiered rules.
    pub tier: Option<&'a str>,
}

/// Chooses the policies that apply to a request. Pure given the request and
/// the rule table.
#[derive(Debug, Clone)]
pub struct PolicySelector {
    rules: Vec<Rule>,
    tiers: TierTable,
}

impl PolicySelector {
    pub fn from_config(rules: &[RuleConfig], tiers: &TierTableConfig) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        let mut built = Vec::with_capacity(rules.len());
        for config in rules {
            if !names.insert(config.name.as_str()) {
                return Err(ConfigError::invalid(
                    "rules.name",
                    format!("duplicate rule {:?}", config.name),
                ));
            }
            built.push(Rule::from_config(config)?);
        }

        let tiers = TierTable::from_config(tiers)?;
        info!(rules = built.len(), "Rate limit rules loaded");
        Ok(Self {
            rules: built,
            tiers,
        })
    }

    /// Every rule that applies to `request`, in configuration order.
    pub fn select<'a>(&'a self, request: &AdmissionRequest) -> Vec<Selection<'a>> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(request))
            .map(|rule| {
                let (variant, config, tier) = match &rule.limit {
                    RuleLimit::Static(variant, config) => (*variant, config.clone(), None),
                    RuleLimit::Tiered => {
                        let (tier, config) = self.tiers.select(request.identity.as_ref());
                        (PolicyVariant::FixedWindow, config.clone(), Some(tier))
                    }
                };
                Selection {
                    rule,
                    variant,
                    config,
                    namespace: rule.namespace(request),
                    tier,
                }
            })
            .collect()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Rules whose namespace can be addressed by identity alone, i.e. every
    /// rule except per-route ones.
    pub fn shared_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|rule| !rule.per_route)
    }
}

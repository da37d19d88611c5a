//! Attribute-based access control policy engine.
//!
//! Policies are grouped into packs keyed by a scope (a service host name)
//! and loaded from YAML files: one `service_registry.yaml` mapping scopes
//! to default stances, and any number of `policies.*.yaml` files each
//! holding a pack of prioritized rules. Evaluation walks every enabled
//! policy in priority order (highest first); the first policy whose
//! action/resource pattern, subject and conditions all match wins. If none
//! match, the request falls back to the scope's configured default stance.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    ShadowDeny,
    Warn,
    Deny,
}

impl Effect {
    fn precedence(self) -> u8 {
        match self {
            Effect::Deny => 4,
            Effect::Warn => 3,
            Effect::ShadowDeny => 2,
            Effect::Allow => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerLevel {
    None,
    Decision,
    Action,
    Full,
}

impl LedgerLevel {
    fn precedence(self) -> u8 {
        match self {
            LedgerLevel::Full => 4,
            LedgerLevel::Action => 3,
            LedgerLevel::Decision => 2,
            LedgerLevel::None => 1,
        }
    }

    fn max(self, other: LedgerLevel) -> LedgerLevel {
        if self.precedence() >= other.precedence() {
            self
        } else {
            other
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySubject {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyCondition {
    ClaimCheck { claim_type: String },
    CallerAsserts { fact: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub subject: PolicySubject,
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
    pub effect: Effect,
    #[serde(default)]
    pub ledger_level: LedgerLevel,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Default for LedgerLevel {
    fn default() -> Self {
        LedgerLevel::Decision
    }
}

fn default_priority() -> i32 {
    0
}
fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPack {
    pub scope: String,
    #[serde(default)]
    pub version: Option<String>,
    pub policies: Vec<Policy>,
}

impl PolicyPack {
    fn sort_by_priority(&mut self) {
        self.policies.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceScope {
    #[serde(default = "default_stance")]
    pub default_stance: Effect,
    #[serde(default)]
    pub ledger_level: LedgerLevel,
}

fn default_stance() -> Effect {
    Effect::Deny
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub claim_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub claims: Vec<Claim>,
    pub asserted_facts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub action: String,
    pub resource: String,
    pub host: String,
    pub subject: PolicySubject,
    pub context: RequestContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub decision: Effect,
    pub policy_id: Option<String>,
    pub policy_version: Option<String>,
    pub reason: Option<String>,
    pub required_ledger_level: LedgerLevel,
}

/// Translate a glob-like policy pattern into an anchored regex.
/// `*` alone matches anything; `**` matches any sequence including `:`;
/// a bare `*` inside a segment matches any run of characters except `:`.
fn pattern_to_regex(pattern: &str) -> Regex {
    if pattern == "*" {
        return Regex::new("^.*$").expect("static pattern is valid");
    }
    let escaped = pattern.replace('.', "\\.");
    let escaped = escaped.replace("**", "\u{0}");
    let escaped = escaped.replace('*', "[^:]*");
    let escaped = escaped.replace('\u{0}', ".*");
    Regex::new(&format!("^{escaped}$")).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    pattern_to_regex(pattern).is_match(value)
}

fn matches_subject(policy_subject: &PolicySubject, request_subject: &PolicySubject) -> bool {
    if let Some(role) = &policy_subject.role {
        if role != "*" && Some(role) != request_subject.role.as_ref() {
            return false;
        }
    }
    if let Some(user_id) = &policy_subject.user_id {
        if Some(user_id) != request_subject.user_id.as_ref() {
            return false;
        }
    }
    for (key, value) in &policy_subject.attributes {
        if request_subject.attributes.get(key) != Some(value) {
            return false;
        }
    }
    true
}

fn check_condition(condition: &PolicyCondition, context: &RequestContext) -> (bool, Option<String>) {
    match condition {
        PolicyCondition::ClaimCheck { claim_type } => {
            let satisfied = context.claims.iter().any(|c| &c.claim_type == claim_type);
            let reason = (!satisfied).then(|| format!("missing required claim: {claim_type}"));
            (satisfied, reason)
        }
        PolicyCondition::CallerAsserts { fact } => {
            let satisfied = context.asserted_facts.iter().any(|f| f == fact);
            let reason = (!satisfied).then(|| format!("missing asserted fact: {fact}"));
            (satisfied, reason)
        }
    }
}

pub struct PolicyEngine {
    config_dir: PathBuf,
    packs: RwLock<HashMap<String, PolicyPack>>,
    service_registry: RwLock<HashMap<String, ServiceScope>>,
}

impl PolicyEngine {
    pub fn new(config_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            config_dir: config_dir.into(),
            packs: RwLock::new(HashMap::new()),
            service_registry: RwLock::new(HashMap::new()),
        })
    }

    /// Load all policy packs and the service registry from `config_dir`.
    /// Reload is an atomic pointer swap: the new maps are built in full
    /// before the write locks are taken, so readers never observe a
    /// partially-loaded state.
    pub async fn load(&self) -> Result<(), PolicyError> {
        let registry_path = self.config_dir.join("service_registry.yaml");
        let registry = if registry_path.exists() {
            let raw = std::fs::read_to_string(&registry_path).map_err(|e| PolicyError::Io {
                path: registry_path.clone(),
                source: e,
            })?;
            serde_yaml::from_str(&raw).map_err(|e| PolicyError::Parse {
                path: registry_path.clone(),
                source: e,
            })?
        } else {
            HashMap::new()
        };

        let mut packs = HashMap::new();
        let entries = std::fs::read_dir(&self.config_dir).map_err(|e| PolicyError::Io {
            path: self.config_dir.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| PolicyError::Io {
                path: self.config_dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if is_policy_pack_file(&path) {
                let raw = std::fs::read_to_string(&path).map_err(|e| PolicyError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                let mut pack: PolicyPack = serde_yaml::from_str(&raw).map_err(|e| PolicyError::Parse {
                    path: path.clone(),
                    source: e,
                })?;
                pack.sort_by_priority();
                packs.insert(pack.scope.clone(), pack);
            }
        }

        *self.packs.write().await = packs;
        *self.service_registry.write().await = registry;
        tracing::info!(packs = self.packs.read().await.len(), "policy packs loaded");
        Ok(())
    }

    fn scope_defaults<'a>(
        registry: &'a HashMap<String, ServiceScope>,
        host: &str,
    ) -> ServiceScope {
        registry.get(host).cloned().unwrap_or(ServiceScope {
            default_stance: Effect::Deny,
            ledger_level: LedgerLevel::Decision,
        })
    }

    pub async fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision {
        let packs = self.packs.read().await;
        let registry = self.service_registry.read().await;

        let mut candidates: Vec<&Policy> = packs
            .values()
            .flat_map(|pack| pack.policies.iter())
            .filter(|p| p.enabled)
            .filter(|p| matches_pattern(&p.action, &request.action))
            .filter(|p| matches_pattern(&p.resource, &request.resource))
            .filter(|p| matches_subject(&p.subject, &request.subject))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut max_ledger_level = LedgerLevel::None;
        let mut last_failed_reason: Option<String> = None;

        for policy in &candidates {
            max_ledger_level = max_ledger_level.max(policy.ledger_level);

            let mut all_satisfied = true;
            for condition in &policy.conditions {
                let (satisfied, reason) = check_condition(condition, &request.context);
                if !satisfied {
                    all_satisfied = false;
                    last_failed_reason = reason;
                    break;
                }
            }

            if all_satisfied {
                return PolicyDecision {
                    decision: policy.effect,
                    policy_id: Some(policy.id.clone()),
                    policy_version: None,
                    reason: policy.reason.clone(),
                    required_ledger_level: max_ledger_level,
                };
            }
        }

        let scope = Self::scope_defaults(&registry, &request.host);
        PolicyDecision {
            decision: scope.default_stance,
            policy_id: None,
            policy_version: None,
            reason: Some(last_failed_reason.unwrap_or_else(|| {
                format!("no matching policy; default stance is {:?}", scope.default_stance)
            })),
            required_ledger_level: max_ledger_level.max(scope.ledger_level),
        }
    }
}

fn is_policy_pack_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with("policies.") && name.ends_with(".yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: &str, priority: i32, effect: Effect) -> Policy {
        Policy {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            priority,
            enabled: true,
            action: "*".into(),
            resource: "*".into(),
            subject: PolicySubject::default(),
            conditions: vec![],
            effect,
            ledger_level: LedgerLevel::Decision,
            reason: None,
        }
    }

    #[test]
    fn pattern_star_matches_anything() {
        assert!(matches_pattern("*", "agents:write"));
    }

    #[test]
    fn pattern_single_segment_star_does_not_cross_colon() {
        assert!(matches_pattern("agents.*", "agents.read"));
        assert!(!matches_pattern("agents.*", "agents:read:extra"));
    }

    #[test]
    fn pattern_double_star_crosses_segments() {
        assert!(matches_pattern("agents.**", "agents:read:extra"));
    }

    #[tokio::test]
    async fn highest_priority_matching_policy_wins() {
        let mut low = policy("low", 1, Effect::Allow);
        low.action = "tasks.create".into();
        low.resource = "*".into();
        let mut high = policy("high", 100, Effect::Deny);
        high.action = "tasks.create".into();
        high.resource = "*".into();

        let pack = PolicyPack {
            scope: "svc".into(),
            version: None,
            policies: vec![low, high],
        };

        let engine = PolicyEngine {
            config_dir: PathBuf::new(),
            packs: RwLock::new(HashMap::from([("svc".into(), pack)])),
            service_registry: RwLock::new(HashMap::new()),
        };

        let decision = engine
            .evaluate(&PolicyRequest {
                action: "tasks.create".into(),
                resource: "any".into(),
                host: "svc".into(),
                subject: PolicySubject::default(),
                context: RequestContext::default(),
            })
            .await;

        assert_eq!(decision.decision, Effect::Deny);
        assert_eq!(decision.policy_id.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn falls_back_to_scope_default_when_nothing_matches() {
        let engine = PolicyEngine {
            config_dir: PathBuf::new(),
            packs: RwLock::new(HashMap::new()),
            service_registry: RwLock::new(HashMap::from([(
                "svc".into(),
                ServiceScope {
                    default_stance: Effect::Warn,
                    ledger_level: LedgerLevel::Action,
                },
            )])),
        };

        let decision = engine
            .evaluate(&PolicyRequest {
                action: "tasks.create".into(),
                resource: "any".into(),
                host: "svc".into(),
                subject: PolicySubject::default(),
                context: RequestContext::default(),
            })
            .await;

        assert_eq!(decision.decision, Effect::Warn);
        assert_eq!(decision.policy_id, None);
    }

    #[tokio::test]
    async fn condition_failure_falls_through_to_next_policy() {
        let mut gated = policy("gated", 100, Effect::Allow);
        gated.conditions = vec![PolicyCondition::CallerAsserts {
            fact: "verified".into(),
        }];
        let ungated = policy("ungated", 1, Effect::Deny);

        let pack = PolicyPack {
            scope: "svc".into(),
            version: None,
            policies: vec![gated, ungated],
        };

        let engine = PolicyEngine {
            config_dir: PathBuf::new(),
            packs: RwLock::new(HashMap::from([("svc".into(), pack)])),
            service_registry: RwLock::new(HashMap::new()),
        };

        let decision = engine
            .evaluate(&PolicyRequest {
                action: "*".into(),
                resource: "*".into(),
                host: "svc".into(),
                subject: PolicySubject::default(),
                context: RequestContext::default(),
            })
            .await;

        assert_eq!(decision.decision, Effect::Deny);
        assert_eq!(decision.policy_id.as_deref(), Some("ungated"));
    }
}

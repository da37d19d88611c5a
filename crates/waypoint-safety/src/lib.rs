//! Command safety classification.
//!
//! Every command is checked against three pattern families in a fixed
//! order: blocklist first (command is rejected outright), then
//! approval-required (command is allowed but needs a human sign-off),
//! then safe (command runs without friction). A command matching none of
//! the three is treated as unknown and defaults to requiring approval at
//! medium risk, the conservative fallback.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub blocked: bool,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub reason: Option<String>,
    pub matched_pattern: Option<String>,
}

impl ValidationResult {
    fn blocked(pattern: &str) -> Self {
        Self {
            valid: false,
            blocked: true,
            requires_approval: false,
            risk_level: RiskLevel::High,
            reason: Some(format!("command matches blocked pattern: {pattern}")),
            matched_pattern: Some(pattern.to_string()),
        }
    }

    fn needs_approval(pattern: &str) -> Self {
        Self {
            valid: true,
            blocked: false,
            requires_approval: true,
            risk_level: RiskLevel::Medium,
            reason: Some(format!("command matches approval-required pattern: {pattern}")),
            matched_pattern: Some(pattern.to_string()),
        }
    }

    fn safe(pattern: &str) -> Self {
        Self {
            valid: true,
            blocked: false,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            reason: None,
            matched_pattern: Some(pattern.to_string()),
        }
    }

    fn unknown() -> Self {
        Self {
            valid: true,
            blocked: false,
            requires_approval: true,
            risk_level: RiskLevel::Medium,
            reason: Some("unknown command - requires approval".to_string()),
            matched_pattern: None,
        }
    }
}

/// Raw pattern lists behind a `SafetyValidator`. Kept as plain strings
/// (not compiled regexes) so the config can be loaded from YAML and
/// overridden per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub blocklist_patterns: Vec<String>,
    pub approval_required_patterns: Vec<String>,
    pub safe_patterns: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocklist_patterns: vec![
                r"rm\s+-rf\s+/(\s|$)".into(),
                r"rm\s+-rf\s+/\*".into(),
                r"rm\s+-rf\s+~".into(),
                r"rm\s+-rf\s+\$HOME".into(),
                r"mkfs\.".into(),
                r"dd\s+if=.*of=/dev/".into(),
                r":\(\)\s*\{\s*:\|:&\s*\};:".into(),
                r">\s*/dev/sd".into(),
                r"chmod\s+-R\s+777\s+/".into(),
                r"curl.*\|\s*bash".into(),
                r"wget.*\|\s*bash".into(),
                r"sudo\s+rm\s+-rf".into(),
                r"/etc/passwd".into(),
                r"/etc/shadow".into(),
                r"iptables\s+-F".into(),
                r"systemctl\s+stop\s+ssh".into(),
            ],
            approval_required_patterns: vec![
                r"^reboot".into(),
                r"^shutdown".into(),
                r"systemctl\s+(restart|stop|disable)".into(),
                r"(apt|apt-get)\s+(install|remove|purge|upgrade)".into(),
                r"pip\s+install".into(),
                r"npm\s+install\s+-g".into(),
                r"docker\s+(rm|rmi|system\s+prune)".into(),
                r"git\s+push\s+--force".into(),
                r"DROP\s+TABLE".into(),
                r"DELETE\s+FROM".into(),
                r"TRUNCATE".into(),
            ],
            safe_patterns: vec![
                r"^ls".into(),
                r"^pwd$".into(),
                r"^whoami$".into(),
                r"^date$".into(),
                r"^uptime$".into(),
                r"^df".into(),
                r"^free".into(),
                r"^cat".into(),
                r"^head".into(),
                r"^tail".into(),
                r"^grep".into(),
                r"^find".into(),
                r"^git\s+(status|log|diff|branch|fetch|pull)".into(),
                r"^docker\s+(ps|images|logs)".into(),
                r"^systemctl\s+status".into(),
                r"^journalctl".into(),
            ],
        }
    }
}

struct CompiledFamily {
    set: RegexSet,
    patterns: Vec<String>,
}

impl CompiledFamily {
    fn compile(patterns: &[String]) -> Self {
        Self {
            set: RegexSet::new(patterns.iter().map(|p| format!("(?i){p}")))
                .expect("safety patterns must be valid regexes"),
            patterns: patterns.to_vec(),
        }
    }

    fn first_match(&self, command: &str) -> Option<&str> {
        self.set
            .matches(command)
            .iter()
            .next()
            .map(|idx| self.patterns[idx].as_str())
    }
}

pub struct SafetyValidator {
    blocklist: CompiledFamily,
    approval_required: CompiledFamily,
    safe: CompiledFamily,
}

impl SafetyValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            blocklist: CompiledFamily::compile(&config.blocklist_patterns),
            approval_required: CompiledFamily::compile(&config.approval_required_patterns),
            safe: CompiledFamily::compile(&config.safe_patterns),
        }
    }

    pub fn validate_command(&self, command: &str) -> ValidationResult {
        if let Some(pattern) = self.blocklist.first_match(command) {
            return ValidationResult::blocked(pattern);
        }
        if let Some(pattern) = self.approval_required.first_match(command) {
            return ValidationResult::needs_approval(pattern);
        }
        if let Some(pattern) = self.safe.first_match(command) {
            return ValidationResult::safe(pattern);
        }
        ValidationResult::unknown()
    }

    /// Validate every command; `all_valid` is false if any command was
    /// blocked.
    pub fn validate_commands(&self, commands: &[String]) -> (bool, Vec<ValidationResult>) {
        let results: Vec<_> = commands.iter().map(|c| self.validate_command(c)).collect();
        let all_valid = results.iter().all(|r| r.valid);
        (all_valid, results)
    }

    pub fn get_risk_level(&self, commands: &[String]) -> RiskLevel {
        commands
            .iter()
            .map(|c| self.validate_command(c).risk_level)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    pub fn should_require_approval(&self, commands: &[String]) -> bool {
        commands
            .iter()
            .any(|c| self.validate_command(c).requires_approval)
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(&SafetyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::default()
    }

    #[test]
    fn blocklist_takes_precedence() {
        let result = validator().validate_command("sudo rm -rf /important");
        assert!(result.blocked);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[test]
    fn approval_required_for_package_install() {
        let result = validator().validate_command("apt-get install curl");
        assert!(result.valid);
        assert!(result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn safe_commands_need_no_approval() {
        let result = validator().validate_command("git status");
        assert!(result.valid);
        assert!(!result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[test]
    fn unknown_commands_default_to_medium_risk_approval() {
        let result = validator().validate_command("run-my-custom-thing --flag");
        assert!(result.valid);
        assert!(result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn risk_level_is_max_across_commands() {
        let v = validator();
        let commands = vec!["git status".to_string(), "apt-get install curl".to_string()];
        assert_eq!(v.get_risk_level(&commands), RiskLevel::Medium);
    }

    #[test]
    fn validate_commands_flags_blocked_as_invalid() {
        let v = validator();
        let commands = vec!["ls -la".to_string(), "rm -rf /".to_string()];
        let (all_valid, results) = v.validate_commands(&commands);
        assert!(!all_valid);
        assert!(results[1].blocked);
    }
}

//! Security policy applied to tool calls.
//!
//! The policy answers three questions before a tool runs: is the autonomy
//! level high enough for this class of tool, is the path inside the
//! allowed roots, and is the command free of blocked substrings. Denials
//! are surfaced to the agent as tool errors, never as loop failures.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Readonly,
    #[default]
    Supervised,
    Full,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::Readonly => "readonly",
            AutonomyLevel::Supervised => "supervised",
            AutonomyLevel::Full => "full",
        }
    }
}

impl std::str::FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(AutonomyLevel::Readonly),
            "supervised" => Ok(AutonomyLevel::Supervised),
            "full" => Ok(AutonomyLevel::Full),
            other => Err(format!("unknown autonomy level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    /// Paths tool arguments may reference. Empty = everything allowed.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// Substrings that block a command outright.
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
}

fn default_blocked_commands() -> Vec<String> {
    ["rm -rf /", "mkfs", "dd if=", ":(){", "shutdown", "reboot"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            autonomy: AutonomyLevel::default(),
            allowed_paths: Vec::new(),
            blocked_commands: default_blocked_commands(),
        }
    }
}

impl SecurityPolicy {
    pub fn readonly() -> Self {
        Self {
            autonomy: AutonomyLevel::Readonly,
            ..Default::default()
        }
    }

    pub fn check_path(&self, path: &Path) -> Result<(), String> {
        if self.allowed_paths.is_empty() {
            return Ok(());
        }
        if self.allowed_paths.iter().any(|root| path.starts_with(root)) {
            Ok(())
        } else {
            Err(format!("path not allowed: {}", path.display()))
        }
    }

    pub fn check_command(&self, command: &str) -> Result<(), String> {
        for blocked in &self.blocked_commands {
            if command.contains(blocked.as_str()) {
                return Err(format!("blocked command pattern: {blocked}"));
            }
        }
        Ok(())
    }

    /// Checks a tool call against the policy: write-class tools need more
    /// than readonly autonomy, and any `path`/`command` argument is vetted.
    pub fn check_tool_call(
        &self,
        tool_name: &str,
        is_write_class: bool,
        args: &Value,
    ) -> Result<(), String> {
        if self.autonomy == AutonomyLevel::Readonly && is_write_class {
            return Err(format!(
                "tool '{tool_name}' requires write access but autonomy is readonly"
            ));
        }
        if let Some(path) = args.get("path").and_then(Value::as_str) {
            self.check_path(Path::new(path))?;
        }
        if let Some(command) = args.get("command").and_then(Value::as_str) {
            self.check_command(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_autonomy_parse() {
        assert_eq!("readonly".parse::<AutonomyLevel>(), Ok(AutonomyLevel::Readonly));
        assert_eq!("full".parse::<AutonomyLevel>(), Ok(AutonomyLevel::Full));
        assert!("root".parse::<AutonomyLevel>().is_err());
    }

    #[test]
    fn test_readonly_blocks_write_class() {
        let policy = SecurityPolicy::readonly();
        assert!(policy.check_tool_call("file_write", true, &json!({})).is_err());
        assert!(policy.check_tool_call("file_read", false, &json!({})).is_ok());
    }

    #[test]
    fn test_path_allowlist() {
        let policy = SecurityPolicy {
            allowed_paths: vec![PathBuf::from("/workspace")],
            ..Default::default()
        };
        assert!(policy.check_path(Path::new("/workspace/notes.md")).is_ok());
        assert!(policy.check_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_empty_allowlist_allows_everything() {
        let policy = SecurityPolicy::default();
        assert!(policy.check_path(Path::new("/anywhere")).is_ok());
    }

    #[test]
    fn test_blocked_commands() {
        let policy = SecurityPolicy::default();
        assert!(policy.check_command("ls -la").is_ok());
        assert!(policy.check_command("sudo rm -rf / --no-preserve-root").is_err());
    }

    #[test]
    fn test_tool_call_args_vetted() {
        let policy = SecurityPolicy {
            allowed_paths: vec![PathBuf::from("/workspace")],
            ..Default::default()
        };
        assert!(
            policy
                .check_tool_call("file_read", false, &json!({"path": "/workspace/a"}))
                .is_ok()
        );
        assert!(
            policy
                .check_tool_call("file_read", false, &json!({"path": "/etc/shadow"}))
                .is_err()
        );
        assert!(
            policy
                .check_tool_call("bash", false, &json!({"command": "mkfs /dev/sda"}))
                .is_err()
        );
    }
}

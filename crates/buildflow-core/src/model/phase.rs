use serde::{Deserialize, Serialize};
use std::fmt;

/// プラグインフェーズ（実行順）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Input,
    #[serde(rename = "prebuild")]
    PreBuild,
    #[serde(rename = "buildstep")]
    BuildStep,
    #[serde(rename = "prepublish")]
    PrePublish,
    #[serde(rename = "postbuild")]
    PostBuild,
    Exit,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Input,
        Phase::PreBuild,
        Phase::BuildStep,
        Phase::PrePublish,
        Phase::PostBuild,
        Phase::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Input => "input",
            Phase::PreBuild => "prebuild",
            Phase::BuildStep => "buildstep",
            Phase::PrePublish => "prepublish",
            Phase::PostBuild => "postbuild",
            Phase::Exit => "exit",
        }
    }

    /// build.json 上のキー（例: `prebuild_plugins`）
    pub fn config_key(&self) -> String {
        format!("{}_plugins", self.as_str())
    }

    pub fn from_config_key(key: &str) -> Option<Phase> {
        let name = key.strip_suffix("_plugins")?;
        Phase::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// プラグインの失敗を既定で許容するフェーズ
    pub fn allows_failure_by_default(&self) -> bool {
        matches!(self, Phase::PostBuild | Phase::Exit)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_key_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_config_key(&phase.config_key()), Some(phase));
        }
        assert_eq!(Phase::from_config_key("prebuild"), None);
        assert_eq!(Phase::from_config_key("unknown_plugins"), None);
    }

    #[test]
    fn test_default_failure_policy() {
        assert!(!Phase::PreBuild.allows_failure_by_default());
        assert!(!Phase::BuildStep.allows_failure_by_default());
        assert!(!Phase::PrePublish.allows_failure_by_default());
        assert!(Phase::PostBuild.allows_failure_by_default());
        assert!(Phase::Exit.allows_failure_by_default());
    }
}

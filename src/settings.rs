use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Run-wide setting selecting which action categories are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    /// Reads, writes and schema changes
    Full,
    /// Everything except schema changes
    Reduced,
    /// Read category only
    ReadOnly,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Full => "full",
            Complexity::Reduced => "reduced",
            Complexity::ReadOnly => "read-only",
        }
    }
}

impl FromStr for Complexity {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "ddl" => Ok(Complexity::Full),
            "reduced" | "dml" => Ok(Complexity::Reduced),
            "read-only" | "read_only" | "read" => Ok(Complexity::ReadOnly),
            other => Err(HarnessError::Config(format!(
                "unknown complexity '{other}': expected one of full, reduced, read-only"
            ))),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional fault-injection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    Regression,
    Rename,
    Cancel,
    Kill,
    BackupRestore,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Regression => "regression",
            Scenario::Rename => "rename",
            Scenario::Cancel => "cancel",
            Scenario::Kill => "kill",
            Scenario::BackupRestore => "backup-restore",
        }
    }

    /// Scenarios that take the service down underneath the workers.
    pub fn disrupts_connections(&self) -> bool {
        matches!(self, Scenario::Kill | Scenario::BackupRestore)
    }

    /// Scenarios that drive the environment and need a process controller.
    pub fn needs_process_controller(&self) -> bool {
        self.disrupts_connections()
    }
}

impl FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regression" => Ok(Scenario::Regression),
            "rename" => Ok(Scenario::Rename),
            "cancel" => Ok(Scenario::Cancel),
            "kill" => Ok(Scenario::Kill),
            "backup-restore" | "backup_restore" | "backuprestore" => Ok(Scenario::BackupRestore),
            other => Err(HarnessError::Config(format!(
                "unknown scenario '{other}': expected one of regression, rename, cancel, kill, backup-restore"
            ))),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_parses_names_and_aliases() {
        assert_eq!("full".parse::<Complexity>().unwrap(), Complexity::Full);
        assert_eq!("DDL".parse::<Complexity>().unwrap(), Complexity::Full);
        assert_eq!("dml".parse::<Complexity>().unwrap(), Complexity::Reduced);
        assert_eq!("read-only".parse::<Complexity>().unwrap(), Complexity::ReadOnly);
        assert_eq!("read".parse::<Complexity>().unwrap(), Complexity::ReadOnly);
    }

    #[test]
    fn unknown_complexity_is_rejected() {
        let err = "chaotic".parse::<Complexity>().unwrap_err();
        assert!(err.to_string().contains("unknown complexity 'chaotic'"));
    }

    #[test]
    fn scenario_round_trips_through_display() {
        for scenario in [
            Scenario::Regression,
            Scenario::Rename,
            Scenario::Cancel,
            Scenario::Kill,
            Scenario::BackupRestore,
        ] {
            assert_eq!(scenario.to_string().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("zombie".parse::<Scenario>().is_err());
    }

    #[test]
    fn only_environment_scenarios_need_a_controller() {
        assert!(Scenario::Kill.needs_process_controller());
        assert!(Scenario::BackupRestore.needs_process_controller());
        assert!(!Scenario::Cancel.needs_process_controller());
        assert!(!Scenario::Rename.needs_process_controller());
    }
}

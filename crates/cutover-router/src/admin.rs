use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cutover_types::MigrationError;

use crate::phase::PhaseController;

/// One administrative change, as received from a CLI or control API.
///
/// Text form is `key=value`:
/// `phase=validation`, `migration_percentage=0.25`, `validation_sampling=0.1`,
/// `fallback=on:250`, `fallback=off`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminCommand {
    SetPhase { phase: String },
    SetMigrationPercentage { value: f64 },
    SetValidationSampling { value: f64 },
    /// `timeout_ms: None` keeps the current timeout.
    SetFallback { enabled: bool, timeout_ms: Option<u64> },
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::SetPhase { phase } => write!(f, "phase={phase}"),
            AdminCommand::SetMigrationPercentage { value } => {
                write!(f, "migration_percentage={value}")
            }
            AdminCommand::SetValidationSampling { value } => {
                write!(f, "validation_sampling={value}")
            }
            AdminCommand::SetFallback { enabled, timeout_ms } => {
                write!(f, "fallback={}", if *enabled { "on" } else { "off" })?;
                if let Some(ms) = timeout_ms {
                    write!(f, ":{ms}")?;
                }
                Ok(())
            }
        }
    }
}

fn invalid(msg: String) -> MigrationError {
    MigrationError::InvalidConfiguration(msg)
}

fn parse_f64(key: &str, raw: &str) -> Result<f64, MigrationError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(format!("{key} expects a number, got '{raw}'")))
}

impl FromStr for AdminCommand {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| invalid(format!("admin command '{s}' is not key=value")))?;
        let key = key.trim();
        match key {
            "phase" => Ok(AdminCommand::SetPhase { phase: value.trim().to_string() }),
            "migration_percentage" => Ok(AdminCommand::SetMigrationPercentage {
                value: parse_f64(key, value)?,
            }),
            "validation_sampling" => Ok(AdminCommand::SetValidationSampling {
                value: parse_f64(key, value)?,
            }),
            "fallback" => {
                let (state, timeout) = match value.split_once(':') {
                    Some((state, ms)) => {
                        let ms = ms.trim().parse::<u64>().map_err(|_| {
                            invalid(format!(
                                "fallback timeout must be whole milliseconds, got '{ms}'"
                            ))
                        })?;
                        (state, Some(ms))
                    }
                    None => (value, None),
                };
                let enabled = match state.trim().to_ascii_lowercase().as_str() {
                    "on" | "true" | "enabled" => true,
                    "off" | "false" | "disabled" => false,
                    other => {
                        return Err(invalid(format!(
                            "fallback expects on or off, got '{other}'"
                        )))
                    }
                };
                Ok(AdminCommand::SetFallback { enabled, timeout_ms: timeout })
            }
            other => Err(invalid(format!(
                "unknown admin setting '{other}'; expected phase, migration_percentage, \
                 validation_sampling or fallback"
            ))),
        }
    }
}

impl PhaseController {
    /// Apply one administrative command. On error the installed snapshot is unchanged.
    pub fn apply(&self, command: &AdminCommand) -> Result<(), MigrationError> {
        match command {
            AdminCommand::SetPhase { phase } => self.set_phase_named(phase),
            AdminCommand::SetMigrationPercentage { value } => self.set_migration_percentage(*value),
            AdminCommand::SetValidationSampling { value } => self.set_validation_sampling(*value),
            AdminCommand::SetFallback { enabled, timeout_ms } => {
                let timeout = match timeout_ms {
                    Some(ms) => Duration::from_millis(*ms),
                    None => self.get_config().fallback_timeout,
                };
                self.set_fallback(*enabled, timeout)
            }
        }
    }
}

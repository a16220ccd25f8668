use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;

use cutover_types::{MigrationError, MigrationPhase, RoutingConfig};

/// Holds the active `RoutingConfig` snapshot.
///
/// Readers load the current `Arc` without locking and always see one complete
/// configuration. Writers build a fresh snapshot, validate it and swap it in
/// whole; a rejected update leaves the previous snapshot installed. Writers
/// are serialized among themselves so concurrent read-modify-write updates
/// never overwrite each other.
pub struct PhaseController {
    current: ArcSwap<RoutingConfig>,
    write_lock: Mutex<()>,
}

impl PhaseController {
    pub fn new(initial: RoutingConfig) -> Result<Self, MigrationError> {
        initial.validate()?;
        Ok(PhaseController {
            current: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
        })
    }

    pub fn get_config(&self) -> Arc<RoutingConfig> {
        self.current.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    pub fn set_phase(&self, phase: MigrationPhase) -> Result<(), MigrationError> {
        self.update(|cfg| cfg.phase = phase)
    }

    /// Parse an administrator-supplied phase name, then install it.
    pub fn set_phase_named(&self, name: &str) -> Result<(), MigrationError> {
        let phase: MigrationPhase = name.parse()?;
        self.set_phase(phase)
    }

    pub fn set_migration_percentage(&self, percentage: f64) -> Result<(), MigrationError> {
        self.update(|cfg| cfg.migration_percentage = percentage)
    }

    pub fn set_validation_sampling(&self, sampling: f64) -> Result<(), MigrationError> {
        self.update(|cfg| cfg.validation_sampling = sampling)
    }

    pub fn set_fallback(&self, enabled: bool, timeout: Duration) -> Result<(), MigrationError> {
        self.update(|cfg| {
            cfg.fallback_enabled = enabled;
            cfg.fallback_timeout = timeout;
        })
    }

    /// Install every setting of `config` at once. Its `revision` is ignored.
    pub fn replace(&self, config: RoutingConfig) -> Result<(), MigrationError> {
        self.update(|cfg| {
            *cfg = RoutingConfig {
                revision: cfg.revision,
                ..config
            }
        })
    }

    fn update<F>(&self, apply: F) -> Result<(), MigrationError>
    where
        F: FnOnce(&mut RoutingConfig),
    {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current.load_full();
        let mut next = RoutingConfig::clone(&current);
        apply(&mut next);
        next.validate()?;

        if next.same_settings(&current) {
            return Ok(());
        }

        next.revision = current.revision + 1;
        tracing::info!(
            revision = next.revision,
            phase = %next.phase,
            previous_phase = %current.phase,
            migration_percentage = next.migration_percentage,
            validation_sampling = next.validation_sampling,
            fallback_enabled = next.fallback_enabled,
            fallback_timeout_ms = next.fallback_timeout.as_millis() as u64,
            "routing config updated"
        );
        self.current.store(Arc::new(next));
        Ok(())
    }
}

impl Default for PhaseController {
    fn default() -> Self {
        PhaseController {
            current: ArcSwap::from_pointee(RoutingConfig::default()),
            write_lock: Mutex::new(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn starts_with_defaults() {
        let ctl = PhaseController::default();
        let cfg = ctl.get_config();
        assert_eq!(cfg.phase, MigrationPhase::LegacyOnly);
        assert_eq!(cfg.revision, 0);
        assert!(cfg.fallback_enabled);
    }

    #[test]
    fn rejects_invalid_initial_config() {
        let cfg = RoutingConfig { validation_sampling: 2.0, ..RoutingConfig::default() };
        assert!(matches!(
            PhaseController::new(cfg),
            Err(MigrationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn percentage_bounds() {
        let ctl = PhaseController::default();

        let err = ctl.set_migration_percentage(1.5).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidConfiguration(_)));
        assert_eq!(ctl.revision(), 0);

        ctl.set_migration_percentage(0.0).unwrap();
        ctl.set_migration_percentage(1.0).unwrap();
        assert_eq!(ctl.get_config().migration_percentage, 1.0);

        assert!(ctl.set_migration_percentage(-0.01).is_err());
        assert!(ctl.set_validation_sampling(f64::INFINITY).is_err());
        assert_eq!(ctl.get_config().migration_percentage, 1.0);
    }

    #[test]
    fn unknown_phase_name_leaves_snapshot_untouched() {
        let ctl = PhaseController::default();
        ctl.set_phase_named("validation").unwrap();
        let before = ctl.get_config();

        let err = ctl.set_phase_named("canary").unwrap_err();
        assert!(err.to_string().contains("canary"));
        assert_eq!(*ctl.get_config(), *before);
    }

    #[test]
    fn setting_same_phase_twice_is_a_no_op() {
        let ctl = PhaseController::default();
        ctl.set_phase(MigrationPhase::StranglerFig).unwrap();
        let first = ctl.get_config();
        assert_eq!(first.revision, 1);

        ctl.set_phase(MigrationPhase::StranglerFig).unwrap();
        let second = ctl.get_config();
        assert_eq!(second.revision, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn zero_fallback_timeout_rejected() {
        let ctl = PhaseController::default();
        assert!(ctl.set_fallback(true, Duration::ZERO).is_err());
        ctl.set_fallback(false, Duration::from_millis(250)).unwrap();
        let cfg = ctl.get_config();
        assert!(!cfg.fallback_enabled);
        assert_eq!(cfg.fallback_timeout, Duration::from_millis(250));
    }

    #[test]
    fn replace_keeps_revision_sequence() {
        let ctl = PhaseController::default();
        ctl.set_phase(MigrationPhase::Validation).unwrap();
        ctl.replace(RoutingConfig {
            phase: MigrationPhase::NewArchitecture,
            revision: 99,
            ..RoutingConfig::default()
        })
        .unwrap();
        let cfg = ctl.get_config();
        assert_eq!(cfg.phase, MigrationPhase::NewArchitecture);
        assert_eq!(cfg.revision, 2);
    }

    #[test]
    fn readers_never_see_torn_config() {
        // Writer alternates between two configs whose percentage and sampling
        // always agree; any reader that sees them disagree saw a torn update.
        let ctl = Arc::new(PhaseController::default());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let ctl = ctl.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut i = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let v = if i % 2 == 0 { 0.3 } else { 0.7 };
                    ctl.replace(RoutingConfig {
                        phase: MigrationPhase::StranglerFig,
                        migration_percentage: v,
                        validation_sampling: v,
                        ..RoutingConfig::default()
                    })
                    .unwrap();
                    i += 1;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ctl = ctl.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        let cfg = ctl.get_config();
                        assert_eq!(cfg.migration_percentage, cfg.validation_sampling);
                    }
                })
            })
            .collect();

        for r in readers {
            r.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}

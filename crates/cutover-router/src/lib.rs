pub mod admin;
pub mod diff;
pub mod fallback;
pub mod phase;
pub mod route;
pub mod service;
pub mod shadow;

pub use admin::AdminCommand;
pub use diff::{diff_values, Diff};
pub use fallback::{FallbackSupervisor, SupervisedOutcome};
pub use phase::PhaseController;
pub use route::{bucket, decide, RESOLUTION};
pub use service::{new_correlation_id, MigrationRouter, RouterStats};
pub use shadow::{ShadowConfig, ShadowJob, ShadowLaunch, ShadowStats, ShadowValidator};

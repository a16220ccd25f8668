use cutover_types::{Implementation, MigrationPhase, RoutingConfig, RoutingDecision};

/// Hash buckets per request space; one bucket is 0.01 %.
pub const RESOLUTION: u64 = 10_000;

/// Deterministic FNV-1a hash (stable across runs).
fn fnv1a_u64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// 64-bit avalanche finalizer. FNV-1a alone keeps too much structure in the
/// low bits for ids that differ only in their last characters.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Bucket in `[0, RESOLUTION)` for a correlation id.
pub fn bucket(correlation_id: &str) -> u64 {
    fmix64(fnv1a_u64(correlation_id)) % RESOLUTION
}

/// `bucket < fraction * RESOLUTION`, compared without rounding the product.
fn below(bucket: u64, fraction: f64) -> bool {
    (bucket as f64) < fraction.clamp(0.0, 1.0) * RESOLUTION as f64
}

/// Route one request against a single config snapshot.
///
/// Pure: the same correlation id under the same snapshot always yields the
/// same decision.
pub fn decide(config: &RoutingConfig, correlation_id: &str) -> RoutingDecision {
    let bucket = bucket(correlation_id);
    let (implementation, shadow_sampled) = match config.phase {
        MigrationPhase::LegacyOnly => (Implementation::Legacy, false),
        MigrationPhase::NewArchitecture => (Implementation::New, false),
        MigrationPhase::Validation => (
            Implementation::Legacy,
            below(bucket, config.validation_sampling),
        ),
        MigrationPhase::StranglerFig => {
            if below(bucket, config.migration_percentage) {
                (Implementation::New, false)
            } else {
                (Implementation::Legacy, false)
            }
        }
    };

    RoutingDecision {
        correlation_id: correlation_id.to_string(),
        phase: config.phase,
        implementation,
        shadow_sampled,
        bucket,
    }
}

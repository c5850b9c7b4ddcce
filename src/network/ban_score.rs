//! Misbehavior score with a persistent part and a transient part that
//! decays exponentially.

/// Seconds for the transient score to halve.
pub const HALFLIFE_SECS: i64 = 60;
/// Transient score older than this is discarded entirely.
pub const LIFETIME_SECS: i64 = 1800;

#[derive(Debug, Default, Clone)]
pub struct DynamicBanScore {
    last_unix: i64,
    transient: f64,
    persistent: u32,
}

fn decay_factor(elapsed: i64) -> f64 {
    if elapsed <= 0 {
        return 1.0;
    }
    if elapsed > LIFETIME_SECS {
        return 0.0;
    }
    0.5f64.powf(elapsed as f64 / HALFLIFE_SECS as f64)
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(&self) -> u32 {
        self.int_at(chrono::Utc::now().timestamp())
    }

    pub fn int_at(&self, now: i64) -> u32 {
        let transient = self.transient * decay_factor(now - self.last_unix);
        self.persistent.saturating_add(transient as u32)
    }

    /// Add to both parts and return the resulting score.
    pub fn increase(&mut self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, chrono::Utc::now().timestamp())
    }

    pub fn increase_at(&mut self, persistent: u32, transient: u32, now: i64) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        let elapsed = now - self.last_unix;
        self.transient *= decay_factor(elapsed);
        self.transient += transient as f64;
        self.last_unix = now;
        self.persistent.saturating_add(self.transient as u32)
    }

    pub fn reset(&mut self) {
        self.persistent = 0;
        self.transient = 0.0;
        self.last_unix = 0;
    }
}

impl std::fmt::Display for DynamicBanScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "persistent {} + transient {:.2} at {} = {}",
            self.persistent,
            self.transient,
            self.last_unix,
            self.int_at(self.last_unix)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_halves_each_halflife() {
        let mut score = DynamicBanScore::new();
        assert_eq!(score.increase_at(0, 100, 1_000), 100);
        assert_eq!(score.int_at(1_000 + HALFLIFE_SECS), 50);
        assert_eq!(score.int_at(1_000 + 2 * HALFLIFE_SECS), 25);
    }

    #[test]
    fn test_transient_expires_after_lifetime() {
        let mut score = DynamicBanScore::new();
        score.increase_at(10, 90, 0);
        assert_eq!(score.int_at(LIFETIME_SECS + 1), 10);
    }

    #[test]
    fn test_persistent_never_decays() {
        let mut score = DynamicBanScore::new();
        score.increase_at(100, 0, 0);
        assert_eq!(score.int_at(1_000_000), 100);
        score.reset();
        assert_eq!(score.int_at(0), 0);
    }
}

use rand::Rng;
use std::time::Duration;

/// `base` plus a random splay in `0..=max_splay`, so that nodes started
/// together do not hit the store in lockstep.
pub fn splayed(base: Duration, max_splay: Duration) -> Duration {
    let max_ms = max_splay.as_millis() as u64;
    if max_ms == 0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    base + Duration::from_millis(rng.gen_range(0..=max_ms))
}

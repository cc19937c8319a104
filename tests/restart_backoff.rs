// tests/restart_backoff.rs

use std::time::Duration;

use proptest::prelude::*;

use launchvisor::manifest::duration::parse_duration;
use launchvisor::manifest::{Backoff, MaxRetries};

#[test]
fn ceiling_doubles_until_cap() {
    let backoff = Backoff {
        base: Duration::from_millis(100),
        cap: Duration::from_millis(1000),
        jitter: 0.0,
    };

    assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
    assert_eq!(backoff.ceiling(1), Duration::from_millis(200));
    assert_eq!(backoff.ceiling(3), Duration::from_millis(800));
    assert_eq!(backoff.ceiling(4), Duration::from_millis(1000));
    assert_eq!(backoff.ceiling(u32::MAX), Duration::from_millis(1000));
}

#[test]
fn jitter_is_subtracted_from_the_ceiling() {
    let backoff = Backoff {
        base: Duration::from_millis(400),
        cap: Duration::from_secs(10),
        jitter: 0.5,
    };

    assert_eq!(backoff.delay_with_sample(0, 0.0), Duration::from_millis(400));
    assert_eq!(backoff.delay_with_sample(0, 1.0), Duration::from_millis(200));
    // Out-of-range samples are clamped.
    assert_eq!(backoff.delay_with_sample(0, 7.0), Duration::from_millis(200));
}

#[test]
fn unbounded_retries_fall_back_to_the_ceiling() {
    assert_eq!(MaxRetries::Limited(3).effective(1000), 3);
    assert_eq!(MaxRetries::Unbounded.effective(1000), 1000);
    assert_eq!(MaxRetries::default(), MaxRetries::Limited(5));
}

#[test]
fn durations_accept_common_units() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
    assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
    assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("5 fortnights").is_err());
    assert!(parse_duration("").is_err());
}

fn backoff_strategy() -> impl Strategy<Value = Backoff> {
    (1u64..5_000, 0u64..120_000, 0.0f64..=1.0).prop_map(|(base_ms, extra_ms, jitter)| Backoff {
        base: Duration::from_millis(base_ms),
        cap: Duration::from_millis(base_ms + extra_ms),
        jitter,
    })
}

proptest! {
    #[test]
    fn every_delay_lies_within_zero_and_the_ceiling(
        backoff in backoff_strategy(),
        attempt in 0u32..64,
    ) {
        let expected = backoff
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(backoff.cap);
        let ceiling = backoff.ceiling(attempt);
        let delay = backoff.delay(attempt);

        prop_assert!(ceiling <= backoff.cap);
        // Float rounding may differ from integer arithmetic by a nanosecond or so.
        prop_assert!(ceiling.abs_diff(expected) <= Duration::from_micros(1));
        prop_assert!(delay <= ceiling);
        prop_assert!(delay >= ceiling.mul_f64(1.0 - backoff.jitter).saturating_sub(Duration::from_micros(1)));
    }

    #[test]
    fn ceiling_never_decreases(backoff in backoff_strategy(), attempt in 0u32..63) {
        prop_assert!(backoff.ceiling(attempt) <= backoff.ceiling(attempt + 1));
    }
}

use petra_bridge::{BackoffPolicy, ReconnectSupervisor};
use proptest::prelude::*;

proptest! {
    #[test]
    fn delays_never_decrease_and_stay_capped(
        base in 1u64..2_000,
        factor in 1u64..64,
        jitter in 0.0f64..1.0,
        seed in any::<u64>(),
        attempts in 1usize..40,
    ) {
        let policy = BackoffPolicy {
            base_delay_ms: base,
            max_delay_ms: base * factor,
            jitter,
            min_stable_ms: 10_000,
        };
        let max = policy.max_delay();
        let mut supervisor = ReconnectSupervisor::with_seed("prop", policy, seed);

        let mut previous = std::time::Duration::ZERO;
        for _ in 0..attempts {
            let delay = supervisor.next_delay();
            prop_assert!(delay >= previous);
            prop_assert!(delay <= max);
            previous = delay;
        }
        prop_assert_eq!(supervisor.attempt() as usize, attempts);

        supervisor.reset();
        prop_assert_eq!(supervisor.attempt(), 0);
    }
}

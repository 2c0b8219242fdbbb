//! Property tests over arbitrary callback histories.

use proptest::prelude::*;
use rem_core::sim::Harness;
use rem_core::{
    ActivityMode, AuthorizationState, Coordinate, EngineConfig, EngineState, EvictionPolicy,
    NotificationDebouncer, RegionRequest, derive_state,
};

fn any_authorization() -> impl Strategy<Value = AuthorizationState> {
    prop::sample::select(AuthorizationState::ALL.to_vec())
}

fn any_activity() -> impl Strategy<Value = ActivityMode> {
    prop::sample::select(ActivityMode::ALL.to_vec())
}

/// The last status the engine accepted: a NotDetermined after any
/// determined value is stale and ignored.
fn last_accepted(history: &[AuthorizationState]) -> AuthorizationState {
    history
        .iter()
        .fold(AuthorizationState::NotDetermined, |current, &next| {
            if next == AuthorizationState::NotDetermined && current.is_determined() {
                current
            } else {
                next
            }
        })
}

proptest! {
    #[test]
    fn state_depends_only_on_last_accepted_authorization(
        history in prop::collection::vec(any_authorization(), 1..40),
        activity in any_activity(),
    ) {
        let h = Harness::new();
        let mut engine = h.engine(EngineConfig::default());
        engine.start();
        engine.set_activity_mode(activity);
        for status in &history {
            engine.ingest_authorization_change(*status);
        }

        let last = last_accepted(&history);
        prop_assert_eq!(engine.authorization(), last);
        prop_assert_eq!(engine.state(), derive_state(last, activity));

        // A fresh engine fed only the final value lands in the same place
        let fresh = Harness::new();
        let mut direct = fresh.engine(EngineConfig::default());
        direct.start();
        direct.set_activity_mode(activity);
        direct.ingest_authorization_change(last);
        prop_assert_eq!(engine.state(), direct.state());
        prop_assert_eq!(h.platform.updating(), fresh.platform.updating());
    }

    #[test]
    fn background_only_under_full_authorization(
        history in prop::collection::vec(any_authorization(), 1..40),
        battery in any::<bool>(),
    ) {
        let h = Harness::new();
        let mut engine = h.engine(EngineConfig::default());
        engine.start();
        engine.set_battery_optimization(battery);
        for status in history {
            engine.ingest_authorization_change(status);
            let running = h.platform.updating();
            match engine.state() {
                EngineState::Active(_) => {
                    let cfg = running.unwrap();
                    prop_assert_eq!(
                        cfg.allow_background,
                        engine.authorization() == AuthorizationState::AuthorizedFull
                    );
                }
                _ => prop_assert!(running.is_none()),
            }
        }
    }

    #[test]
    fn register_then_unregister_is_identity(
        existing in prop::collection::btree_set("[a-z]{1,6}", 0..10),
        id in "[A-Z]{1,6}",
    ) {
        let h = Harness::new();
        let mut engine = h.engine(EngineConfig::default());
        engine.start();
        let center = Coordinate::new(37.7749, -122.4194);
        for e in &existing {
            engine.register_region(RegionRequest::new(e.clone(), center, 100.0), None).unwrap();
        }
        let before = engine.registry().ids();
        h.platform.clear_calls();

        engine.register_region(RegionRequest::new(id.clone(), center, 100.0), None).unwrap();
        engine.unregister_region(&id);

        prop_assert_eq!(engine.registry().ids(), before);
        prop_assert_eq!(h.platform.calls().len(), 2);
    }

    #[test]
    fn capacity_overflow_evicts_exactly_the_oldest(
        capacity in 1usize..25,
        reject in any::<bool>(),
    ) {
        let h = Harness::new();
        let config = EngineConfig {
            region_capacity: capacity,
            eviction: if reject { EvictionPolicy::Reject } else { EvictionPolicy::OldestCreated },
            ..EngineConfig::default()
        };
        let mut engine = h.engine(config);
        engine.start();
        let center = Coordinate::new(37.7749, -122.4194);
        for i in 0..capacity {
            engine.register_region(RegionRequest::new(format!("r{i:02}"), center, 100.0), None).unwrap();
            h.clock.advance_millis(10);
        }

        let result = engine.register_region(RegionRequest::new("extra", center, 100.0), None);
        let ids = engine.registry().ids();
        prop_assert_eq!(ids.len(), capacity);
        if reject {
            prop_assert!(result.is_err());
            prop_assert!(ids.contains(&"r00".to_string()));
            prop_assert!(!ids.contains(&"extra".to_string()));
        } else {
            prop_assert!(result.is_ok());
            prop_assert!(!ids.contains(&"r00".to_string()));
            prop_assert!(ids.contains(&"extra".to_string()));
            for i in 1..capacity {
                let id = format!("r{i:02}");
                prop_assert!(ids.contains(&id));
            }
        }
    }

    #[test]
    fn debouncer_window(t1 in 0u64..1_000_000_000, gap in 0u64..1_000_000) {
        let window = 300_000;
        let d = NotificationDebouncer::new(window);
        prop_assert!(d.should_fire("m", t1));
        prop_assert_eq!(d.should_fire("m", t1 + gap), gap > window);
    }
}

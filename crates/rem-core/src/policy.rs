//! Location update policy: authorization + activity → provider configuration.
//!
//! Table-driven and pure. The default table trades accuracy for battery as
//! the user slows down; background delivery is a platform constraint tied to
//! full authorization and is never a table choice.

use serde::{Deserialize, Serialize};

use crate::activity::ActivityMode;
use crate::authorization::AuthorizationState;

/// Desired accuracy class handed to the platform provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyClass {
    Coarse,
    Medium,
    Fine,
}

impl AccuracyClass {
    /// One step less precise; `Coarse` stays `Coarse`.
    pub fn coarser(self) -> Self {
        match self {
            AccuracyClass::Fine => AccuracyClass::Medium,
            AccuracyClass::Medium | AccuracyClass::Coarse => AccuracyClass::Coarse,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccuracyClass::Coarse => "coarse",
            AccuracyClass::Medium => "medium",
            AccuracyClass::Fine => "fine",
        }
    }
}

/// One row of the policy table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRow {
    pub accuracy: AccuracyClass,
    pub distance_filter_meters: f64,
}

impl PolicyRow {
    pub const fn new(accuracy: AccuracyClass, distance_filter_meters: f64) -> Self {
        Self {
            accuracy,
            distance_filter_meters,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub stationary: PolicyRow,
    pub walking: PolicyRow,
    pub navigating: PolicyRow,
    pub default: PolicyRow,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            stationary: PolicyRow::new(AccuracyClass::Coarse, 100.0),
            walking: PolicyRow::new(AccuracyClass::Medium, 10.0),
            navigating: PolicyRow::new(AccuracyClass::Fine, 5.0),
            default: PolicyRow::new(AccuracyClass::Medium, 20.0),
        }
    }
}

impl PolicyTable {
    pub fn row(&self, mode: ActivityMode) -> PolicyRow {
        match mode {
            ActivityMode::Stationary => self.stationary,
            ActivityMode::Walking => self.walking,
            ActivityMode::Navigating => self.navigating,
            ActivityMode::Default => self.default,
        }
    }
}

/// Configuration the engine hands to `LocationProvider::start_updating`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub accuracy: AccuracyClass,
    pub distance_filter_meters: f64,
    pub allow_background: bool,
    /// Ask for significant-change delivery instead of continuous updates.
    pub significant_changes_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LocationUpdatePolicy {
    table: PolicyTable,
}

impl LocationUpdatePolicy {
    pub fn new(table: PolicyTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    pub fn select(
        &self,
        authorization: AuthorizationState,
        mode: ActivityMode,
        battery_optimization: bool,
    ) -> UpdateConfig {
        let row = self.table.row(mode);
        let allow_background = authorization.allows_background();

        if battery_optimization {
            UpdateConfig {
                accuracy: row.accuracy.coarser(),
                distance_filter_meters: row.distance_filter_meters * 2.0,
                allow_background,
                significant_changes_only: allow_background && mode != ActivityMode::Navigating,
            }
        } else {
            UpdateConfig {
                accuracy: row.accuracy,
                distance_filter_meters: row.distance_filter_meters,
                allow_background,
                significant_changes_only: false,
            }
        }
    }
}

/// `select` against the default table.
pub fn select_update_config(
    authorization: AuthorizationState,
    mode: ActivityMode,
    battery_optimization: bool,
) -> UpdateConfig {
    LocationUpdatePolicy::default().select(authorization, mode, battery_optimization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let full = AuthorizationState::AuthorizedFull;
        let cases = [
            (ActivityMode::Stationary, AccuracyClass::Coarse, 100.0),
            (ActivityMode::Walking, AccuracyClass::Medium, 10.0),
            (ActivityMode::Navigating, AccuracyClass::Fine, 5.0),
            (ActivityMode::Default, AccuracyClass::Medium, 20.0),
        ];
        for (mode, accuracy, filter) in cases {
            let cfg = select_update_config(full, mode, false);
            assert_eq!(cfg.accuracy, accuracy, "{mode}");
            assert_eq!(cfg.distance_filter_meters, filter, "{mode}");
            assert!(cfg.allow_background, "{mode}");
            assert!(!cfg.significant_changes_only);
        }
    }

    #[test]
    fn test_background_never_below_full() {
        for auth in AuthorizationState::ALL {
            for mode in ActivityMode::ALL {
                for battery in [false, true] {
                    let cfg = select_update_config(auth, mode, battery);
                    assert_eq!(cfg.allow_background, auth == AuthorizationState::AuthorizedFull);
                    if !cfg.allow_background {
                        assert!(!cfg.significant_changes_only);
                    }
                }
            }
        }
    }

    #[test]
    fn test_battery_optimization_degrades() {
        let cfg = select_update_config(
            AuthorizationState::AuthorizedFull,
            ActivityMode::Walking,
            true,
        );
        assert_eq!(cfg.accuracy, AccuracyClass::Coarse);
        assert_eq!(cfg.distance_filter_meters, 20.0);
        assert!(cfg.significant_changes_only);

        let nav = select_update_config(
            AuthorizationState::AuthorizedFull,
            ActivityMode::Navigating,
            true,
        );
        assert_eq!(nav.accuracy, AccuracyClass::Medium);
        assert!(!nav.significant_changes_only);
    }

    #[test]
    fn test_custom_table() {
        let mut table = PolicyTable::default();
        table.walking = PolicyRow::new(AccuracyClass::Fine, 3.0);
        let policy = LocationUpdatePolicy::new(table);
        let cfg = policy.select(
            AuthorizationState::AuthorizedLimited,
            ActivityMode::Walking,
            false,
        );
        assert_eq!(cfg.accuracy, AccuracyClass::Fine);
        assert_eq!(cfg.distance_filter_meters, 3.0);
        assert!(!cfg.allow_background);
    }
}

use serde::{Deserialize, Serialize};

/// What the user is doing, as declared by the host application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityMode {
    Stationary,
    Walking,
    Navigating,
    #[default]
    Default,
}

impl ActivityMode {
    pub const ALL: [ActivityMode; 4] = [
        ActivityMode::Stationary,
        ActivityMode::Walking,
        ActivityMode::Navigating,
        ActivityMode::Default,
    ];

    /// Map a free-form activity name onto a mode. Unknown names fall back
    /// to `Default` rather than failing.
    pub fn from_activity_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "stationary" | "still" | "idle" => ActivityMode::Stationary,
            "walking" | "fitness" | "running" => ActivityMode::Walking,
            "navigating" | "navigation" | "driving" | "automotive" => ActivityMode::Navigating,
            _ => ActivityMode::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityMode::Stationary => "stationary",
            ActivityMode::Walking => "walking",
            ActivityMode::Navigating => "navigating",
            ActivityMode::Default => "default",
        }
    }
}

impl std::fmt::Display for ActivityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

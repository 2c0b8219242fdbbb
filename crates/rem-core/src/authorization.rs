use serde::{Deserialize, Serialize};

/// Platform location-permission status.
///
/// `NotDetermined` is only meaningful before the user answers the permission
/// prompt; once a determination has been seen the engine treats later
/// `NotDetermined` reports as stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    #[default]
    NotDetermined,
    Denied,
    Restricted,
    /// While-in-use access.
    AuthorizedLimited,
    /// Always access; the only tier that permits background updates.
    AuthorizedFull,
}

impl AuthorizationState {
    pub const ALL: [AuthorizationState; 5] = [
        AuthorizationState::NotDetermined,
        AuthorizationState::Denied,
        AuthorizationState::Restricted,
        AuthorizationState::AuthorizedLimited,
        AuthorizationState::AuthorizedFull,
    ];

    pub fn is_determined(self) -> bool {
        self != AuthorizationState::NotDetermined
    }

    pub fn is_authorized(self) -> bool {
        matches!(
            self,
            AuthorizationState::AuthorizedLimited | AuthorizationState::AuthorizedFull
        )
    }

    pub fn allows_background(self) -> bool {
        self == AuthorizationState::AuthorizedFull
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthorizationState::NotDetermined => "not_determined",
            AuthorizationState::Denied => "denied",
            AuthorizationState::Restricted => "restricted",
            AuthorizationState::AuthorizedLimited => "authorized_limited",
            AuthorizationState::AuthorizedFull => "authorized_full",
        }
    }
}

impl std::fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier to ask the platform permission flow for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationRequest {
    WhenInUse,
    Always,
}

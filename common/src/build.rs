use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States an app build can be in.
///
/// Transitions form a cycle through the terminal states:
/// `None -> Building -> {Completed, Failed} -> Building -> ...`. A new build
/// may not start while the state is [`BuildState::Building`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Display, EnumString, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BuildState {
    /// No build has ever been recorded for the app
    #[default]
    None,

    /// A builder worker holds the app and is producing an image
    Building,

    /// The last build produced and pushed an image
    Completed,

    /// The last build failed; the app can be rebuilt
    Failed,
}

impl BuildState {
    /// The word reported on the status endpoint. `None` is reported as
    /// `unknown` since nothing is known about an app that never built.
    pub fn status_word(&self) -> &'static str {
        match self {
            Self::None => "unknown",
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn state_deser() {
        assert_eq!(BuildState::Building, BuildState::from_str("builDing").unwrap());
        assert_eq!(BuildState::Failed, BuildState::from_str("failed").unwrap());
        assert_eq!(BuildState::None, BuildState::from_str("None").unwrap());
    }

    #[test]
    fn status_words() {
        assert_eq!(BuildState::None.status_word(), "unknown");
        assert_eq!(BuildState::Completed.status_word(), "completed");
    }
}

//! Risk decision engine.
//!
//! Maps the weakest per-pose similarity plus the attempt's purpose and
//! liveness verdict to ALLOW / STEP_UP / DENY. Using the minimum similarity
//! means a single spoofed or mismatched pose cannot be averaged away by the
//! other two.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the caller intends to do with a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Purpose {
    #[default]
    Login,
    Payment,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Login => "LOGIN",
            Purpose::Payment => "PAYMENT",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOGIN" => Ok(Purpose::Login),
            "PAYMENT" => Ok(Purpose::Payment),
            other => Err(UnknownPurpose(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown purpose: {0:?}")]
pub struct UnknownPurpose(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    StepUp,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::StepUp => "STEP_UP",
            Decision::Deny => "DENY",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALLOW_LOGIN: f32 = 0.80;
const STEP_UP_LOGIN: f32 = 0.70;
// Payment moves money; both tiers sit higher.
const ALLOW_PAYMENT: f32 = 0.83;
const STEP_UP_PAYMENT: f32 = 0.78;

/// Decide from the minimum per-pose similarity.
///
/// Failed liveness downgrades the similarity tier: LOGIN falls to at most
/// STEP_UP (a second factor can still rescue the session), PAYMENT becomes
/// DENY outright. The asymmetry is intended policy.
pub fn decide(min_similarity: f32, purpose: Purpose, liveness_passed: bool) -> Decision {
    let (allow_at, step_up_at) = match purpose {
        Purpose::Login => (ALLOW_LOGIN, STEP_UP_LOGIN),
        Purpose::Payment => (ALLOW_PAYMENT, STEP_UP_PAYMENT),
    };

    let tier = if min_similarity >= allow_at {
        Decision::Allow
    } else if min_similarity >= step_up_at {
        Decision::StepUp
    } else {
        Decision::Deny
    };

    if liveness_passed {
        return tier;
    }

    match purpose {
        Purpose::Login => match tier {
            Decision::Allow => Decision::StepUp,
            other => other,
        },
        Purpose::Payment => Decision::Deny,
    }
}

//! Veriface core — the pure, transport-agnostic half of the verification
//! service.
//!
//! Nothing in this crate performs I/O. The daemon feeds it descriptor bytes,
//! liveness probabilities and a purpose; it answers with normalized
//! descriptors, similarity scores and risk decisions. The [`metrics`] module
//! evaluates the whole pipeline offline from exported audit records.

pub mod codec;
pub mod decision;
pub mod liveness;
pub mod metrics;
pub mod similarity;

pub use codec::{normalize, normalize_text, CodecError, Descriptor, RawDescriptor, DESCRIPTOR_DIM};
pub use decision::{decide, Decision, Purpose};
pub use liveness::{evaluate_enrollment, evaluate_verification, EnrollmentLiveness, LivenessStats};
pub use similarity::{cosine, SimilarityError};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the three head orientations required during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Front,
    Left,
    Right,
}

impl Pose {
    /// All poses, in canonical order. Challenge issuance shuffles a copy.
    pub const ALL: [Pose; 3] = [Pose::Front, Pose::Left, Pose::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pose::Front => "front",
            Pose::Left => "left",
            Pose::Right => "right",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a pose label that is not one of front/left/right.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pose label: {0:?}")]
pub struct UnknownPose(pub String);

impl FromStr for Pose {
    type Err = UnknownPose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Pose::Front),
            "left" => Ok(Pose::Left),
            "right" => Ok(Pose::Right),
            other => Err(UnknownPose(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_roundtrips_through_str() {
        for pose in Pose::ALL {
            assert_eq!(pose.as_str().parse::<Pose>().unwrap(), pose);
        }
    }

    #[test]
    fn unknown_pose_is_rejected() {
        let err = "up".parse::<Pose>().unwrap_err();
        assert_eq!(err, UnknownPose("up".to_string()));
    }
}

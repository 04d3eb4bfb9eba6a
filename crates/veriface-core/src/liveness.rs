//! Presentation-attack (PAD) probability aggregation.
//!
//! The PAD model itself is an external collaborator; this module only turns
//! its per-pose probabilities into pass/fail judgments.
//!
//! Enrollment and verification deliberately use different policies.
//! Enrollment tolerates one weak side pose (the front view is the reliable
//! one and stays mandatory); verification requires every pose to pass a
//! single threshold. The asymmetry is recorded product policy — do not
//! unify the two without sign-off.

use crate::Pose;

/// Minimum PAD probability for the front pose at enrollment.
pub const ENROLL_FRONT_MIN: f32 = 0.50;
/// Minimum PAD probability for each side pose at enrollment.
pub const ENROLL_SIDE_MIN: f32 = 0.25;
/// Default per-pose PAD threshold at verification.
pub const VERIFY_PAD_THRESHOLD: f32 = 0.5;

/// One pose's PAD probability and whether it cleared its threshold.
#[derive(Debug, Clone, Copy)]
pub struct PoseCheck {
    pub pose: Pose,
    pub probability: f32,
    pub passed: bool,
}

/// Outcome of the enrollment liveness gate.
#[derive(Debug, Clone)]
pub struct EnrollmentLiveness {
    pub checks: [PoseCheck; 3],
    pub passed: bool,
}

impl EnrollmentLiveness {
    pub fn probabilities(&self) -> [f32; 3] {
        [
            self.checks[0].probability,
            self.checks[1].probability,
            self.checks[2].probability,
        ]
    }
}

/// Enrollment gate: front ≥ 0.50, each side ≥ 0.25; passes only when at
/// least two poses pass and the front pose is one of them.
pub fn evaluate_enrollment(front: f32, left: f32, right: f32) -> EnrollmentLiveness {
    let checks = [
        PoseCheck {
            pose: Pose::Front,
            probability: front,
            passed: front >= ENROLL_FRONT_MIN,
        },
        PoseCheck {
            pose: Pose::Left,
            probability: left,
            passed: left >= ENROLL_SIDE_MIN,
        },
        PoseCheck {
            pose: Pose::Right,
            probability: right,
            passed: right >= ENROLL_SIDE_MIN,
        },
    ];

    let pass_count = checks.iter().filter(|c| c.passed).count();
    let passed = checks[0].passed && pass_count >= 2;

    EnrollmentLiveness { checks, passed }
}

/// Aggregate PAD statistics over the poses of one verification attempt.
#[derive(Debug, Clone, Copy)]
pub struct LivenessStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// True only when every pose cleared the threshold.
    pub passed: bool,
}

/// Verification gate: every pose must independently clear `threshold`.
///
/// An empty probability list cannot attest liveness and fails.
pub fn evaluate_verification(probs: &[f32], threshold: f32) -> LivenessStats {
    if probs.is_empty() {
        return LivenessStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            passed: false,
        };
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    for &p in probs {
        min = min.min(p);
        max = max.max(p);
        sum += p;
    }

    LivenessStats {
        min,
        max,
        mean: sum / probs.len() as f32,
        passed: probs.iter().all(|&p| p >= threshold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_front_plus_one_side_passes() {
        let r = evaluate_enrollment(0.9, 0.3, 0.1);
        assert!(r.passed);
        assert!(r.checks[0].passed);
        assert!(r.checks[1].passed);
        assert!(!r.checks[2].passed);
    }

    #[test]
    fn enrollment_all_three_pass() {
        assert!(evaluate_enrollment(0.5, 0.25, 0.25).passed);
    }

    #[test]
    fn enrollment_front_alone_fails() {
        // Front passes but only 1 of 3 total — below the 2-pose floor.
        assert!(!evaluate_enrollment(0.95, 0.1, 0.1).passed);
    }

    #[test]
    fn enrollment_failed_front_fails_even_with_both_sides() {
        // Two passing side poses never compensate for a failed front.
        let r = evaluate_enrollment(0.49, 0.9, 0.9);
        assert!(!r.passed);
        assert!(!r.checks[0].passed);
    }

    #[test]
    fn enrollment_report_carries_probabilities() {
        let r = evaluate_enrollment(0.8, 0.6, 0.4);
        assert_eq!(r.probabilities(), [0.8, 0.6, 0.4]);
    }

    #[test]
    fn verification_requires_every_pose() {
        let stats = evaluate_verification(&[0.9, 0.49, 0.8], VERIFY_PAD_THRESHOLD);
        assert!(!stats.passed);
        let stats = evaluate_verification(&[0.9, 0.5, 0.8], VERIFY_PAD_THRESHOLD);
        assert!(stats.passed);
    }

    #[test]
    fn verification_stats_are_min_max_mean() {
        let stats = evaluate_verification(&[0.2, 0.8, 0.5], 0.1);
        assert_eq!(stats.min, 0.2);
        assert_eq!(stats.max, 0.8);
        assert!((stats.mean - 0.5).abs() < 1e-6);
        assert!(stats.passed);
    }

    #[test]
    fn empty_attempt_fails() {
        let stats = evaluate_verification(&[], VERIFY_PAD_THRESHOLD);
        assert!(!stats.passed);
        assert_eq!(stats.mean, 0.0);
    }
}

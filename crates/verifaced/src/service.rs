//! The verification and enrollment flows.
//!
//! This module drives the challenge protocol end to end: consume a
//! challenge, walk the frames in the required order, gate on liveness,
//! match descriptors, decide, audit. Inference is behind the
//! [`DescriptorExtractor`] and [`LivenessModel`] collaborator traits so the
//! whole protocol is testable with stubs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;

use veriface_core::codec::{normalize, CodecError, Descriptor, RawDescriptor, DESCRIPTOR_DIM};
use veriface_core::liveness::{evaluate_enrollment, evaluate_verification, EnrollmentLiveness, LivenessStats};
use veriface_core::metrics::LogProjection;
use veriface_core::similarity::{cosine, SimilarityError};
use veriface_core::{decide, Decision, Pose, Purpose};

use crate::audit::AuditSink;
use crate::challenge::{ChallengeRegistry, IssuedChallenge};
use crate::config::Config;
use crate::rate_limiter::RateLimiter;
use crate::store::{AuditLogEntry, AuthStore, LogDecision, StoreError};

/// Step-up marker returned alongside a STEP_UP decision.
pub const STEP_UP_ACTION: &str = "OTP_REQUIRED";

// ── Collaborator contracts ────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("bad image payload: {0}")]
    BadImageDecode(String),
}

/// Face embedding collaborator: one image in, one descriptor out.
pub trait DescriptorExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Descriptor, ExtractError>;
}

/// PAD collaborator. Never fails; a conservative implementation returns a
/// low probability on images it cannot judge.
pub trait LivenessModel: Send + Sync {
    fn predict(&self, image: &[u8]) -> f32;
}

/// Called only after an ALLOW decision.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, subject: &str) -> String;
}

// ── Request / response types ──────────────────────────────────────────────────

/// One captured frame, labeled with the pose the client claims it shows.
#[derive(Debug, Clone)]
pub struct PoseFrame {
    pub pose: Pose,
    pub image: Vec<u8>,
}

/// Transport-supplied request metadata, recorded in the audit trail.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub device_info: Option<String>,
    pub geo: Option<String>,
}

/// Result of a completed verification attempt. STEP_UP and DENY are normal
/// outcomes here, not errors.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub decision: Decision,
    pub purpose: Purpose,
    /// Weakest pose gates the decision.
    pub similarity_min: f32,
    /// Per-pose similarities in required-order.
    pub similarities: Vec<f32>,
    pub liveness: LivenessStats,
    pub token: Option<String>,
    pub step_up: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub user_id: i64,
    pub status: &'static str,
}

/// Enrollment input: exactly one image per pose, by construction.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub front: Vec<u8>,
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("invalid or expired challenge")]
    InvalidChallenge,
    #[error("user {0} has no complete pose enrollment")]
    NotEnrolled(i64),
    #[error("expected {expected} frames, got {got}")]
    FrameCountMismatch { expected: usize, got: usize },
    #[error("wrong pose order: expected {expected}, got {got}")]
    PoseOrderMismatch { expected: Pose, got: Pose },
    #[error("frame {pose}: {source}")]
    Frame {
        pose: Pose,
        #[source]
        source: ExtractError,
    },
    #[error("stored descriptor for pose {pose}: {source}")]
    StoredDescriptor {
        pose: Pose,
        #[source]
        source: CodecError,
    },
    #[error("no user matches the supplied credential")]
    UnknownCredential,
    #[error("rate limited; retry in {retry_secs}s")]
    RateLimited { retry_secs: u64 },
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("enrollment liveness rejected")]
    LivenessRejected(EnrollmentLiveness),
    #[error("pose {pose}: {source}")]
    Frame {
        pose: Pose,
        #[source]
        source: ExtractError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct VerifyService<E, L, T> {
    store: AuthStore,
    audit: AuditSink,
    challenges: Arc<ChallengeRegistry>,
    rate_limiter: Mutex<RateLimiter>,
    extractor: E,
    liveness: L,
    tokens: T,
    pad_threshold: f32,
    model_version: String,
}

impl<E, L, T> VerifyService<E, L, T>
where
    E: DescriptorExtractor,
    L: LivenessModel,
    T: TokenIssuer,
{
    pub fn new(
        store: AuthStore,
        challenges: Arc<ChallengeRegistry>,
        extractor: E,
        liveness: L,
        tokens: T,
        config: &Config,
    ) -> Self {
        Self {
            audit: AuditSink::new(store.clone()),
            store,
            challenges,
            rate_limiter: Mutex::new(RateLimiter::new()),
            extractor,
            liveness,
            tokens,
            pad_threshold: config.pad_threshold,
            model_version: config.model_version.clone(),
        }
    }

    /// Begin a verification attempt: returns the challenge identifier and
    /// the pose order the client must present.
    pub async fn start_verification(
        &self,
        user_id: i64,
        purpose: Purpose,
    ) -> Result<IssuedChallenge, VerifyError> {
        self.rate_limiter
            .lock()
            .await
            .check(user_id)
            .map_err(|retry_secs| {
                tracing::warn!(user_id, retry_secs, "verification rate limited");
                VerifyError::RateLimited { retry_secs }
            })?;

        let issued = self.challenges.issue(user_id, purpose);
        tracing::info!(user_id, %purpose, challenge_id = %issued.challenge_id, "verification started");
        Ok(issued)
    }

    /// [`start_verification`](Self::start_verification) for callers that hold
    /// a phone number or email instead of a user id.
    pub async fn start_verification_by_credential(
        &self,
        credential: &str,
        purpose: Purpose,
    ) -> Result<IssuedChallenge, VerifyError> {
        let user_id = self
            .store
            .lookup_user_by_credential(credential)
            .await?
            .ok_or(VerifyError::UnknownCredential)?;
        self.start_verification(user_id, purpose).await
    }

    /// Submit the captured frames for a pending challenge.
    pub async fn submit_verification(
        &self,
        challenge_id: &str,
        frames: &[PoseFrame],
        meta: &ClientMeta,
    ) -> Result<VerifyOutcome, VerifyError> {
        let started = Instant::now();

        // Consumed before any evaluation: a raced duplicate submit must see
        // InvalidChallenge, whatever this call ends up returning.
        let challenge = self
            .challenges
            .take(challenge_id)
            .ok_or(VerifyError::InvalidChallenge)?;

        let enrolled = self.load_enrolled(challenge.user_id).await?;

        if frames.len() != challenge.order.len() {
            return Err(VerifyError::FrameCountMismatch {
                expected: challenge.order.len(),
                got: frames.len(),
            });
        }

        let mut pad_probs: Vec<f32> = Vec::with_capacity(frames.len());
        let mut similarities: Vec<f32> = Vec::with_capacity(frames.len());

        for (expected, frame) in challenge.order.iter().zip(frames) {
            if frame.pose != *expected {
                tracing::warn!(
                    user_id = challenge.user_id,
                    expected = %expected,
                    got = %frame.pose,
                    "pose order mismatch — aborting attempt"
                );
                return Err(VerifyError::PoseOrderMismatch {
                    expected: *expected,
                    got: frame.pose,
                });
            }

            let prob = self.liveness.predict(&frame.image).clamp(0.0, 1.0);
            pad_probs.push(prob);

            let probe = match self.extractor.extract(&frame.image) {
                Ok(d) => d,
                Err(source) => {
                    if matches!(source, ExtractError::NoFaceDetected) {
                        // Partial record: a frame with no face mid-attempt has
                        // forensic value.
                        self.audit
                            .record(self.partial_entry(&challenge.user_id, challenge.purpose, &pad_probs, meta, started))
                            .await;
                    }
                    return Err(VerifyError::Frame {
                        pose: *expected,
                        source,
                    });
                }
            };

            let sim = cosine(&probe, &enrolled[expected])?;
            similarities.push(sim);
        }

        let stats = evaluate_verification(&pad_probs, self.pad_threshold);
        let similarity_min = similarities.iter().copied().fold(f32::INFINITY, f32::min);
        let decision = decide(similarity_min, challenge.purpose, stats.passed);

        {
            let mut limiter = self.rate_limiter.lock().await;
            match decision {
                Decision::Allow => limiter.record_allow(challenge.user_id),
                Decision::Deny => limiter.record_denial(challenge.user_id),
                Decision::StepUp => {}
            }
        }

        let token = (decision == Decision::Allow)
            .then(|| self.tokens.issue(&challenge.user_id.to_string()));
        let step_up = (decision == Decision::StepUp).then_some(STEP_UP_ACTION);

        self.audit
            .record(AuditLogEntry {
                user_id: Some(challenge.user_id),
                similarity: Some(similarity_min as f64),
                decision: LogDecision::from(decision),
                pad_result: Some(if stats.passed { "PASS" } else { "FAIL" }.to_string()),
                purpose: Some(challenge.purpose.as_str().to_string()),
                ip: meta.ip.clone(),
                device_info: meta.device_info.clone(),
                geo: meta.geo.clone(),
                pad_prob_min: Some(stats.min as f64),
                pad_prob_max: Some(stats.max as f64),
                pad_prob_avg: Some(stats.mean as f64),
                pad_passed: Some(stats.passed),
                duration_ms: Some(started.elapsed().as_millis() as i64),
                at: chrono::Utc::now().timestamp(),
                ..Default::default()
            })
            .await;

        tracing::info!(
            user_id = challenge.user_id,
            purpose = %challenge.purpose,
            decision = %decision,
            similarity_min,
            liveness_passed = stats.passed,
            "verification complete"
        );

        Ok(VerifyOutcome {
            decision,
            purpose: challenge.purpose,
            similarity_min,
            similarities,
            liveness: stats,
            token,
            step_up,
        })
    }

    /// Register a new identity from three labeled pose images.
    ///
    /// The liveness gate runs before any descriptor extraction: a failed
    /// gate costs no inference and creates no user row.
    pub async fn enroll(
        &self,
        request: &EnrollRequest,
        meta: &ClientMeta,
    ) -> Result<EnrollOutcome, EnrollError> {
        let started = Instant::now();

        let front_prob = self.liveness.predict(&request.front).clamp(0.0, 1.0);
        let left_prob = self.liveness.predict(&request.left).clamp(0.0, 1.0);
        let right_prob = self.liveness.predict(&request.right).clamp(0.0, 1.0);

        let gate = evaluate_enrollment(front_prob, left_prob, right_prob);
        if !gate.passed {
            tracing::warn!(
                front = front_prob,
                left = left_prob,
                right = right_prob,
                "enrollment liveness rejected"
            );
            return Err(EnrollError::LivenessRejected(gate));
        }

        let mut descriptors: HashMap<Pose, Descriptor> = HashMap::new();
        for (pose, image) in [
            (Pose::Front, &request.front),
            (Pose::Left, &request.left),
            (Pose::Right, &request.right),
        ] {
            let d = self
                .extractor
                .extract(image)
                .map_err(|source| EnrollError::Frame { pose, source })?;
            descriptors.insert(pose, d);
        }

        let user_id = self
            .store
            .create_user(request.phone.clone(), request.email.clone())
            .await?;

        for pose in Pose::ALL {
            self.store
                .save_pose_embedding(user_id, pose, &descriptors[&pose], &self.model_version)
                .await?;
        }

        let mean = mean_descriptor(&descriptors)?;
        self.store
            .save_mean_embedding(user_id, &mean, &self.model_version)
            .await?;

        let probs = gate.probabilities();
        self.audit
            .record(AuditLogEntry {
                user_id: Some(user_id),
                decision: LogDecision::Enroll,
                pad_result: Some("PASS".to_string()),
                purpose: Some("ENROLL".to_string()),
                ip: meta.ip.clone(),
                device_info: meta.device_info.clone(),
                geo: meta.geo.clone(),
                pad_prob_min: Some(probs.iter().copied().fold(f32::INFINITY, f32::min) as f64),
                pad_prob_max: Some(probs.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64),
                pad_prob_avg: Some((probs.iter().sum::<f32>() / probs.len() as f32) as f64),
                pad_passed: Some(true),
                duration_ms: Some(started.elapsed().as_millis() as i64),
                at: chrono::Utc::now().timestamp(),
                ..Default::default()
            })
            .await;

        tracing::info!(user_id, "enrolled");
        Ok(EnrollOutcome {
            user_id,
            status: "Registered",
        })
    }

    /// Audit-log projection for offline evaluation.
    pub async fn export_metrics(
        &self,
        t0: Option<i64>,
        t1: Option<i64>,
    ) -> Result<Vec<LogProjection>, StoreError> {
        self.store.export_logs(t0, t1).await
    }

    async fn load_enrolled(&self, user_id: i64) -> Result<HashMap<Pose, Descriptor>, VerifyError> {
        let blobs = self.store.get_pose_embeddings(user_id).await?;
        let mut out = HashMap::with_capacity(3);
        for pose in Pose::ALL {
            let blob = blobs.get(&pose).ok_or(VerifyError::NotEnrolled(user_id))?;
            let descriptor = normalize(RawDescriptor::Bytes(blob.clone()))
                .map_err(|source| VerifyError::StoredDescriptor { pose, source })?;
            out.insert(pose, descriptor);
        }
        Ok(out)
    }

    fn partial_entry(
        &self,
        user_id: &i64,
        purpose: Purpose,
        pad_probs: &[f32],
        meta: &ClientMeta,
        started: Instant,
    ) -> AuditLogEntry {
        let stats =
            (!pad_probs.is_empty()).then(|| evaluate_verification(pad_probs, self.pad_threshold));
        AuditLogEntry {
            user_id: Some(*user_id),
            decision: LogDecision::Deny,
            purpose: Some(purpose.as_str().to_string()),
            ip: meta.ip.clone(),
            device_info: meta.device_info.clone(),
            geo: meta.geo.clone(),
            pad_prob_min: stats.map(|s| s.min as f64),
            pad_prob_max: stats.map(|s| s.max as f64),
            pad_prob_avg: stats.map(|s| s.mean as f64),
            duration_ms: Some(started.elapsed().as_millis() as i64),
            at: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }
}

fn mean_descriptor(descriptors: &HashMap<Pose, Descriptor>) -> Result<Descriptor, CodecError> {
    let mut mean = vec![0.0f32; DESCRIPTOR_DIM];
    for d in descriptors.values() {
        for (acc, v) in mean.iter_mut().zip(d.values()) {
            *acc += v;
        }
    }
    let n = descriptors.len() as f32;
    for v in &mut mean {
        *v /= n;
    }
    Descriptor::new(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn basis() -> Descriptor {
        let mut values = vec![0.0f32; DESCRIPTOR_DIM];
        values[0] = 1.0;
        Descriptor::new(values).unwrap()
    }

    /// Unit vector whose cosine against `basis()` is `c`.
    fn probe(c: f32) -> Descriptor {
        let mut values = vec![0.0f32; DESCRIPTOR_DIM];
        values[0] = c;
        values[1] = (1.0 - c * c).max(0.0).sqrt();
        Descriptor::new(values).unwrap()
    }

    #[derive(Default)]
    struct StubExtractor {
        queue: StdMutex<VecDeque<Result<Descriptor, ExtractError>>>,
        calls: AtomicUsize,
    }

    impl StubExtractor {
        fn queued(results: Vec<Result<Descriptor, ExtractError>>) -> Self {
            Self {
                queue: StdMutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DescriptorExtractor for StubExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Descriptor, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(basis()))
        }
    }

    struct StubLiveness {
        default_prob: f32,
        queue: StdMutex<VecDeque<f32>>,
        calls: AtomicUsize,
    }

    impl StubLiveness {
        fn constant(p: f32) -> Self {
            Self {
                default_prob: p,
                queue: StdMutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn queued(p: f32, probs: Vec<f32>) -> Self {
            Self {
                default_prob: p,
                queue: StdMutex::new(probs.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LivenessModel for StubLiveness {
        fn predict(&self, _image: &[u8]) -> f32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.default_prob)
        }
    }

    #[derive(Default)]
    struct StubTokens {
        calls: AtomicUsize,
    }

    impl TokenIssuer for StubTokens {
        fn issue(&self, subject: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("token-{subject}")
        }
    }

    fn test_config() -> Config {
        Config {
            db_path: Path::new(":memory:").to_path_buf(),
            pad_threshold: 0.5,
            challenge_ttl_secs: 120,
            sweep_interval_secs: 30,
            model_version: "sface-128".to_string(),
        }
    }

    type StubService = VerifyService<StubExtractor, StubLiveness, StubTokens>;

    async fn service(extractor: StubExtractor, liveness: StubLiveness) -> (StubService, AuthStore) {
        let store = AuthStore::open(Path::new(":memory:")).await.unwrap();
        let challenges = Arc::new(ChallengeRegistry::new(Duration::from_secs(120)));
        let svc = VerifyService::new(
            store.clone(),
            challenges,
            extractor,
            liveness,
            StubTokens::default(),
            &test_config(),
        );
        (svc, store)
    }

    async fn enroll_basis_user(store: &AuthStore) -> i64 {
        let user = store.create_user(None, None).await.unwrap();
        for pose in Pose::ALL {
            store
                .save_pose_embedding(user, pose, &basis(), "sface-128")
                .await
                .unwrap();
        }
        user
    }

    fn frames_in_order(order: [Pose; 3]) -> Vec<PoseFrame> {
        order
            .iter()
            .map(|&pose| PoseFrame {
                pose,
                image: vec![0u8; 4],
            })
            .collect()
    }

    #[tokio::test]
    async fn allow_flow_issues_token_and_audits() {
        let extractor = StubExtractor::queued(vec![Ok(probe(0.9)), Ok(probe(0.85)), Ok(probe(0.95))]);
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let outcome = svc
            .submit_verification(
                &issued.challenge_id,
                &frames_in_order(issued.required_order),
                &ClientMeta::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.token.as_deref(), Some(format!("token-{user}").as_str()));
        assert!(outcome.step_up.is_none());
        assert_eq!(outcome.similarities.len(), 3);
        // Weakest pose is the aggregate.
        assert!((outcome.similarity_min - 0.85).abs() < 1e-3);
        assert!(outcome.liveness.passed);

        let rows = store.export_logs(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision.as_deref(), Some("ALLOW"));
        assert_eq!(rows[0].purpose.as_deref(), Some("LOGIN"));
        assert!(rows[0].pad_ok == Some(1));
    }

    #[tokio::test]
    async fn mid_similarity_steps_up_without_token() {
        let extractor = StubExtractor::queued(vec![Ok(probe(0.75)), Ok(probe(0.75)), Ok(probe(0.75))]);
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let outcome = svc
            .submit_verification(
                &issued.challenge_id,
                &frames_in_order(issued.required_order),
                &ClientMeta::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision, Decision::StepUp);
        assert!(outcome.token.is_none());
        assert_eq!(outcome.step_up, Some(STEP_UP_ACTION));
    }

    #[tokio::test]
    async fn failed_liveness_denies_payment_but_steps_up_login() {
        for (purpose, expected) in [
            (Purpose::Payment, Decision::Deny),
            (Purpose::Login, Decision::StepUp),
        ] {
            let extractor =
                StubExtractor::queued(vec![Ok(probe(0.9)), Ok(probe(0.9)), Ok(probe(0.9))]);
            // Second pose fails the PAD threshold.
            let liveness = StubLiveness::queued(0.9, vec![0.9, 0.4, 0.9]);
            let (svc, store) = service(extractor, liveness).await;
            let user = enroll_basis_user(&store).await;

            let issued = svc.start_verification(user, purpose).await.unwrap();
            let outcome = svc
                .submit_verification(
                    &issued.challenge_id,
                    &frames_in_order(issued.required_order),
                    &ClientMeta::default(),
                )
                .await
                .unwrap();

            assert_eq!(outcome.decision, expected, "purpose {purpose}");
            assert!(!outcome.liveness.passed);
            assert!(outcome.token.is_none());
        }
    }

    #[tokio::test]
    async fn challenge_is_single_use() {
        let extractor = StubExtractor::default();
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let frames = frames_in_order(issued.required_order);

        svc.submit_verification(&issued.challenge_id, &frames, &ClientMeta::default())
            .await
            .unwrap();
        let err = svc
            .submit_verification(&issued.challenge_id, &frames, &ClientMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidChallenge));
    }

    #[tokio::test]
    async fn frame_count_mismatch_is_rejected() {
        let (svc, store) = service(StubExtractor::default(), StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let mut frames = frames_in_order(issued.required_order);
        frames.pop();

        let err = svc
            .submit_verification(&issued.challenge_id, &frames, &ClientMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::FrameCountMismatch {
                expected: 3,
                got: 2
            }
        ));
    }

    #[tokio::test]
    async fn wrong_pose_order_stops_before_any_inference() {
        let extractor = StubExtractor::default();
        let liveness = StubLiveness::constant(0.9);
        let (svc, store) = service(extractor, liveness).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let mut frames = frames_in_order(issued.required_order);
        // Swap the first two frames so frame 0 carries the wrong label.
        frames.swap(0, 1);

        let err = svc
            .submit_verification(&issued.challenge_id, &frames, &ClientMeta::default())
            .await
            .unwrap_err();

        let VerifyError::PoseOrderMismatch { expected, got } = err else {
            panic!("expected PoseOrderMismatch, got {err:?}");
        };
        assert_eq!(expected, issued.required_order[0]);
        assert_eq!(got, issued.required_order[1]);
        // No collaborator ran: the attempt died at the first out-of-order frame.
        assert_eq!(svc.extractor.calls(), 0);
        assert_eq!(svc.liveness.calls(), 0);
    }

    #[tokio::test]
    async fn incomplete_enrollment_is_not_enrolled() {
        let (svc, store) = service(StubExtractor::default(), StubLiveness::constant(0.9)).await;
        let user = store.create_user(None, None).await.unwrap();
        store
            .save_pose_embedding(user, Pose::Front, &basis(), "sface-128")
            .await
            .unwrap();
        store
            .save_pose_embedding(user, Pose::Left, &basis(), "sface-128")
            .await
            .unwrap();

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        let err = svc
            .submit_verification(
                &issued.challenge_id,
                &frames_in_order(issued.required_order),
                &ClientMeta::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::NotEnrolled(id) if id == user));
    }

    #[tokio::test]
    async fn no_face_writes_a_partial_audit_record() {
        let extractor = StubExtractor::queued(vec![Err(ExtractError::NoFaceDetected)]);
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Payment).await.unwrap();
        let err = svc
            .submit_verification(
                &issued.challenge_id,
                &frames_in_order(issued.required_order),
                &ClientMeta::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Frame {
                source: ExtractError::NoFaceDetected,
                ..
            }
        ));

        let rows = store.export_logs(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision.as_deref(), Some("DENY"));
        assert_eq!(rows[0].sim, None);
        // The one PAD probability observed before the failure is preserved.
        assert_eq!(rows[0].pad_prob, Some(0.9f32 as f64));
    }

    #[tokio::test]
    async fn repeated_denials_trip_the_rate_limit() {
        let (svc, store) = service(StubExtractor::default(), StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        for _ in 0..5 {
            let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
            // Probe far from the enrolled descriptor: certain DENY.
            svc.extractor
                .queue
                .lock()
                .unwrap()
                .extend([Ok(probe(0.1)), Ok(probe(0.1)), Ok(probe(0.1))]);
            let outcome = svc
                .submit_verification(
                    &issued.challenge_id,
                    &frames_in_order(issued.required_order),
                    &ClientMeta::default(),
                )
                .await
                .unwrap();
            assert_eq!(outcome.decision, Decision::Deny);
        }

        let err = svc.start_verification(user, Purpose::Login).await.unwrap_err();
        assert!(matches!(err, VerifyError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn enroll_persists_poses_mean_and_audit() {
        let extractor = StubExtractor::queued(vec![
            Ok(probe(1.0)),
            Ok(probe(0.8)),
            Ok(probe(0.6)),
        ]);
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;

        let outcome = svc
            .enroll(
                &EnrollRequest {
                    front: vec![1],
                    left: vec![2],
                    right: vec![3],
                    phone: Some("555-0102".into()),
                    email: None,
                },
                &ClientMeta::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, "Registered");
        assert_eq!(store.count_users().await.unwrap(), 1);
        assert_eq!(
            store.lookup_user_by_credential("555-0102").await.unwrap(),
            Some(outcome.user_id)
        );

        let blobs = store.get_pose_embeddings(outcome.user_id).await.unwrap();
        assert_eq!(blobs.len(), 3);
        assert!(store
            .get_mean_embedding(outcome.user_id)
            .await
            .unwrap()
            .is_some());

        let rows = store.export_logs(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision.as_deref(), Some("ENROLL"));
        assert_eq!(rows[0].purpose.as_deref(), Some("ENROLL"));
    }

    #[tokio::test]
    async fn enroll_liveness_gate_runs_before_extraction() {
        let extractor = StubExtractor::default();
        // Front below 0.50 fails the gate no matter the sides.
        let liveness = StubLiveness::queued(0.9, vec![0.3, 0.9, 0.9]);
        let (svc, store) = service(extractor, liveness).await;

        let err = svc
            .enroll(
                &EnrollRequest {
                    front: vec![1],
                    left: vec![2],
                    right: vec![3],
                    phone: None,
                    email: None,
                },
                &ClientMeta::default(),
            )
            .await
            .unwrap_err();

        let EnrollError::LivenessRejected(gate) = err else {
            panic!("expected LivenessRejected");
        };
        assert!(!gate.passed);
        assert_eq!(svc.extractor.calls(), 0);
        assert_eq!(store.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credential_start_resolves_phone_and_email() {
        let (svc, store) = service(StubExtractor::default(), StubLiveness::constant(0.9)).await;
        let user = store
            .create_user(Some("555-0199".into()), Some("a@example.com".into()))
            .await
            .unwrap();

        let issued = svc
            .start_verification_by_credential("a@example.com", Purpose::Login)
            .await
            .unwrap();
        assert_eq!(svc.challenges.take(&issued.challenge_id).unwrap().user_id, user);

        let err = svc
            .start_verification_by_credential("nobody@example.com", Purpose::Login)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::UnknownCredential));
    }

    #[tokio::test]
    async fn export_metrics_projects_the_audit_log() {
        let extractor = StubExtractor::default();
        let (svc, store) = service(extractor, StubLiveness::constant(0.9)).await;
        let user = enroll_basis_user(&store).await;

        let issued = svc.start_verification(user, Purpose::Login).await.unwrap();
        svc.submit_verification(
            &issued.challenge_id,
            &frames_in_order(issued.required_order),
            &ClientMeta::default(),
        )
        .await
        .unwrap();

        let rows = svc.export_metrics(None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].sim.is_some());
    }

    #[test]
    fn mean_descriptor_averages_elementwise() {
        let mut map = HashMap::new();
        map.insert(Pose::Front, probe(1.0));
        map.insert(Pose::Left, probe(0.0));
        map.insert(Pose::Right, probe(0.5));
        let mean = mean_descriptor(&map).unwrap();
        assert!((mean.values()[0] - 0.5).abs() < 1e-6);
    }
}

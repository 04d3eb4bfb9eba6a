//! Offline error-rate evaluation over exported audit records.
//!
//! Only records carrying a ground-truth bona-fide/attack label participate;
//! production traffic without labels is ignored. Every metric whose
//! denominator set is empty is reported as `None`, never as zero.

use serde::{Deserialize, Serialize};

/// Number of evenly spaced thresholds swept for the EER search.
const EER_SWEEP_STEPS: usize = 400;

/// Default PAD probability threshold when no pass flag was logged.
pub const DEFAULT_PAD_THRESHOLD: f64 = 0.85;

/// Wire projection of one audit row, as produced by the export operation.
/// Field names match the historical export format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogProjection {
    pub sim: Option<f64>,
    /// 1 = bona-fide presentation, 0 = attack, absent = unlabeled.
    pub bona: Option<i64>,
    pub pad_prob: Option<f64>,
    /// Logged PAD verdict (1/0), preferred over re-thresholding `pad_prob`.
    pub pad_ok: Option<i64>,
    pub decision: Option<String>,
    pub purpose: Option<String>,
    pub atk: Option<String>,
    pub dur_ms: Option<i64>,
    pub at: Option<i64>,
}

impl LogProjection {
    pub fn labeled(&self) -> LabeledRecord {
        LabeledRecord {
            similarity: self.sim,
            bona_fide: self.bona.map(|b| b != 0),
            pad_prob: self.pad_prob,
            pad_passed: self.pad_ok.map(|p| p != 0),
        }
    }
}

/// Export envelope: `{count, items}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExport {
    pub count: usize,
    pub items: Vec<LogProjection>,
}

/// Normalized view of one record for metric computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabeledRecord {
    pub similarity: Option<f64>,
    pub bona_fide: Option<bool>,
    pub pad_prob: Option<f64>,
    pub pad_passed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EerReport {
    /// Mean of FAR and FRR at the best threshold.
    pub eer: f64,
    /// The threshold where |FAR − FRR| is smallest.
    pub threshold: f64,
}

/// Equal error rate of the similarity matcher.
///
/// Sweeps [`EER_SWEEP_STEPS`] thresholds between the minimum and maximum
/// observed similarity. FAR is the fraction of attack records at or above a
/// threshold, FRR the fraction of bona-fide records below it; a class with
/// no records contributes a rate of zero.
pub fn equal_error_rate(records: &[LabeledRecord]) -> Option<EerReport> {
    let rows: Vec<(f64, bool)> = records
        .iter()
        .filter_map(|r| Some((r.similarity?, r.bona_fide?)))
        .collect();
    if rows.is_empty() {
        return None;
    }

    let mut sim_min = f64::INFINITY;
    let mut sim_max = f64::NEG_INFINITY;
    for &(sim, _) in &rows {
        sim_min = sim_min.min(sim);
        sim_max = sim_max.max(sim);
    }

    let attack_total = rows.iter().filter(|(_, bona)| !bona).count();
    let bona_total = rows.len() - attack_total;

    let mut best: Option<EerReport> = None;
    let mut best_gap = f64::INFINITY;
    for step in 0..EER_SWEEP_STEPS {
        let t = sim_min + (sim_max - sim_min) * step as f64 / (EER_SWEEP_STEPS - 1) as f64;

        let far = if attack_total > 0 {
            let accepts = rows.iter().filter(|(s, bona)| !bona && *s >= t).count();
            accepts as f64 / attack_total as f64
        } else {
            0.0
        };
        let frr = if bona_total > 0 {
            let rejects = rows.iter().filter(|(s, bona)| *bona && *s < t).count();
            rejects as f64 / bona_total as f64
        } else {
            0.0
        };

        let gap = (far - frr).abs();
        if gap < best_gap {
            best_gap = gap;
            best = Some(EerReport {
                eer: (far + frr) / 2.0,
                threshold: t,
            });
        }
    }

    best
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PadReport {
    /// Fraction of attack presentations misclassified as live.
    pub apcer: Option<f64>,
    /// Fraction of bona-fide presentations misclassified as spoof.
    pub bpcer: Option<f64>,
    /// Mean of APCER and BPCER; absent when either side is.
    pub acer: Option<f64>,
}

/// APCER / BPCER / ACER for the PAD stage.
///
/// Uses the logged pass flag when present, otherwise thresholds the logged
/// probability at `pad_threshold`.
pub fn pad_error_rates(records: &[LabeledRecord], pad_threshold: f64) -> PadReport {
    let mut attack_total = 0usize;
    let mut attack_live = 0usize;
    let mut bona_total = 0usize;
    let mut bona_spoof = 0usize;

    for r in records {
        let (Some(bona), Some(prob)) = (r.bona_fide, r.pad_prob) else {
            continue;
        };
        let predicted_live = match r.pad_passed {
            Some(flag) => flag,
            None => prob >= pad_threshold,
        };
        if bona {
            bona_total += 1;
            if !predicted_live {
                bona_spoof += 1;
            }
        } else {
            attack_total += 1;
            if predicted_live {
                attack_live += 1;
            }
        }
    }

    let apcer = (attack_total > 0).then(|| attack_live as f64 / attack_total as f64);
    let bpcer = (bona_total > 0).then(|| bona_spoof as f64 / bona_total as f64);
    let acer = match (apcer, bpcer) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        _ => None,
    };

    PadReport { apcer, bpcer, acer }
}

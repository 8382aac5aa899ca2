//! Pixel-level precision-recall analysis and F1-optimal threshold search.

/// Precision-recall curve over distinct score thresholds.
///
/// `thresholds` is ascending; `precision[i]` and `recall[i]` describe the
/// prediction `score >= thresholds[i]`. The arrays carry one extra trailing
/// point with precision 1 and recall 0 (nothing predicted positive).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f32>,
}

/// Outcome of the F1 search.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThresholdChoice {
    pub threshold: f32,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
}

/// Precision-recall curve of binary `labels` against `scores`.
///
/// Returns `None` when the inputs are empty, differ in length, or contain no
/// positive label (recall is undefined).
pub fn precision_recall_curve(labels: &[bool], scores: &[f32]) -> Option<PrCurve> {
    if labels.is_empty() || labels.len() != scores.len() {
        return None;
    }
    let total_pos = labels.iter().filter(|&&l| l).count();
    if total_pos == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_unstable_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    // Sweep from the highest score down; emit a point at the last index of
    // every run of equal scores.
    let mut precision = Vec::new();
    let mut recall = Vec::new();
    let mut thresholds = Vec::new();
    let mut tp = 0usize;
    let mut fp = 0usize;
    for (k, &i) in order.iter().enumerate() {
        if labels[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_run = order
            .get(k + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_run {
            precision.push(tp as f64 / (tp + fp) as f64);
            recall.push(tp as f64 / total_pos as f64);
            thresholds.push(scores[i]);
            if tp == total_pos {
                // Lower thresholds only add false positives.
                break;
            }
        }
    }

    precision.reverse();
    recall.reverse();
    thresholds.reverse();
    precision.push(1.0);
    recall.push(0.0);
    Some(PrCurve {
        precision,
        recall,
        thresholds,
    })
}

/// F1 score, 0 where precision and recall are both 0.
pub fn f1(precision: f64, recall: f64) -> f64 {
    let denom = precision + recall;
    if denom > 0.0 {
        2.0 * precision * recall / denom
    } else {
        0.0
    }
}

/// Threshold maximizing pixel-level F1; ties go to the lowest threshold.
pub fn optimal_f1_threshold(labels: &[bool], scores: &[f32]) -> Option<ThresholdChoice> {
    let curve = precision_recall_curve(labels, scores)?;
    let mut best: Option<ThresholdChoice> = None;
    for (i, &t) in curve.thresholds.iter().enumerate() {
        let p = curve.precision[i];
        let r = curve.recall[i];
        let score = f1(p, r);
        if best.map_or(true, |b| score > b.f1) {
            best = Some(ThresholdChoice {
                threshold: t,
                f1: score,
                precision: p,
                recall: r,
            });
        }
    }
    best
}

/// Precision, recall and F1 of the prediction `score > threshold`.
///
/// Returns `None` under the same conditions as [`precision_recall_curve`].
/// With no positive prediction precision is taken as 1.
pub fn precision_recall_at(labels: &[bool], scores: &[f32], threshold: f32) -> Option<ThresholdChoice> {
    if labels.is_empty() || labels.len() != scores.len() {
        return None;
    }
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&label, &score) in labels.iter().zip(scores) {
        match (label, score > threshold) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }
    if tp + fn_ == 0 {
        return None;
    }
    let precision = if tp + fp == 0 {
        1.0
    } else {
        tp as f64 / (tp + fp) as f64
    };
    let recall = tp as f64 / (tp + fn_) as f64;
    Some(ThresholdChoice {
        threshold,
        f1: f1(precision, recall),
        precision,
        recall,
    })
}

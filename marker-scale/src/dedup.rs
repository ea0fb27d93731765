use crate::candidate::{rank, Candidate};

/// Greedy non-maximum suppression. Candidates are visited by descending score (ties in
/// input order) and kept only while their IoU with every kept box stays below
/// `iou_threshold`.
pub fn suppress_overlaps(candidates: &[Candidate], iou_threshold: f64) -> Vec<Candidate> {
    let mut ordered = candidates.to_vec();
    rank(&mut ordered);

    let mut kept: Vec<Candidate> = Vec::with_capacity(ordered.len());
    for candidate in ordered {
        let region = candidate.region();
        if kept.iter().all(|k| k.region().iou(&region) < iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

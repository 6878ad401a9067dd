use crate::detect::result::RawDetection;

/// Label-keyed greedy non-max suppression.
///
/// Detections are visited by confidence (highest first, input order on
/// ties); one is kept unless an already-kept detection with the same label
/// overlaps it by more than `iou_threshold`.
pub fn nms_by_label(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.label == det.label && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    #[test]
    fn overlapping_same_label_keeps_most_confident() {
        let a = RawDetection::new("ring", BBox::new(0.0, 0.0, 10.0, 10.0), 0.6);
        let b = RawDetection::new("ring", BBox::new(1.0, 0.0, 11.0, 10.0), 0.9);
        let kept = nms_by_label(vec![a, b], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn different_labels_never_suppress_each_other() {
        let a = RawDetection::new("ring", BBox::new(0.0, 0.0, 10.0, 10.0), 0.6);
        let b = RawDetection::new("watch", BBox::new(0.0, 0.0, 10.0, 10.0), 0.9);
        assert_eq!(nms_by_label(vec![a, b], 0.5).len(), 2);
    }

    #[test]
    fn disjoint_boxes_survive() {
        let a = RawDetection::new("shirt", BBox::new(0.0, 0.0, 10.0, 10.0), 0.6);
        let b = RawDetection::new("shirt", BBox::new(50.0, 50.0, 60.0, 60.0), 0.7);
        let kept = nms_by_label(vec![a, b], 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.7);
    }
}

//! Nearest-center association between product and label detections

use super::Detection;

/// A product detection paired with the label detection nearest to it
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub product: Detection,
    pub label: Detection,
}

/// Pick the label whose box center is nearest to the product's box center.
///
/// Distances are compared as exact squared integer distances. On a tie the label that
/// comes first in `labels` wins. Several products may claim the same label.
pub fn associate_nearest_label<'a>(product: &Detection, labels: &'a [Detection]) -> Option<&'a Detection> {
    let (px, py) = product.bbox.center();

    let mut best: Option<(&Detection, i128)> = None;
    for label in labels {
        let (lx, ly) = label.bbox.center();
        let (dx, dy) = ((px - lx) as i128, (py - ly) as i128);
        let distance = dx * dx + dy * dy;
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((label, distance)),
        }
    }

    best.map(|(label, _)| label)
}

//! Panoptic quality of vehicle instances on the BEV grid.

use std::{collections::HashMap, marker::PhantomData};

use burn::{
    tensor::{backend::Backend, Int, Tensor},
    train::metric::{
        state::{FormatOptions, NumericMetricState},
        Metric, MetricEntry, MetricMetadata, Numeric,
    },
};

/// Minimum IoU for a predicted instance to count as a match.
const MATCH_IOU: f64 = 0.5;
const VEHICLE: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PanopticStats {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub iou_sum: f64,
}

impl PanopticStats {
    pub fn merge(&mut self, other: PanopticStats) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
        self.iou_sum += other.iou_sum;
    }

    /// `PQ = sum(IoU) / (TP + FP/2 + FN/2)`. A scene with no instances on
    /// either side is a perfect score.
    pub fn quality(&self) -> f64 {
        let denominator = self.true_positives as f64
            + 0.5 * self.false_positives as f64
            + 0.5 * self.false_negatives as f64;
        if denominator == 0.0 {
            1.0
        } else {
            self.iou_sum / denominator
        }
    }
}

/// 4-connected components of `mask`. Returns per-cell ids (0 = background,
/// components numbered from 1) and the component count.
pub fn label_components(mask: &[bool], rows: usize, columns: usize) -> (Vec<u32>, u32) {
    let mut labels = vec![0u32; mask.len()];
    let mut count = 0;
    let mut stack = Vec::new();

    for start in 0..mask.len().min(rows * columns) {
        if !mask[start] || labels[start] != 0 {
            continue;
        }
        count += 1;
        labels[start] = count;
        stack.push(start);

        while let Some(cell) = stack.pop() {
            let (row, column) = (cell / columns, cell % columns);
            let neighbours = [
                (row > 0).then(|| cell - columns),
                (row + 1 < rows).then(|| cell + columns),
                (column > 0).then(|| cell - 1),
                (column + 1 < columns).then(|| cell + 1),
            ];
            for next in neighbours.into_iter().flatten() {
                if mask[next] && labels[next] == 0 {
                    labels[next] = count;
                    stack.push(next);
                }
            }
        }
    }

    (labels, count)
}

/// Matches predicted against ground truth instances of one scene. Id 0 is
/// background on both sides.
pub fn panoptic_stats(predicted: &[u32], target: &[u32]) -> PanopticStats {
    let mut predicted_area: HashMap<u32, usize> = HashMap::new();
    let mut target_area: HashMap<u32, usize> = HashMap::new();
    let mut overlap: HashMap<(u32, u32), usize> = HashMap::new();

    for (&p, &t) in predicted.iter().zip(target) {
        if p != 0 {
            *predicted_area.entry(p).or_default() += 1;
        }
        if t != 0 {
            *target_area.entry(t).or_default() += 1;
        }
        if p != 0 && t != 0 {
            *overlap.entry((p, t)).or_default() += 1;
        }
    }

    let mut stats = PanopticStats::default();
    for (&(p, t), &intersection) in &overlap {
        let union = predicted_area[&p] + target_area[&t] - intersection;
        let iou = intersection as f64 / union as f64;
        // IoU above one half makes the match unique on both sides.
        if iou > MATCH_IOU {
            stats.true_positives += 1;
            stats.iou_sum += iou;
        }
    }
    stats.false_positives = predicted_area.len() - stats.true_positives;
    stats.false_negatives = target_area.len() - stats.true_positives;

    stats
}

pub struct VpqInput<B: Backend> {
    /// Class per BEV cell, `[N, rows, columns]`.
    predictions: Tensor<B, 3, Int>,
    /// Ground truth instance ids, `[N, rows, columns]`.
    instances: Tensor<B, 3, Int>,
}

impl<B: Backend> VpqInput<B> {
    pub fn new(predictions: Tensor<B, 3, Int>, instances: Tensor<B, 3, Int>) -> Self {
        Self {
            predictions,
            instances,
        }
    }
}

/// Vehicle panoptic quality, reported under the name `vpq`. The value is the
/// latest batch; the learner's event store aggregates the epoch mean.
pub struct VpqMetric<B: Backend> {
    state: NumericMetricState,
    _b: PhantomData<B>,
}

impl<B: Backend> VpqMetric<B> {
    pub fn new() -> Self {
        Self {
            state: NumericMetricState::new(),
            _b: PhantomData,
        }
    }
}

impl<B: Backend> Default for VpqMetric<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Metric for VpqMetric<B> {
    const NAME: &'static str = "vpq";

    type Input = VpqInput<B>;

    fn update(&mut self, input: &VpqInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [batch_size, rows, columns] = input.predictions.dims();
        let cells = rows * columns;

        let predicted: Vec<i64> = input.predictions.to_data().iter::<i64>().collect();
        let target: Vec<u32> = input
            .instances
            .to_data()
            .iter::<i64>()
            .map(|id| id.max(0) as u32)
            .collect();

        let mut stats = PanopticStats::default();
        for sample in 0..batch_size {
            let range = sample * cells..(sample + 1) * cells;
            let mask: Vec<bool> = predicted[range.clone()].iter().map(|&c| c == VEHICLE).collect();
            let (labels, _) = label_components(&mask, rows, columns);
            stats.merge(panoptic_stats(&labels, &target[range]));
        }

        self.state.update(
            stats.quality(),
            batch_size,
            FormatOptions::new(Self::NAME).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for VpqMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}

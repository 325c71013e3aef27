use bev_dataset::BevBatch;
use burn::{
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{
        metric::{Adaptor, LossInput},
        TrainOutput, TrainStep, ValidStep,
    },
};

use crate::{metric::VpqInput, PowerBev};

pub struct BevOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Predicted class per BEV cell.
    pub predictions: Tensor<B, 3, Int>,
    /// Ground truth instance ids, carried along for the panoptic metric.
    pub instances: Tensor<B, 3, Int>,
}

impl<B: Backend> BevOutput<B> {
    pub fn new(
        loss: Tensor<B, 1>,
        predictions: Tensor<B, 3, Int>,
        instances: Tensor<B, 3, Int>,
    ) -> Self {
        Self {
            loss,
            predictions,
            instances,
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for BevOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<VpqInput<B>> for BevOutput<B> {
    fn adapt(&self) -> VpqInput<B> {
        VpqInput::new(self.predictions.clone(), self.instances.clone())
    }
}

impl<B: AutodiffBackend> TrainStep<BevBatch<B>, BevOutput<B>> for PowerBev<B> {
    fn step(&self, batch: BevBatch<B>) -> TrainOutput<BevOutput<B>> {
        let item = self.forward_segmentation(batch);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<BevBatch<B>, BevOutput<B>> for PowerBev<B> {
    fn step(&self, batch: BevBatch<B>) -> BevOutput<B> {
        self.forward_segmentation(batch)
    }
}

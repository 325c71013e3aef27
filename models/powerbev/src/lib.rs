use bev_dataset::BevBatch;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Int, Tensor},
};

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod metric;
pub mod run_dir;
pub mod state_dict;
mod steps;
mod training;
use ::log::info;
pub use steps::BevOutput;
pub use training::*;

use state_dict::{LoadReport, NamedParameters, Snapshot, StateDict};

/// Background and vehicle.
pub const NUM_CLASSES: usize = 2;

#[derive(Config, Debug)]
pub struct PowerBevConfig {
    pub in_channels: usize,
    pub aux_dim: usize,
    /// BEV grid `[rows, columns]`.
    pub bev_size: [usize; 2],
    #[config(default = 64)]
    pub encoder_channels: usize,
    #[config(default = 1.0)]
    pub background_weight: f32,
    #[config(default = 2.0)]
    pub vehicle_weight: f32,
}

impl PowerBevConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PowerBev<B> {
        let stem_channels = (self.encoder_channels / 2).max(1);
        let conv = |channels: [usize; 2], stride: usize| {
            Conv2dConfig::new(channels, [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        PowerBev {
            backbone: Backbone {
                stem: conv([self.in_channels, stem_channels], 1),
                encoder: conv([stem_channels, self.encoder_channels], 2),
            },
            pool: AdaptiveAvgPool2dConfig::new(self.bev_size).init(),
            fusion: LinearConfig::new(self.aux_dim, self.encoder_channels).init(device),
            head: Head {
                segmentation: Conv2dConfig::new([self.encoder_channels, NUM_CLASSES], [1, 1])
                    .init(device),
            },
            background_weight: self.background_weight,
            vehicle_weight: self.vehicle_weight,
        }
    }
}

#[derive(Module, Debug)]
pub struct PowerBev<B: Backend> {
    backbone: Backbone<B>,
    pool: AdaptiveAvgPool2d,
    fusion: Linear<B>,
    head: Head<B>,
    background_weight: f32,
    vehicle_weight: f32,
}

/// Image encoder; the part a single-image pretrained snapshot provides.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: Conv2d<B>,
    encoder: Conv2d<B>,
}

#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    segmentation: Conv2d<B>,
}

impl<B: Backend> PowerBev<B> {
    /// Segmentation logits on the BEV grid, `[N, NUM_CLASSES, rows, columns]`.
    pub fn forward(&self, image: Tensor<B, 4>, aux: Tensor<B, 2>) -> Tensor<B, 4> {
        let features = relu(self.backbone.stem.forward(image));
        let features = relu(self.backbone.encoder.forward(features));

        let bev = self.pool.forward(features);
        let [batch_size, channels, _, _] = bev.dims();
        let ego = self.fusion.forward(aux).reshape([batch_size, channels, 1, 1]);

        self.head.segmentation.forward(relu(bev + ego))
    }

    /// Class-weighted cross entropy over every BEV cell.
    pub fn compute_loss(&self, logits: Tensor<B, 4>, segmentation: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let [batch_size, classes, rows, columns] = logits.dims();
        let cells = batch_size * rows * columns;

        let logits = logits.swap_dims(1, 3).swap_dims(1, 2).reshape([cells, classes]);
        let targets = segmentation.reshape([cells]);

        CrossEntropyLossConfig::new()
            .with_weights(Some(vec![self.background_weight, self.vehicle_weight]))
            .init(&logits.device())
            .forward(logits, targets)
    }

    pub fn forward_segmentation(&self, batch: BevBatch<B>) -> BevOutput<B> {
        let logits = self.forward(batch.image, batch.aux);
        let [batch_size, _, rows, columns] = logits.dims();

        let predictions = logits.clone().argmax(1).reshape([batch_size, rows, columns]);
        let loss = self.compute_loss(logits, batch.segmentation);

        BevOutput::new(loss, predictions, batch.instance)
    }

    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::default();
        self.backbone.stem.export("backbone.stem", &mut dict);
        self.backbone.encoder.export("backbone.encoder", &mut dict);
        self.fusion.export("fusion", &mut dict);
        self.head.segmentation.export("head.segmentation", &mut dict);
        dict
    }

    /// Non-strict load: matching names are overwritten, everything else is
    /// reported and left as is.
    pub fn load_partial_state(mut self, snapshot: &Snapshot) -> (Self, LoadReport) {
        let dict = &snapshot.state_dict;
        let mut report = LoadReport::default();

        self.backbone.stem = self.backbone.stem.import("backbone.stem", dict, &mut report);
        self.backbone.encoder = self
            .backbone
            .encoder
            .import("backbone.encoder", dict, &mut report);
        self.fusion = self.fusion.import("fusion", dict, &mut report);
        self.head.segmentation = self
            .head
            .segmentation
            .import("head.segmentation", dict, &mut report);

        report.finish(dict);
        info!(
            "merged {} of {} snapshot parameters ({} mismatched, {} unknown)",
            report.loaded.len(),
            dict.len(),
            report.mismatched.len(),
            report.unexpected.len()
        );

        (self, report)
    }
}

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

mod loader;
mod synthetic;
mod types;
pub use loader::{BevDataSource, BevDataset, BevSplits};
pub use synthetic::SyntheticBevDataset;
pub use types::{BevGeometry, BevItem, SampleRecord};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset path '{path}' is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sample '{path}' does not match the dataset schema: {reason}")]
    Schema { path: PathBuf, reason: String },

    #[error("{split} split has no samples")]
    Empty { split: &'static str },
}

pub struct BevBatcher<B: Backend> {
    device: B::Device,
    geometry: BevGeometry,
}

// A derive would also require `B: Clone`.
impl<B: Backend> Clone for BevBatcher<B> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            geometry: self.geometry.clone(),
        }
    }
}

impl<B: Backend> Batcher<BevItem, BevBatch<B>> for BevBatcher<B> {
    fn batch(&self, items: Vec<BevItem>) -> BevBatch<B> {
        let g = &self.geometry;
        let n = items.len();

        let mut images = Vec::with_capacity(n * g.image_len());
        let mut aux = Vec::with_capacity(n * g.aux_dim);
        let mut segmentation = Vec::with_capacity(n * g.bev_len());
        let mut instance = Vec::with_capacity(n * g.bev_len());

        for item in items {
            images.extend(item.image);
            aux.extend(item.aux);
            segmentation.extend(item.segmentation.into_iter().map(i64::from));
            instance.extend(item.instance.into_iter().map(i64::from));
        }

        let image = Tensor::from_data(
            TensorData::new(images, [n, g.channels, g.image_height, g.image_width]),
            &self.device,
        );
        let aux = Tensor::from_data(TensorData::new(aux, [n, g.aux_dim]), &self.device);
        let segmentation = Tensor::from_data(
            TensorData::new(segmentation, [n, g.bev_height, g.bev_width]),
            &self.device,
        );
        let instance = Tensor::from_data(
            TensorData::new(instance, [n, g.bev_height, g.bev_width]),
            &self.device,
        );
        tracing::trace!("batched {n} samples, image {:?}", image.dims());

        BevBatch {
            image,
            aux,
            segmentation,
            instance,
        }
    }
}

impl<B: Backend> BevBatcher<B> {
    pub fn new(device: B::Device, geometry: BevGeometry) -> Self {
        Self { device, geometry }
    }
}

#[derive(Debug, Clone)]
pub struct BevBatch<B: Backend> {
    /// Camera images stacked along channels, `[N, C, H, W]`.
    pub image: Tensor<B, 4>,
    /// Ego-motion vector, `[N, A]`.
    pub aux: Tensor<B, 2>,
    /// Semantic labels on the BEV grid, `[N, bh, bw]`.
    pub segmentation: Tensor<B, 3, Int>,
    /// Instance ids on the BEV grid, 0 is background, `[N, bh, bw]`.
    pub instance: Tensor<B, 3, Int>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;

    type TestBackend = NdArray<f32>;

    #[test]
    fn batch_stacks_items_along_first_dim() {
        let geometry = BevGeometry::new(3, [8, 12], [4, 6], 2);
        let dataset = SyntheticBevDataset::new(geometry.clone(), 3, 7);
        let items: Vec<_> = (0..3).filter_map(|i| dataset.get(i)).collect();

        let batcher = BevBatcher::<TestBackend>::new(Default::default(), geometry);
        let batch = batcher.batch(items.clone());

        assert_eq!(batch.image.dims(), [3, 3, 8, 12]);
        assert_eq!(batch.aux.dims(), [3, 2]);
        assert_eq!(batch.segmentation.dims(), [3, 4, 6]);
        assert_eq!(batch.instance.dims(), [3, 4, 6]);

        let labels: Vec<i64> = batch.segmentation.into_data().iter::<i64>().collect();
        let expected: Vec<i64> = items
            .iter()
            .flat_map(|item| item.segmentation.iter().map(|v| i64::from(*v)))
            .collect();
        assert_eq!(labels, expected);
    }

    #[test]
    fn batcher_drives_a_dataloader() {
        use burn::data::dataloader::DataLoaderBuilder;

        let geometry = BevGeometry::new(3, [8, 12], [4, 6], 2);
        let dataset = SyntheticBevDataset::new(geometry.clone(), 5, 11);
        let batcher = BevBatcher::<TestBackend>::new(Default::default(), geometry);

        let loader = DataLoaderBuilder::new(batcher.clone())
            .batch_size(2)
            .build(dataset);
        let sizes: Vec<usize> = loader.iter().map(|batch| batch.image.dims()[0]).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}

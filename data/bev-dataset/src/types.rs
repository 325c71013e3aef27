use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::DataError;

/// Tensor shapes shared by every sample of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BevGeometry {
    pub channels: usize,
    pub image_height: usize,
    pub image_width: usize,
    pub bev_height: usize,
    pub bev_width: usize,
    pub aux_dim: usize,
}

impl BevGeometry {
    pub fn new(channels: usize, image: [usize; 2], bev: [usize; 2], aux_dim: usize) -> Self {
        Self {
            channels,
            image_height: image[0],
            image_width: image[1],
            bev_height: bev[0],
            bev_width: bev[1],
            aux_dim,
        }
    }

    pub fn image_len(&self) -> usize {
        self.channels * self.image_height * self.image_width
    }

    pub fn bev_len(&self) -> usize {
        self.bev_height * self.bev_width
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BevItem {
    pub image: Vec<f32>,
    pub aux: Vec<f32>,
    pub segmentation: Vec<u8>,
    pub instance: Vec<u32>,
}

/// On-disk layout of one sample of a `directory` dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub image: Vec<f32>,
    #[serde(default)]
    pub aux: Vec<f32>,
    pub segmentation: Vec<u8>,
    pub instance: Vec<u32>,
}

impl SampleRecord {
    pub(crate) fn into_item(self, geometry: &BevGeometry, path: &Path) -> Result<BevItem, DataError> {
        let schema = |reason: String| DataError::Schema {
            path: path.to_path_buf(),
            reason,
        };

        check_len("image", self.image.len(), geometry.image_len()).map_err(schema)?;
        check_len("segmentation", self.segmentation.len(), geometry.bev_len()).map_err(schema)?;
        check_len("instance", self.instance.len(), geometry.bev_len()).map_err(schema)?;

        // Records written without ego-motion are accepted as standing still.
        let aux = if self.aux.is_empty() {
            vec![0.0; geometry.aux_dim]
        } else {
            check_len("aux", self.aux.len(), geometry.aux_dim).map_err(schema)?;
            self.aux
        };

        if let Some(label) = self.segmentation.iter().find(|label| **label > 1) {
            return Err(schema(format!("segmentation label {label} is not 0 or 1")));
        }

        Ok(BevItem {
            image: self.image,
            aux,
            segmentation: self.segmentation,
            instance: self.instance,
        })
    }
}

impl From<BevItem> for SampleRecord {
    fn from(item: BevItem) -> Self {
        Self {
            image: item.image,
            aux: item.aux,
            segmentation: item.segmentation,
            instance: item.instance,
        }
    }
}

fn check_len(field: &str, actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{field} has {actual} values, expected {expected}"))
    }
}

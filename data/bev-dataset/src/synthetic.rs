use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::types::{BevGeometry, BevItem};

const MAX_VEHICLES: usize = 4;

/// Procedurally generated BEV scenes. Items are generated on access from
/// `seed` and the index, so the same index always yields the same scene.
#[derive(Debug, Clone)]
pub struct SyntheticBevDataset {
    geometry: BevGeometry,
    len: usize,
    seed: u64,
}

impl SyntheticBevDataset {
    pub fn new(geometry: BevGeometry, len: usize, seed: u64) -> Self {
        Self {
            geometry,
            len,
            seed,
        }
    }

    fn generate(&self, index: usize) -> BevItem {
        let g = &self.geometry;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_mul(0x9E37_79B9).wrapping_add(index as u64));

        let mut instance = vec![0u32; g.bev_len()];
        let max_side = (g.bev_height.min(g.bev_width) / 4).max(1);
        let vehicles = rng.gen_range(1..=MAX_VEHICLES);

        for id in 1..=vehicles {
            let h = rng.gen_range(1..=max_side);
            let w = rng.gen_range(1..=max_side);
            let top = rng.gen_range(0..=g.bev_height - h);
            let left = rng.gen_range(0..=g.bev_width - w);

            for y in top..top + h {
                for x in left..left + w {
                    instance[y * g.bev_width + x] = id as u32;
                }
            }
        }

        // Later vehicles may fully cover earlier ones; compact ids so every id is visible.
        let mut remap = vec![0u32; vehicles + 1];
        let mut next = 0;
        for id in instance.iter_mut().filter(|id| **id > 0) {
            let slot = &mut remap[*id as usize];
            if *slot == 0 {
                next += 1;
                *slot = next;
            }
            *id = *slot;
        }

        let segmentation: Vec<u8> = instance.iter().map(|id| u8::from(*id > 0)).collect();

        let mut image = Vec::with_capacity(g.image_len());
        for channel in 0..g.channels {
            let tint = 0.1 * (channel % 3) as f32;
            for y in 0..g.image_height {
                let by = y * g.bev_height / g.image_height;
                for x in 0..g.image_width {
                    let bx = x * g.bev_width / g.image_width;
                    let occupied = f32::from(segmentation[by * g.bev_width + bx]);
                    let noise: f32 = rng.gen_range(-0.1..0.1);
                    image.push(0.8 * occupied + tint + noise);
                }
            }
        }

        let aux = (0..g.aux_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();

        BevItem {
            image,
            aux,
            segmentation,
            instance,
        }
    }
}

impl Dataset<BevItem> for SyntheticBevDataset {
    fn get(&self, index: usize) -> Option<BevItem> {
        (index < self.len).then(|| self.generate(index))
    }

    fn len(&self) -> usize {
        self.len
    }
}

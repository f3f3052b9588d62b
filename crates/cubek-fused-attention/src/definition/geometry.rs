use serde::{Deserialize, Serialize};

use crate::definition::AttentionSetupError;

/// Rows of Q owned by one consumer group.
pub const QO_HEIGHT: u32 = 64;

/// Number of K/V buffer slots cycled by the pipeline.
pub const PIPELINE_STAGES: u32 = 2;

/// Every cube has exactly one producer group.
pub const PRODUCER_GROUPS: u32 = 1;

/// Head dimensions with a kernel specialization.
pub const SUPPORTED_HEAD_DIMS: [usize; 3] = [64, 128, 256];

/// Static shape of the tiles one cube works on.
///
/// Picked once per head dimension; everything the kernel allocates in shared memory
/// derives from it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Feature width of every tile
    pub head_dim: u32,
    /// Query rows per consumer group
    pub qo_height: u32,
    /// Key/value rows per pipeline stage
    pub kv_height: u32,
    /// Buffered K/V stages
    pub stages: u32,
    /// Consumer groups per cube, each owning one query tile
    pub consumer_groups: u32,
    /// Producer groups per cube
    pub producer_groups: u32,
}

const GEOMETRY_D64: TileGeometry = TileGeometry {
    head_dim: 64,
    qo_height: QO_HEIGHT,
    kv_height: 128,
    stages: PIPELINE_STAGES,
    consumer_groups: 3,
    producer_groups: PRODUCER_GROUPS,
};

const GEOMETRY_D128: TileGeometry = TileGeometry {
    head_dim: 128,
    qo_height: QO_HEIGHT,
    kv_height: 128,
    stages: PIPELINE_STAGES,
    consumer_groups: 3,
    producer_groups: PRODUCER_GROUPS,
};

const GEOMETRY_D256: TileGeometry = TileGeometry {
    head_dim: 256,
    qo_height: QO_HEIGHT,
    kv_height: 64,
    stages: PIPELINE_STAGES,
    consumer_groups: 2,
    producer_groups: PRODUCER_GROUPS,
};

impl TileGeometry {
    /// Looks up the specialization for a head dimension.
    pub fn for_head_dim(head_dim: usize) -> Result<Self, AttentionSetupError> {
        match head_dim {
            64 => Ok(GEOMETRY_D64),
            128 => Ok(GEOMETRY_D128),
            256 => Ok(GEOMETRY_D256),
            other => Err(AttentionSetupError::UnsupportedHeadDim(other)),
        }
    }

    /// Query rows covered by one cube.
    pub fn block_rows(&self) -> u32 {
        self.consumer_groups * self.qo_height
    }

    /// Units running the consumer role, one per query row.
    pub fn consumer_units(&self) -> u32 {
        self.block_rows()
    }

    pub fn producer_units(&self) -> u32 {
        self.producer_groups * self.qo_height
    }

    pub fn units_per_cube(&self) -> u32 {
        self.consumer_units() + self.producer_units()
    }

    /// Elements in one K or V stage slot.
    pub fn kv_tile_elems(&self) -> u32 {
        self.kv_height * self.head_dim
    }

    /// Whether consumers release the key slot as soon as QK^T is done, letting the
    /// producer refill K while the value slot is still being read.
    ///
    /// Wide heads have fewer, heavier iterations, so the earlier key refill pays off.
    pub fn releases_key_early(&self) -> bool {
        self.head_dim >= 128
    }

    /// `log2(e) / sqrt(head_dim)`, the softmax scale expressed for `exp2`.
    pub fn log2_softmax_scale(&self) -> f32 {
        core::f32::consts::LOG2_E / (self.head_dim as f32).sqrt()
    }

    /// Bytes of shared memory one cube needs: the Q/O arena plus K and V stages.
    pub fn shared_memory_bytes(&self, qk_elem_size: usize, storage_elem_size: usize) -> usize {
        let arena = (self.block_rows() * self.head_dim) as usize * storage_elem_size;
        let stage_elems = (self.stages * self.kv_tile_elems()) as usize;

        arena + stage_elems * qk_elem_size + stage_elems * storage_elem_size
    }

    /// Cubes needed along the query sequence.
    pub fn num_query_blocks(&self, seq_q: usize) -> u32 {
        (seq_q as u32).div_ceil(self.block_rows())
    }

    pub fn num_kv_tiles(&self, seq_kv: usize) -> u32 {
        (seq_kv as u32).div_ceil(self.kv_height)
    }

    /// Extra shared memory taken by the cmma tile products on planes of `plane_dim`
    /// units: one 16x16 key chunk per consumer plane, plus a 16-wide row of staged
    /// probabilities and f32 results per consumer.
    pub fn cmma_scratch_bytes(&self, plane_dim: u32, storage_elem_size: usize) -> usize {
        let tile = 16;
        let consumer_planes = (self.consumer_units() / plane_dim) as usize;
        let consumer_rows = self.consumer_units() as usize * tile;

        consumer_planes * tile * tile * storage_elem_size
            + consumer_rows * storage_elem_size
            + consumer_rows * core::mem::size_of::<f32>()
    }
}

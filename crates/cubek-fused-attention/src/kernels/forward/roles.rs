use cubecl::prelude::*;

use crate::definition::TileGeometry;

#[derive(CubeType, Copy, Clone, Debug, Hash, PartialEq, Eq)]
/// Splits the units of a cube between consumers and producers
///
/// Consumer units: [0, consumer_units), one per query row of the block.
/// Producer units: [consumer_units, total), cooperatively moving tiles into shared memory.
pub struct UnitRoles {
    #[cube(comptime)]
    consumer_units: u32,
    #[cube(comptime)]
    qo_height: u32,
}

#[cube]
impl UnitRoles {
    pub fn new(#[comptime] geometry: TileGeometry) -> UnitRoles {
        UnitRoles {
            consumer_units: comptime!(geometry.consumer_units()),
            qo_height: comptime!(geometry.qo_height),
        }
    }

    /// Whether the current unit only loads tiles
    pub fn is_producer(self) -> bool {
        UNIT_POS_X >= self.consumer_units
    }

    /// The index of the current unit among producers.
    ///
    /// Only meaningful when [is_producer](UnitRoles::is_producer) holds.
    pub fn producer_index(self) -> u32 {
        UNIT_POS_X - self.consumer_units
    }

    /// The query row of the block owned by the current consumer
    pub fn consumer_row(self) -> u32 {
        UNIT_POS_X
    }

    /// The consumer group, hence the query tile, of the current consumer
    pub fn consumer_group(self) -> u32 {
        UNIT_POS_X / self.qo_height
    }

    /// Position of the current consumer within its group
    pub fn index_in_group(self) -> u32 {
        UNIT_POS_X % self.qo_height
    }
}

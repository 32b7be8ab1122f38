//! Surfaces: which parts of the grid a surface covers.
//!
//! An existence map keeps one bit per leaf subgrid. Site models keep one
//! for their production data. Each imported design surface gets its own,
//! stored under the project as `ExistenceMap-{design id}`.
//!
//! ```text
//!  site grid (cells)          existence map (subgrids)
//!  +----+----+----+           +-+-+-+
//!  |####|    |    |           |1|0|0|
//!  +----+----+----+   ──►     +-+-+-+
//!  |    |##  |    |           |0|1|0|
//!  +----+----+----+           +-+-+-+
//! ```

pub mod designs;
pub mod existence;

pub use designs::{DesignDescriptor, DesignRegistry};
pub use existence::{existence_map_key, ExistenceMap, ExistenceMaps, WorldExtent};

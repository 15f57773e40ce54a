//! In-memory collaborators and fixtures for exercising canopy pipelines
//! without a catalog, object storage or model runtime.

mod job;
mod mock;
mod raster;

pub use job::*;
pub use mock::*;
pub use raster::*;

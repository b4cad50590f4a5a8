//! Capture planning and post-processing
//!
//! Everything in this module is pure and thread-safe:
//! - Feasibility estimation of a capture request against the link
//! - Time-axis reconstruction of raw samples
//! - Scaling of raw counts to engineering units

pub mod feasibility;
pub mod scaling;
pub mod timeline;

pub use feasibility::{
    estimate, min_sample_factor, FeasibilityInput, FeasibilityReport, InvalidInput, RiskLevel,
};
pub use scaling::{scale_series, ScaledChannel, ScaledDataset};
pub use timeline::{reconstruct, reconstruct_request, ReconstructedSeries, UnderDelivery};

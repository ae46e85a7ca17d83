pub mod alpha;
pub mod connectivity;
pub mod graphcut;
pub mod mask;
pub mod padding;
pub mod refine;

pub use alpha::{alpha_metrics, apply_alpha, refine_alpha};
pub use connectivity::keep_main_components;
pub use mask::Mask;
pub use refine::{accept_refinement, edge_guided_refine};

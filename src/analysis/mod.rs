//! The analysis passes, run in a fixed order per procedure: model building,
//! aggregate classification, JSON shape, post-processing, then type
//! resolution during descriptor assembly.

pub mod aggregate;
pub mod assembler;
pub mod dependencies;
pub mod json_shape;
pub mod model_builder;
pub mod post_process;
pub mod scalar_types;
pub mod type_resolution;

pub use assembler::{load_descriptors, AnalysisContext};
pub use scalar_types::{format_sql_type, parse_type_token, ScalarTypeCatalog};
pub use type_resolution::ResolvedColumnType;

pub mod formula;
pub mod metadata;

pub use formula::{Action, FilterConfig, Formula, FormulaInput, FormulaOutput, Mount, MountGroup};
pub use metadata::{Metadata, NodeType};

pub mod egress_control;
pub mod traits;

pub use egress_control::EgressControlTool;
pub use traits::{Tool, ToolResult};

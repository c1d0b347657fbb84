//! Container runtime access: discovery, label schema, and the driver verbs.
pub mod driver;
pub mod labels;
pub mod runtime;

pub mod dataset;
pub mod intersect;
pub mod merge;
pub mod panel;
pub mod project;
pub mod resources;
pub mod tools;
pub mod variant;

pub mod graph;
pub mod ir;
pub mod value;

pub mod bucket;
pub(crate) mod manager;
pub mod node;
pub mod table;

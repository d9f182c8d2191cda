pub(crate) mod archive;
pub mod models;
pub mod projection;
pub mod rows;
pub mod store;
pub mod sync_state;

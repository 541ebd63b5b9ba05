pub mod coordinator;
pub mod download;
pub mod highlight;
pub mod model;
pub mod projection;
pub mod remote;
pub mod render;
pub mod slot;
pub mod store;

pub mod api;
pub mod detection;
pub mod events;
pub mod job;

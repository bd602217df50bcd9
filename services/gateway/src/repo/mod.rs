pub mod audit;
pub mod offline_queue;
pub mod sessions;

pub mod allocator;
pub mod manager;
pub mod strategy;

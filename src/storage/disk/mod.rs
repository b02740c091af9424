pub mod file;
pub mod registry;
pub mod request;
pub mod scheduler;
#[cfg(target_os = "linux")]
pub mod uring;

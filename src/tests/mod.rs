mod cancel_test;
mod support;
#[cfg(target_os = "linux")]
mod uring_test;

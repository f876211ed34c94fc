#[cfg(not(target_arch = "x86_64"))]
compile_error!("cacheir stubs are only emitted for x86-64");

#[cfg(target_arch = "x86_64")]
mod x64;

#[cfg(target_arch = "x86_64")]
pub use x64::*;

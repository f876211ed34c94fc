/// Knobs for the stub compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    /// Reuse the previous failure path when the live state is unchanged.
    pub share_failure_paths: bool,
    /// Look compiled code up in the shared stub-code table before compiling.
    pub use_stub_code_cache: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            share_failure_paths: true,
            use_stub_code_cache: true,
        }
    }
}

impl JitOptions {
    /// Defaults, overridden by the environment.
    ///
    /// Set `CACHEIR_NO_SHARED_FAILURE_PATHS=1` to give every guard its own
    /// failure path, and `CACHEIR_NO_STUB_CODE_CACHE=1` to compile every stub
    /// from scratch.
    pub fn from_env() -> Self {
        let defaults = JitOptions::default();
        JitOptions {
            share_failure_paths: !env_flag("CACHEIR_NO_SHARED_FAILURE_PATHS")
                && defaults.share_failure_paths,
            use_stub_code_cache: !env_flag("CACHEIR_NO_STUB_CODE_CACHE")
                && defaults.use_stub_code_cache,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

//! Runtime options
//!
//! Environment-driven switches for the collector plus the test-mode
//! flag the CLI sets for `ilex test`. Embedders construct options
//! programmatically; the CLI reads them from the environment.

/// Truthy strings for boolean environment switches: "1", "true", "on".
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "on"),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Collect on every allocation; slow, for shaking out rooting bugs.
    pub gc_stress: bool,
    /// Emit a trace event per collection.
    pub gc_log: bool,
    /// Exposed to scripts through the `isTestMode` native.
    pub test_mode: bool,
}

impl VmOptions {
    pub fn from_env() -> VmOptions {
        VmOptions {
            gc_stress: env_flag("ILEX_GC_STRESS"),
            gc_log: env_flag("ILEX_GC_LOG"),
            test_mode: false,
        }
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> VmOptions {
        self.test_mode = test_mode;
        self
    }

    pub fn with_gc_stress(mut self, gc_stress: bool) -> VmOptions {
        self.gc_stress = gc_stress;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn reads_flags_from_environment() {
        unsafe {
            std::env::set_var("ILEX_GC_STRESS", "1");
            std::env::remove_var("ILEX_GC_LOG");
        }
        let options = VmOptions::from_env();
        assert!(options.gc_stress);
        assert!(!options.gc_log);
        unsafe {
            std::env::remove_var("ILEX_GC_STRESS");
        }
    }

    #[test]
    #[serial]
    fn unset_environment_is_all_off() {
        unsafe {
            std::env::remove_var("ILEX_GC_STRESS");
            std::env::remove_var("ILEX_GC_LOG");
        }
        let options = VmOptions::from_env();
        assert!(!options.gc_stress);
        assert!(!options.gc_log);
        assert!(!options.test_mode);
    }
}

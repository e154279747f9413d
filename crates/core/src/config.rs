//! Per-operator configuration.

/// Settings shared by every derived operator.
///
/// Configuration is plain data: build it once and pass it by reference to an
/// operator's `with_config` constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Name attached to every log line the operator emits.
    pub label: String,
    /// The drain loop yields to the scheduler after this many consecutive records.
    pub yield_every: usize,
    /// Verify shadow state against the output after each applied record.
    pub check_invariants: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::new("operator")
    }
}

impl OperatorConfig {
    /// Default number of records applied before the drain loop yields.
    pub const DEFAULT_YIELD_EVERY: usize = 64;

    /// Creates a configuration with default settings and the given label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            yield_every: Self::DEFAULT_YIELD_EVERY,
            check_invariants: cfg!(debug_assertions),
        }
    }

    /// Sets how many records the drain loop applies before yielding. Zero is treated as one.
    pub fn with_yield_every(mut self, records: usize) -> Self {
        self.yield_every = records.max(1);
        self
    }

    /// Enables or disables the post-record consistency checks.
    pub fn with_invariant_checks(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self
    }

    /// Derives the configuration of an inner stage of a composed operator.
    pub fn child(&self, suffix: &str) -> Self {
        Self {
            label: format!("{}.{}", self.label, suffix),
            ..self.clone()
        }
    }
}

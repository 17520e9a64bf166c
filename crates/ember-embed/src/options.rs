//! Runtime configuration

use ember_core::VmOptions;

/// Environment variable selecting the member resolution strategy
/// (`table` or `reflect`)
pub const ENV_RESOLVE: &str = "EMBER_RESOLVE";
/// Environment variable overriding the first collection threshold
pub const ENV_GC_THRESHOLD: &str = "EMBER_GC_THRESHOLD";
/// Environment variable overriding the guest call depth limit
pub const ENV_MAX_CALL_DEPTH: &str = "EMBER_MAX_CALL_DEPTH";
/// Environment variable overriding the worker queue capacity
pub const ENV_QUEUE_CAPACITY: &str = "EMBER_QUEUE_CAPACITY";

/// Who drives the guest runtime
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrationMode {
    /// The host thread calls in directly and pumps events with `update`
    #[default]
    Direct = 0,
    /// A dedicated worker thread owns the runtime
    Threaded = 1,
}

/// How members are found by name
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveStrategy {
    /// Scan the type table by name hash. Supports constructor lookup by
    /// symbol and hot reload.
    #[default]
    TypeTable = 0,
    /// Go through the reflection API only
    Reflection = 1,
}

impl ResolveStrategy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" | "type-table" | "typetable" => Some(ResolveStrategy::TypeTable),
            "reflect" | "reflection" => Some(ResolveStrategy::Reflection),
            _ => None,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Guest VM options
    pub vm: VmOptions,

    /// Integration mode at creation; may be changed until the entry point runs
    pub mode: IntegrationMode,

    /// Member resolution strategy
    pub strategy: ResolveStrategy,

    /// Maximum registered callbacks
    pub max_callbacks: usize,

    /// Worker message queue capacity
    pub queue_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            vm: VmOptions::default(),
            mode: IntegrationMode::Direct,
            strategy: ResolveStrategy::TypeTable,
            max_callbacks: 64,
            queue_capacity: 256,
        }
    }
}

impl RuntimeOptions {
    /// Defaults overridden by the `EMBER_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Invalid values are logged and ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_RESOLVE) {
            match ResolveStrategy::parse(&raw) {
                Some(strategy) => self.strategy = strategy,
                None => log::warn!("ignoring {}={:?}: expected `table` or `reflect`", ENV_RESOLVE, raw),
            }
        }
        if let Some(n) = positive(&lookup, ENV_GC_THRESHOLD) {
            self.vm.gc_threshold = n;
        }
        if let Some(n) = positive(&lookup, ENV_MAX_CALL_DEPTH) {
            self.vm.max_call_depth = n;
        }
        if let Some(n) = positive(&lookup, ENV_QUEUE_CAPACITY) {
            self.queue_capacity = n;
        }
        self
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!("ignoring {}={:?}: expected a positive integer", key, raw);
            None
        }
    }
}

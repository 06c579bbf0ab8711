//! Debug logging for vmm-harness.
//!
//! Library code logs through the `log` facade. Set the `VMM_HARNESS_DEBUG`
//! environment variable and call [`init`] to get those records on stderr:
//! - `VMM_HARNESS_DEBUG=1` - Enable all debug output
//! - `VMM_HARNESS_DEBUG=backend` - Enable only backend logs (emulator, KVM)
//! - `VMM_HARNESS_DEBUG=runner` - Enable only execution loop logs
//! - `VMM_HARNESS_DEBUG=vcpu,runner` - Enable multiple categories
//!
//! Adding `trace` to the list lowers the level to `Trace`, which makes the
//! emulator log every instruction it retires.

use std::io::Write;
use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Backend,
    Vcpu,
    Runner,
    All,
}

impl DebugCategory {
    fn for_target(target: &str) -> Option<Self> {
        let module = target.strip_prefix("vmm_harness::")?;
        if module.starts_with("backend") {
            Some(DebugCategory::Backend)
        } else if module.starts_with("vcpu") || module.starts_with("vm") {
            Some(DebugCategory::Vcpu)
        } else if module.starts_with("runner") || module.starts_with("builder") {
            Some(DebugCategory::Runner)
        } else {
            Some(DebugCategory::All)
        }
    }
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

static LOGGER: DebugLogger = DebugLogger;

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    backend: bool,
    vcpu: bool,
    runner: bool,
    trace: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("VMM_HARNESS_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }

    fn parse(val: &str) -> Self {
        let val_lower = val.to_lowercase();
        if val_lower == "1" || val_lower == "all" {
            return Self {
                enabled: true,
                backend: true,
                vcpu: true,
                runner: true,
                trace: false,
            };
        }
        if val_lower.is_empty() || val_lower == "0" {
            return Self::default();
        }
        Self {
            enabled: true,
            backend: val_lower.contains("backend"),
            vcpu: val_lower.contains("vcpu"),
            runner: val_lower.contains("runner"),
            trace: val_lower.contains("trace"),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.backend || self.vcpu || self.runner,
            DebugCategory::Backend => self.backend,
            DebugCategory::Vcpu => self.vcpu,
            DebugCategory::Runner => self.runner,
        }
    }

    fn level(&self) -> LevelFilter {
        match (self.enabled, self.trace) {
            (false, _) => LevelFilter::Warn,
            (true, false) => LevelFilter::Debug,
            (true, true) => LevelFilter::Trace,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Install the stderr logger.
///
/// Warnings and errors are always printed. Safe to call more than once; a
/// logger installed by the embedding application takes precedence.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(get_config().level());
    }
}

struct DebugLogger;

impl Log for DebugLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() <= Level::Warn {
            return true;
        }
        match DebugCategory::for_target(metadata.target()) {
            Some(category) => is_debug_enabled(category),
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            std::io::stderr(),
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

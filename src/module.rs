//! The block/type module callback contract. Module
//! *loading* (locating and `dlopen`-ing a module's shared object) is out of
//! scope here; what's implemented is
//! the interface the scan pipeline drives once a module is resolved:
//! one method per phase, with a default no-op so a module only needs to
//! implement the phases it cares about.

use serde::{Deserialize, Serialize};

use crate::context::CommonContext;
use crate::error::CommandError;

/// A minimal device handle: the fields a module needs to read or derive
/// keys from. Hierarchy/parent resolution (walking `/sys` slaves, or the
/// parent device for a partition) is the scan pipeline's job, done during
/// INIT; by the time a module sees a `DeviceHandle` that walk is already done.
/// `Serialize`/`Deserialize` let the bridge carry one as a `SCAN` request's
/// JSON payload — the bridge itself has no udev socket of its own
/// (walking `/sys`/NETLINK_KOBJECT_UEVENT is out of scope here),
/// so a caller hands over an already-resolved `DeviceHandle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub major_minor: String,
    pub devpath: String,
    pub parent_major_minor: Option<String>,
    /// For a whole disk, the `major_minor` of each stacked slave device read
    /// from `/sys/.../slaves/` during the scan pipeline's INIT hierarchy
    /// refresh; empty for a
    /// partition, which instead carries `parent_major_minor`. Reading the
    /// directory itself is the bridge's job; by the time
    /// a `DeviceHandle` reaches the scan pipeline this is already resolved.
    pub slaves: Vec<String>,
    pub properties: Vec<(String, String)>,
}

impl DeviceHandle {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// The udev `SEQNUM` property, parsed, or `0` if absent/malformed —
    /// callers that need the originating event's sequence number for record
    /// stamping fall back to `0` rather than failing
    /// the scan over a missing/garbled field.
    pub fn seqnum(&self) -> u64 {
        self.property("SEQNUM").and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

/// What a module asks the pipeline to do after one of its callbacks runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSignal {
    /// Proceed to the next phase normally.
    Continue,
    /// Request the TRIGGER_ACTION_{CURRENT,NEXT} phase run before
    /// continuing.
    TriggerAction,
    /// Abort the scan; the pipeline transitions to its terminal ERROR
    /// phase, which can only be entered once.
    Abort,
}

pub type ModuleResult = Result<ModuleSignal, CommandError>;

/// The callback contract every block or type module implements. Default
/// bodies are `Ok(Continue)`, matching a module that only cares about a
/// subset of phases.
pub trait ScanModule: Send + Sync {
    fn name(&self) -> &str;

    fn ident(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn scan_pre(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn scan_current(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn scan_next(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn scan_post_current(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn scan_post_next(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn trigger_action_current(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }
    fn trigger_action_next(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
        Ok(ModuleSignal::Continue)
    }

    /// Invoked once, for every module that overrides it, when the scan
    /// pipeline enters its terminal ERROR phase. Runs
    /// after a phase failure and before EXIT; a module with nothing to
    /// clean up simply leaves this as a no-op.
    fn on_error(&self, _ctx: &CommonContext, _dev: &DeviceHandle) {}
}

/// Ordered dispatch table: block modules run before type modules at every
/// phase.
#[derive(Default)]
pub struct ModuleRegistry {
    block_modules: Vec<Box<dyn ScanModule>>,
    type_modules: Vec<Box<dyn ScanModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_block(&mut self, module: Box<dyn ScanModule>) {
        self.block_modules.push(module);
    }

    pub fn register_type(&mut self, module: Box<dyn ScanModule>) {
        self.type_modules.push(module);
    }

    pub fn modules(&self) -> impl Iterator<Item = &dyn ScanModule> {
        self.block_modules.iter().chain(self.type_modules.iter()).map(|m| m.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Recorder {
        seen: std::sync::Mutex<Vec<&'static str>>,
    }

    impl ScanModule for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn ident(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
            self.seen.lock().unwrap().push("ident");
            Ok(ModuleSignal::Continue)
        }
        fn scan_current(&self, _ctx: &CommonContext, _dev: &DeviceHandle) -> ModuleResult {
            self.seen.lock().unwrap().push("scan_current");
            Ok(ModuleSignal::TriggerAction)
        }
    }

    #[test]
    fn block_modules_run_before_type_modules() {
        let mut registry = ModuleRegistry::new();
        registry.register_type(Box::new(Recorder { seen: Default::default() }));
        registry.register_block(Box::new(Recorder { seen: Default::default() }));
        let names: Vec<&str> = registry.modules().map(|m| m.name()).collect();
        assert_eq!(names, vec!["recorder", "recorder"]);
    }

    #[test]
    fn default_callbacks_continue() {
        struct Noop;
        impl ScanModule for Noop {
            fn name(&self) -> &str {
                "noop"
            }
        }
        let ctx = CommonContext::new(Uuid::new_v4());
        let dev = DeviceHandle {
            major_minor: "8_0".into(),
            devpath: "/block/sda".into(),
            parent_major_minor: None,
            slaves: vec![],
            properties: vec![],
        };
        assert_eq!(Noop.ident(&ctx, &dev).unwrap(), ModuleSignal::Continue);
    }
}

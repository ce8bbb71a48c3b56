//! The scan pipeline.
//!
//! Drives a [`DeviceHandle`] through the fixed phase sequence, dispatching
//! each phase's callback across every registered module (block modules
//! before type modules, per [`ModuleRegistry`]) and honoring a module's
//! request to run a TRIGGER_ACTION phase or abort the scan outright.

use std::sync::Arc;

use crate::context::CommonContext;
use crate::delta::{self, DeltaOp};
use crate::error::CommandError;
use crate::keys::{Domain, Key, Namespace};
use crate::kv::{MergeOp, PredicateDecision, RecordBody, RecordFlags};
use crate::module::{DeviceHandle, ModuleRegistry, ModuleSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanPhase {
    Init,
    Ident,
    ScanPre,
    ScanCurrent,
    TriggerActionCurrent,
    ScanNext,
    TriggerActionNext,
    ScanPostCurrent,
    ScanPostNext,
    Waiting,
    Exit,
    Error,
}

impl ScanPhase {
    pub fn label(self) -> &'static str {
        match self {
            ScanPhase::Init => "INIT",
            ScanPhase::Ident => "IDENT",
            ScanPhase::ScanPre => "SCAN_PRE",
            ScanPhase::ScanCurrent => "SCAN_CURRENT",
            ScanPhase::TriggerActionCurrent => "TRIGGER_ACTION_CURRENT",
            ScanPhase::ScanNext => "SCAN_NEXT",
            ScanPhase::TriggerActionNext => "TRIGGER_ACTION_NEXT",
            ScanPhase::ScanPostCurrent => "SCAN_POST_CURRENT",
            ScanPhase::ScanPostNext => "SCAN_POST_NEXT",
            ScanPhase::Waiting => "WAITING",
            ScanPhase::Exit => "EXIT",
            ScanPhase::Error => "ERROR",
        }
    }
}

/// The outcome of running a [`ScanPipeline`] to completion: the phase
/// history actually traversed (always a prefix of the declared order)
/// and, if the scan entered `ERROR`, the failure
/// that put it there. `ERROR` is always followed by `EXIT` in `history`,
/// so callers that only care whether the
/// scan ultimately succeeded should check `failure`, not the last history
/// entry.
#[derive(Debug)]
pub struct ScanOutcome {
    pub history: Vec<ScanPhase>,
    pub failure: Option<CommandError>,
}

impl ScanOutcome {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Drives one device's scan through [`ScanPhase::Init`] .. [`ScanPhase::Exit`].
pub struct ScanPipeline<'a> {
    ctx: Arc<CommonContext>,
    registry: &'a ModuleRegistry,
    device: DeviceHandle,
    phase: ScanPhase,
    history: Vec<ScanPhase>,
    failure: Option<CommandError>,
    /// Identifies the worker that ran this scan, stamped into
    /// `:U:<mm>::SID_SESSION_ID` at INIT.
    session_id: uuid::Uuid,
}

impl<'a> ScanPipeline<'a> {
    pub fn new(ctx: Arc<CommonContext>, registry: &'a ModuleRegistry, device: DeviceHandle) -> Self {
        Self::with_session_id(ctx, registry, device, uuid::Uuid::new_v4())
    }

    pub fn with_session_id(
        ctx: Arc<CommonContext>,
        registry: &'a ModuleRegistry,
        device: DeviceHandle,
        session_id: uuid::Uuid,
    ) -> Self {
        Self {
            ctx,
            registry,
            device,
            phase: ScanPhase::Init,
            history: Vec::new(),
            failure: None,
            session_id,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn history(&self) -> &[ScanPhase] {
        &self.history
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Run the full sequence to completion (`EXIT`), entering `ERROR` first
    /// if any non-`INIT`/`EXIT` phase fails. `ERROR` is terminal-once: once
    /// entered, every module's [`crate::module::ScanModule::on_error`] runs
    /// exactly once and the scan then proceeds straight to `EXIT` —
    /// it never loops back into `ERROR` again.
    pub fn run(mut self) -> ScanOutcome {
        loop {
            self.history.push(self.phase);
            self.ctx.set_current_phase(Some(self.phase));
            match self.phase {
                ScanPhase::Init => {
                    self.init_device_state();
                    self.import_udev_env();
                    self.refresh_hierarchy();
                    self.phase = ScanPhase::Ident;
                }
                ScanPhase::Ident => {
                    self.resolve_current_module();
                    self.dispatch(ScanPhase::ScanPre, |m, ctx, dev| m.ident(ctx, dev))
                }
                ScanPhase::ScanPre => self.dispatch(ScanPhase::ScanCurrent, |m, ctx, dev| m.scan_pre(ctx, dev)),
                ScanPhase::ScanCurrent => {
                    self.dispatch_with_trigger(
                        ScanPhase::ScanNext,
                        ScanPhase::TriggerActionCurrent,
                        |m, ctx, dev| m.scan_current(ctx, dev),
                    );
                }
                ScanPhase::TriggerActionCurrent => {
                    self.dispatch(ScanPhase::ScanNext, |m, ctx, dev| m.trigger_action_current(ctx, dev))
                }
                ScanPhase::ScanNext => {
                    self.dispatch_with_trigger(
                        ScanPhase::ScanPostCurrent,
                        ScanPhase::TriggerActionNext,
                        |m, ctx, dev| m.scan_next(ctx, dev),
                    );
                }
                ScanPhase::TriggerActionNext => {
                    self.dispatch(ScanPhase::ScanPostCurrent, |m, ctx, dev| m.trigger_action_next(ctx, dev))
                }
                ScanPhase::ScanPostCurrent => {
                    self.dispatch(ScanPhase::ScanPostNext, |m, ctx, dev| m.scan_post_current(ctx, dev))
                }
                ScanPhase::ScanPostNext => {
                    self.dispatch(ScanPhase::Waiting, |m, ctx, dev| m.scan_post_next(ctx, dev))
                }
                ScanPhase::Waiting => self.phase = ScanPhase::Exit,
                ScanPhase::Exit => {
                    self.ctx.set_current_phase(None);
                    return ScanOutcome { history: self.history, failure: self.failure };
                }
                ScanPhase::Error => {
                    for module in self.registry.modules() {
                        module.on_error(&self.ctx, &self.device);
                    }
                    self.phase = ScanPhase::Exit;
                }
            }
        }
    }

    /// INIT initializes device-scoped `READY`/`RESERVED` to `UNPROCESSED` if
    /// absent. Core-owned; runs before any module sees the device.
    fn init_device_state(&mut self) {
        let gennum = self.ctx.current_generation();
        let seqnum = self.device.seqnum();
        self.ctx.init_device_state_if_absent(&self.device.major_minor, gennum, seqnum);
    }

    /// IDENT's own job: resolve the device's driver/type module name.
    /// Reuses a prior DEVICE-scoped record if a previous scan of this
    /// device already cached one; otherwise scans `/proc/devices` for the
    /// "Block devices:" section and matches the device's major number,
    /// caching whatever is found so later scans of the same device (and
    /// the reserved-key source `SCAN_NEXT`'s next-module dispatch reads
    /// from) don't depend on re-parsing `/proc/devices`.
    fn resolve_current_module(&mut self) {
        if self.ctx.current_module(&self.device.major_minor).is_some() {
            return;
        }
        let Some(major) = major_number(&self.device.major_minor) else { return };
        let Some(name) = read_proc_devices_block_driver(major) else { return };
        let gennum = self.ctx.current_generation();
        let seqnum = self.device.seqnum();
        self.ctx.set_current_module(&self.device.major_minor, &name, gennum, seqnum);
    }

    /// Import the device's udev environment into the UDEV namespace as
    /// individual blob records (udev re-export reads back from this
    /// same namespace), plus the reserved `SID_SESSION_ID` key identifying
    /// which worker processed this device.
    fn import_udev_env(&mut self) {
        let gennum = self.ctx.current_generation();
        let seqnum = self.device.seqnum();
        let mm = self.device.major_minor.clone();
        let mut store = self.ctx.store_mut();
        for (prop_key, value) in &self.device.properties {
            let key = Key::new(Namespace::Udev, &mm, prop_key.clone()).compose();
            let _ = store.set(
                &key,
                crate::context::CORE_OWNER,
                RecordFlags::empty(),
                RecordBody::Blob(value.clone().into_bytes()),
                gennum,
                seqnum,
                MergeOp::NoOp,
                |_, _, _| PredicateDecision::accept(),
            );
        }
        let session_key = Key::new(Namespace::Udev, &mm, "SID_SESSION_ID").compose();
        let _ = store.set(
            &session_key,
            crate::context::CORE_OWNER,
            RecordFlags::empty(),
            RecordBody::Blob(self.session_id.to_string().into_bytes()),
            gennum,
            seqnum,
            MergeOp::NoOp,
            |_, _, _| PredicateDecision::accept(),
        );
    }

    /// Re-derive the device's hierarchy (parent/slave relationships) before
    /// IDENT runs, as part of INIT: for a whole disk, union each already-resolved
    /// slave's `major_minor` into this device's `LYR:DEVICE:<mm>::GMB`
    /// (group-members) vector via a relation-propagating SET, so
    /// the inverse relation (slave -> group) stays in sync; for a partition,
    /// union just the parent disk's `major_minor` in the same way. Walking
    /// `/sys/.../slaves` or the parent `dev` number itself is the bridge's
    /// job — by the time a `DeviceHandle` reaches this
    /// pipeline that walk is already done and recorded on `slaves`/
    /// `parent_major_minor`.
    fn refresh_hierarchy(&mut self) {
        let members: Vec<Vec<u8>> = if let Some(parent) = &self.device.parent_major_minor {
            vec![parent.clone().into_bytes()]
        } else {
            let mut slaves: Vec<Vec<u8>> = self.device.slaves.iter().map(|s| s.clone().into_bytes()).collect();
            slaves.sort();
            slaves.dedup();
            slaves
        };
        if members.is_empty() {
            return;
        }

        let gennum = self.ctx.current_generation();
        let seqnum = self.device.seqnum();
        let gmb_key = Key::device(self.device.major_minor.clone(), "GMB").with_dom(Domain::Layer);
        let mut store = self.ctx.store_mut();
        let composed = gmb_key.compose();
        let old = store.get(&composed).and_then(|r| r.as_vector()).map(|v| v.to_vec()).unwrap_or_default();
        let Ok(result) = delta::compute_delta(&old, &members, DeltaOp::Set) else { return };
        let _ = delta::write_delta(&mut store, &composed, crate::context::CORE_OWNER, RecordFlags::SYNC, gennum, seqnum, &result);
        let _ = delta::apply_with_rel(
            &mut store,
            &gmb_key,
            self.device.major_minor.as_bytes(),
            &result,
            crate::context::CORE_OWNER,
            gennum,
            seqnum,
        );
    }

    /// Fan out one phase callback across every registered module, in
    /// registration order (block modules before type modules). A module
    /// returning `Abort` or `Err` marks the current phase failed and moves
    /// the pipeline to `ERROR` without running the remaining modules for
    /// this phase.
    fn dispatch(
        &mut self,
        next: ScanPhase,
        callback: impl Fn(&dyn crate::module::ScanModule, &CommonContext, &DeviceHandle) -> crate::module::ModuleResult,
    ) {
        let phase = self.phase;
        for module in self.registry.modules() {
            match callback(module, &self.ctx, &self.device) {
                Ok(ModuleSignal::Continue) | Ok(ModuleSignal::TriggerAction) => {}
                Ok(ModuleSignal::Abort) => {
                    self.enter_error(CommandError::ModuleFailure {
                        module: module.name().to_string(),
                        phase: phase.label(),
                    });
                    return;
                }
                Err(e) => {
                    self.enter_error(e);
                    return;
                }
            }
        }
        self.phase = next;
    }

    fn dispatch_with_trigger(
        &mut self,
        next: ScanPhase,
        trigger_phase: ScanPhase,
        callback: impl Fn(&dyn crate::module::ScanModule, &CommonContext, &DeviceHandle) -> crate::module::ModuleResult,
    ) {
        let phase = self.phase;
        let mut wants_trigger = false;
        for module in self.registry.modules() {
            match callback(module, &self.ctx, &self.device) {
                Ok(ModuleSignal::Continue) => {}
                Ok(ModuleSignal::TriggerAction) => wants_trigger = true,
                Ok(ModuleSignal::Abort) => {
                    self.enter_error(CommandError::ModuleFailure {
                        module: module.name().to_string(),
                        phase: phase.label(),
                    });
                    return;
                }
                Err(e) => {
                    self.enter_error(e);
                    return;
                }
            }
        }
        self.phase = if wants_trigger { trigger_phase } else { next };
    }

    fn enter_error(&mut self, failure: CommandError) {
        self.phase = ScanPhase::Error;
        // First failure wins; INIT/EXIT never call `enter_error`, so ERROR
        // is reached at most once per scan.
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }
}

/// Extract the major number from a `major_minor` string of the form
/// `"<major>_<minor>"`.
fn major_number(major_minor: &str) -> Option<u32> {
    major_minor.split_once('_')?.0.parse().ok()
}

/// Parse `/proc/devices`' "Block devices:" section, returning the driver
/// name registered against `major` (e.g. `"sd"` for major `8`). Returns
/// `None` if the file is unreadable, has no Block devices section, or no
/// line in that section matches `major`.
fn read_proc_devices_block_driver(major: u32) -> Option<String> {
    let contents = std::fs::read_to_string("/proc/devices").ok()?;
    parse_proc_devices_block_driver(&contents, major)
}

fn parse_proc_devices_block_driver(contents: &str, major: u32) -> Option<String> {
    let mut in_block_section = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            in_block_section = false;
            continue;
        }
        if line.eq_ignore_ascii_case("Block devices:") {
            in_block_section = true;
            continue;
        }
        if !in_block_section {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let (Some(maj_str), Some(name)) = (parts.next(), parts.next()) else { continue };
        if maj_str.trim().parse::<u32>() == Ok(major) {
            return Some(name.trim().to_string());
        }
    }
    None
}

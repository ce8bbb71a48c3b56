//! The common context shared by every command executed in a process —
//! the KV store handle, the generation counter
//! every write stamps itself with, and a scratch buffer reused across scan
//! phases to avoid a fresh allocation per property emitted.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::buffer::ByteBuffer;
use crate::error::CommandError;
use crate::keys::{Key, Namespace};
use crate::kv::{KvStore, MergeOp, PredicateDecision, RecordBody, RecordFlags};
use crate::scan::ScanPhase;

/// Reserved key name the device *ready* state is stored under, device-scoped:
/// INIT initializes device-scoped READY/RESERVED records to UNPROCESSED.
pub const READY_KEY_CORE: &str = "#RDY";
/// Reserved key name the device *reserved* state is stored under.
pub const RESERVED_KEY_CORE: &str = "#RES";
/// Owner name core itself writes records under (INIT's default
/// initialization, as opposed to any loaded module).
pub const CORE_OWNER: &str = "sid-core";

/// Reserved key name the device's resolved driver/type module name is
/// cached under, device-scoped: IDENT checks this before falling back to
/// scanning `/proc/devices`.
pub const CURRENT_MOD_KEY: &str = "SID_CUR_MOD";
/// Reserved key name naming the next-layer type module to dispatch from
/// `SCAN_NEXT` onward, device-scoped. Set by whichever module decides the
/// next layer (e.g. a partition-table module naming the partition type
/// module once it has enumerated a disk's partitions).
pub const NEXT_MOD_KEY: &str = "SID_NEXT_MOD";

/// The device *ready* state value. Only
/// `SCAN_PRE`/`SCAN_CURRENT` may set this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Unprocessed,
    Public,
    Private,
}

impl ReadyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadyState::Unprocessed => "UNPROCESSED",
            ReadyState::Public => "PUBLIC",
            ReadyState::Private => "PRIVATE",
        }
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"UNPROCESSED" => Some(ReadyState::Unprocessed),
            b"PUBLIC" => Some(ReadyState::Public),
            b"PRIVATE" => Some(ReadyState::Private),
            _ => None,
        }
    }
}

/// The device *reserved* state value. Only `SCAN_NEXT` may set this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedState {
    Unprocessed,
    Reserved,
}

impl ReservedState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedState::Unprocessed => "UNPROCESSED",
            ReservedState::Reserved => "RESERVED",
        }
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"UNPROCESSED" => Some(ReservedState::Unprocessed),
            b"RESERVED" => Some(ReservedState::Reserved),
            _ => None,
        }
    }
}

/// Per-process context. One instance lives for the lifetime of a worker or
/// proxy process; cloned `Arc<CommonContext>` handles are handed to whatever
/// needs store access (scan phases, command execution, bridge handlers).
pub struct CommonContext {
    store: RwLock<KvStore>,
    gennum: AtomicU64,
    boot_id: Uuid,
    scratch: RwLock<ByteBuffer>,
    /// The scan phase currently dispatching a module callback, set by
    /// [`crate::scan::ScanPipeline`] before each phase's fan-out and cleared
    /// at `EXIT`. Per-process, not per-thread,
    /// and safe without synchronization because the concurrency model is
    /// single-threaded cooperative — a `RwLock` is used here only because
    /// `CommonContext` itself is shared via `Arc` across `async` tasks, not
    /// because concurrent writers are expected.
    current_phase: RwLock<Option<ScanPhase>>,
}

impl CommonContext {
    /// `boot_id` identifies this daemon incarnation; it is stamped into
    /// records so a worker can tell a stale generation's leftovers apart
    /// from the current one after a restart.
    pub fn new(boot_id: Uuid) -> Self {
        Self {
            store: RwLock::new(KvStore::new()),
            gennum: AtomicU64::new(1),
            boot_id,
            scratch: RwLock::new(ByteBuffer::new()),
            current_phase: RwLock::new(None),
        }
    }

    /// Called by [`crate::scan::ScanPipeline`] before dispatching each
    /// phase's module fan-out, so that [`Self::set_ready`]/[`Self::set_reserved`]
    /// can enforce the phase-capability table against whichever phase
    /// is actually driving the callback that's calling them.
    pub fn set_current_phase(&self, phase: Option<ScanPhase>) {
        *self.current_phase.write() = phase;
    }

    pub fn current_phase(&self) -> Option<ScanPhase> {
        *self.current_phase.read()
    }

    fn ready_key(dev_mm: &str) -> Vec<u8> {
        Key::new(Namespace::Device, dev_mm, READY_KEY_CORE).compose()
    }

    fn reserved_key(dev_mm: &str) -> Vec<u8> {
        Key::new(Namespace::Device, dev_mm, RESERVED_KEY_CORE).compose()
    }

    fn current_module_key(dev_mm: &str) -> Vec<u8> {
        Key::new(Namespace::Device, dev_mm, CURRENT_MOD_KEY).compose()
    }

    fn next_module_key(dev_mm: &str) -> Vec<u8> {
        Key::new(Namespace::Device, dev_mm, NEXT_MOD_KEY).compose()
    }

    /// The device's cached driver/type module name, if IDENT has already
    /// resolved one for it (on this or a prior scan of the same device).
    pub fn current_module(&self, dev_mm: &str) -> Option<String> {
        self.store()
            .get(&Self::current_module_key(dev_mm))
            .and_then(|r| r.as_blob())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Cache the device's resolved driver/type module name. Core-owned,
    /// same as the READY/RESERVED initialization.
    pub fn set_current_module(&self, dev_mm: &str, name: &str, gennum: u64, seqnum: u64) {
        let key = Self::current_module_key(dev_mm);
        let _ = self.store_mut().set(
            &key,
            CORE_OWNER,
            RecordFlags::empty(),
            RecordBody::Blob(name.as_bytes().to_vec()),
            gennum,
            seqnum,
            MergeOp::NoOp,
            |_, _, _| PredicateDecision::accept(),
        );
    }

    /// The next-layer type module name a prior phase (typically SCAN_CURRENT
    /// or TRIGGER_ACTION_CURRENT) stored for this device, if any.
    pub fn next_module(&self, dev_mm: &str) -> Option<String> {
        self.store()
            .get(&Self::next_module_key(dev_mm))
            .and_then(|r| r.as_blob())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Name the next-layer type module to dispatch from `SCAN_NEXT` onward.
    /// Any module may set this; it is not restricted to a particular phase.
    pub fn set_next_module(&self, dev_mm: &str, name: &str, gennum: u64, seqnum: u64) {
        let key = Self::next_module_key(dev_mm);
        let _ = self.store_mut().set(
            &key,
            CORE_OWNER,
            RecordFlags::empty(),
            RecordBody::Blob(name.as_bytes().to_vec()),
            gennum,
            seqnum,
            MergeOp::NoOp,
            |_, _, _| PredicateDecision::accept(),
        );
    }

    pub fn get_ready(&self, dev_mm: &str) -> Option<ReadyState> {
        self.store().get(&Self::ready_key(dev_mm)).and_then(|r| r.as_blob()).and_then(ReadyState::from_bytes)
    }

    pub fn get_reserved(&self, dev_mm: &str) -> Option<ReservedState> {
        self.store().get(&Self::reserved_key(dev_mm)).and_then(|r| r.as_blob()).and_then(ReservedState::from_bytes)
    }

    /// INIT's own initialization of a fresh device's READY/RESERVED records
    /// to `UNPROCESSED` if absent. Core-owned, bypassing the phase
    /// capability check below since INIT is core-only, the same as EXIT.
    pub fn init_device_state_if_absent(&self, dev_mm: &str, gennum: u64, seqnum: u64) {
        if self.get_ready(dev_mm).is_none() {
            let _ = self.write_ready(dev_mm, CORE_OWNER, ReadyState::Unprocessed, gennum, seqnum);
        }
        if self.get_reserved(dev_mm).is_none() {
            let _ = self.write_reserved(dev_mm, CORE_OWNER, ReservedState::Unprocessed, gennum, seqnum);
        }
    }

    /// Set a device's ready state. Only permitted while the pipeline is
    /// dispatching `SCAN_PRE` or `SCAN_CURRENT`; any other phase fails with
    /// `PhaseForbidden` — e.g. `SCAN_POST_CURRENT` calling this returns
    /// `EPERM`.
    pub fn set_ready(
        &self,
        dev_mm: &str,
        owner: &str,
        value: ReadyState,
        gennum: u64,
        seqnum: u64,
    ) -> Result<(), CommandError> {
        match self.current_phase() {
            Some(ScanPhase::ScanPre) | Some(ScanPhase::ScanCurrent) => {
                self.write_ready(dev_mm, owner, value, gennum, seqnum).map_err(CommandError::Kv)
            }
            other => Err(CommandError::PhaseForbidden { phase: other.map(ScanPhase::label).unwrap_or("NONE") }),
        }
    }

    /// Set a device's reservation state. Only permitted during `SCAN_NEXT`.
    pub fn set_reserved(
        &self,
        dev_mm: &str,
        owner: &str,
        value: ReservedState,
        gennum: u64,
        seqnum: u64,
    ) -> Result<(), CommandError> {
        match self.current_phase() {
            Some(ScanPhase::ScanNext) => {
                self.write_reserved(dev_mm, owner, value, gennum, seqnum).map_err(CommandError::Kv)
            }
            other => Err(CommandError::PhaseForbidden { phase: other.map(ScanPhase::label).unwrap_or("NONE") }),
        }
    }

    fn write_ready(
        &self,
        dev_mm: &str,
        owner: &str,
        value: ReadyState,
        gennum: u64,
        seqnum: u64,
    ) -> Result<(), crate::error::KvError> {
        let key = Self::ready_key(dev_mm);
        self.store_mut()
            .set(
                &key,
                owner,
                RecordFlags::empty(),
                RecordBody::Blob(value.as_str().as_bytes().to_vec()),
                gennum,
                seqnum,
                MergeOp::NoOp,
                |_, _, _| PredicateDecision::accept(),
            )
            .map(|_| ())
    }

    fn write_reserved(
        &self,
        dev_mm: &str,
        owner: &str,
        value: ReservedState,
        gennum: u64,
        seqnum: u64,
    ) -> Result<(), crate::error::KvError> {
        let key = Self::reserved_key(dev_mm);
        self.store_mut()
            .set(
                &key,
                owner,
                RecordFlags::empty(),
                RecordBody::Blob(value.as_str().as_bytes().to_vec()),
                gennum,
                seqnum,
                MergeOp::NoOp,
                |_, _, _| PredicateDecision::accept(),
            )
            .map(|_| ())
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    /// The generation number every in-flight write should stamp its record
    /// with. Does not advance the counter; see [`Self::advance_generation`].
    pub fn current_generation(&self) -> u64 {
        self.gennum.load(Ordering::Acquire)
    }

    /// Advance the generation counter, returning the new value. Called once
    /// per scan-pipeline run so that records written during this run are
    /// distinguishable, by generation, from a prior run over the same
    /// device.
    pub fn advance_generation(&self) -> u64 {
        self.gennum.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn store(&self) -> parking_lot::RwLockReadGuard<'_, KvStore> {
        self.store.read()
    }

    pub fn store_mut(&self) -> parking_lot::RwLockWriteGuard<'_, KvStore> {
        self.store.write()
    }

    /// Borrow the reusable scratch buffer for the duration of `f`, clearing
    /// it first. Kept on the context so phase handlers that emit udev
    /// properties don't each allocate their own `ByteBuffer`.
    pub fn with_scratch<R>(&self, f: impl FnOnce(&mut ByteBuffer) -> R) -> R {
        let mut scratch = self.scratch.write();
        scratch.clear();
        f(&mut scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_monotonically_increases() {
        let ctx = CommonContext::new(Uuid::new_v4());
        let g0 = ctx.current_generation();
        let g1 = ctx.advance_generation();
        let g2 = ctx.advance_generation();
        assert!(g1 > g0);
        assert!(g2 > g1);
    }

    #[test]
    fn scratch_is_cleared_between_uses() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.with_scratch(|buf| buf.push_property("A", "1"));
        ctx.with_scratch(|buf| {
            assert!(buf.is_empty());
            buf.push_property("B", "2");
        });
    }

    #[test]
    fn init_device_state_sets_unprocessed_if_absent() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.init_device_state_if_absent("8_0", 1, 42);
        assert_eq!(ctx.get_ready("8_0"), Some(ReadyState::Unprocessed));
        assert_eq!(ctx.get_reserved("8_0"), Some(ReservedState::Unprocessed));
    }

    #[test]
    fn init_device_state_does_not_clobber_existing() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.set_current_phase(Some(ScanPhase::ScanCurrent));
        ctx.set_ready("8_0", "driver-sd", ReadyState::Public, 1, 42).unwrap();
        ctx.set_current_phase(None);
        ctx.init_device_state_if_absent("8_0", 2, 43);
        assert_eq!(ctx.get_ready("8_0"), Some(ReadyState::Public));
    }

    #[test]
    fn set_ready_forbidden_outside_scan_pre_or_current() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.set_current_phase(Some(ScanPhase::ScanPostCurrent));
        let err = ctx.set_ready("8_0", "driver-sd", ReadyState::Public, 1, 1).unwrap_err();
        assert!(matches!(err, CommandError::PhaseForbidden { phase: "SCAN_POST_CURRENT" }));
        assert_eq!(ctx.get_ready("8_0"), None);
    }

    #[test]
    fn set_ready_permitted_during_scan_current() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.set_current_phase(Some(ScanPhase::ScanCurrent));
        ctx.set_ready("8_0", "driver-sd", ReadyState::Public, 1, 1).unwrap();
        assert_eq!(ctx.get_ready("8_0"), Some(ReadyState::Public));
    }

    #[test]
    fn current_and_next_module_round_trip() {
        let ctx = CommonContext::new(Uuid::new_v4());
        assert_eq!(ctx.current_module("8_0"), None);
        ctx.set_current_module("8_0", "sd", 1, 1);
        assert_eq!(ctx.current_module("8_0"), Some("sd".to_string()));

        assert_eq!(ctx.next_module("8_0"), None);
        ctx.set_next_module("8_0", "partition", 1, 1);
        assert_eq!(ctx.next_module("8_0"), Some("partition".to_string()));
    }

    #[test]
    fn set_reserved_only_permitted_during_scan_next() {
        let ctx = CommonContext::new(Uuid::new_v4());
        ctx.set_current_phase(Some(ScanPhase::ScanCurrent));
        assert!(ctx.set_reserved("8_0", "driver-sd", ReservedState::Reserved, 1, 1).is_err());
        ctx.set_current_phase(Some(ScanPhase::ScanNext));
        ctx.set_reserved("8_0", "driver-sd", ReservedState::Reserved, 1, 1).unwrap();
        assert_eq!(ctx.get_reserved("8_0"), Some(ReservedState::Reserved));
    }
}

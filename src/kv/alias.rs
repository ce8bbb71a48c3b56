//! Index-alias helpers layered on top of [`super::store::KvStore`].
//!
//! The alias mechanism itself — rewriting a key's leading byte to `>` and
//! iterating the `[">", "?")` range — lives in [`crate::keys`] (the byte
//! transform) and [`super::store`] (the `Slot::Alias` bookkeeping that
//! keeps `set`/`unset` consistent with it). This module holds the
//! higher-level predicate used by delta/command code to decide whether a
//! write should flip the SYNC flag, without needing to poke at store
//! internals directly.

use super::record::RecordFlags;

/// Whether flipping from `old_flags` to `new_flags` should add, remove, or
/// leave alone a record's SYNC alias. `KvStore::set` already performs this
/// comparison internally; this function exists so callers that need to
/// predict the outcome (e.g. to size a batched sync response) can do so
/// without performing the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasTransition {
    Add,
    Remove,
    Unchanged,
}

pub fn alias_transition(old_flags: Option<RecordFlags>, new_flags: RecordFlags) -> AliasTransition {
    let had_sync = old_flags.map(|f| f.contains(RecordFlags::SYNC)).unwrap_or(false);
    let wants_sync = new_flags.contains(RecordFlags::SYNC);
    match (had_sync, wants_sync) {
        (false, true) => AliasTransition::Add,
        (true, false) => AliasTransition::Remove,
        _ => AliasTransition::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert_eq!(alias_transition(None, RecordFlags::SYNC), AliasTransition::Add);
        assert_eq!(alias_transition(Some(RecordFlags::SYNC), RecordFlags::empty()), AliasTransition::Remove);
        assert_eq!(alias_transition(Some(RecordFlags::SYNC), RecordFlags::SYNC), AliasTransition::Unchanged);
        assert_eq!(alias_transition(None, RecordFlags::empty()), AliasTransition::Unchanged);
    }
}

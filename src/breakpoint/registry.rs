//! Breakpoint registry
//!
//! Owned by the coordinator thread. Every state change that affects what
//! the threads see goes through [`Registry::activate`] or
//! [`Registry::deactivate`], which keep the shared hook table in sync.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use super::hooks::{Hook, HookTable, HookTarget};
use super::resolve::resolve_location;
use super::{Breakpoint, BreakpointId, BreakpointKey, BreakpointKind, BreakpointState};
use crate::common::{Error, Result};
use crate::runtime::Runtime;

/// Result of [`Registry::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Registered at this listing index
    Added { id: BreakpointId, index: usize },
    /// Rejected; an equal key is already registered at `index`
    Duplicate { index: usize },
}

/// Snapshot of a breakpoint that just fired
#[derive(Debug, Clone)]
pub struct HitRecord {
    pub index: usize,
    pub description: String,
    pub breakpoint: Breakpoint,
}

pub struct Registry {
    entries: Vec<Breakpoint>,
    hooks: Arc<RwLock<HookTable>>,
    next_id: BreakpointId,
    notices: Vec<String>,
}

impl Registry {
    pub fn new(hooks: Arc<RwLock<HookTable>>) -> Self {
        Self {
            entries: Vec::new(),
            hooks,
            next_id: 1,
            notices: Vec::new(),
        }
    }

    /// Register a breakpoint and try to activate it
    ///
    /// A non-oneshot breakpoint whose key is already registered is disabled
    /// and rejected. Activation failures are not errors: the breakpoint
    /// stays pending or disabled and a notice is queued.
    pub fn add(&mut self, mut bp: Breakpoint, runtime: &dyn Runtime) -> AddOutcome {
        if let Some(index) = self.duplicate_of(&bp, None) {
            bp.state = BreakpointState::Disabled;
            tracing::debug!(key = %bp.key(), "duplicate breakpoint rejected");
            return AddOutcome::Duplicate { index };
        }

        bp.id = self.next_id;
        self.next_id += 1;
        bp.state = BreakpointState::Pending;
        let id = bp.id;
        self.entries.push(bp);

        let pos = self.entries.len() - 1;
        if let Err(existing) = self.activate(pos, runtime) {
            // Resolution landed on a line that already has a breakpoint
            self.entries.remove(pos);
            return AddOutcome::Duplicate { index: existing };
        }

        AddOutcome::Added { id, index: pos }
    }

    /// Delete by listing index
    pub fn delete(&mut self, index: usize) -> Option<Breakpoint> {
        if index >= self.entries.len() {
            return None;
        }
        let mut bp = self.entries.remove(index);
        self.hooks_mut().remove(bp.id);
        bp.state = BreakpointState::Deleted;
        tracing::info!(id = bp.id, key = %bp.key(), "breakpoint deleted");
        Some(bp)
    }

    /// Delete by key
    pub fn delete_key(&mut self, key: &BreakpointKey) -> Option<Breakpoint> {
        let index = self.entries.iter().position(|bp| bp.key() == *key)?;
        self.delete(index)
    }

    /// Delete by internal id
    pub fn delete_id(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        let index = self.entries.iter().position(|bp| bp.id == id)?;
        self.delete(index)
    }

    /// Delete every breakpoint matching a predicate
    pub fn delete_where(&mut self, pred: impl Fn(&Breakpoint) -> bool) -> Vec<Breakpoint> {
        let ids: Vec<_> = self
            .entries
            .iter()
            .filter(|bp| pred(bp))
            .map(|bp| bp.id)
            .collect();
        ids.into_iter().filter_map(|id| self.delete_id(id)).collect()
    }

    pub fn delete_all(&mut self) -> Vec<Breakpoint> {
        self.delete_where(|_| true)
    }

    pub fn enable(&mut self, index: usize, runtime: &dyn Runtime) -> Result<()> {
        let bp = self
            .entries
            .get_mut(index)
            .ok_or(Error::BreakpointNotFound(index))?;
        if bp.state != BreakpointState::Disabled {
            return Ok(());
        }
        bp.state = BreakpointState::Pending;
        if let Err(existing) = self.activate(index, runtime) {
            if let Some(bp) = self.entries.get_mut(index) {
                bp.state = BreakpointState::Disabled;
            }
            return Err(Error::invalid(format!(
                "duplicated breakpoint: #{} already covers this location",
                existing
            )));
        }
        Ok(())
    }

    pub fn disable(&mut self, index: usize) -> Result<()> {
        let id = {
            let bp = self
                .entries
                .get_mut(index)
                .ok_or(Error::BreakpointNotFound(index))?;
            bp.state = BreakpointState::Disabled;
            bp.id
        };
        self.hooks_mut().remove(id);
        Ok(())
    }

    /// Retry pending breakpoints after new code was loaded
    ///
    /// Returns how many became active.
    pub fn on_load(&mut self, runtime: &dyn Runtime) -> usize {
        let pending: Vec<BreakpointId> = self
            .entries
            .iter()
            .filter(|bp| bp.state == BreakpointState::Pending && bp.needs_resolution())
            .map(|bp| bp.id)
            .collect();

        let mut activated = 0;
        for id in pending {
            let Some(pos) = self.position(id) else {
                continue;
            };
            match self.activate(pos, runtime) {
                Ok(()) => {
                    if self.entries[pos].state == BreakpointState::Active {
                        activated += 1;
                    }
                }
                Err(existing) => {
                    let bp = &mut self.entries[pos];
                    bp.state = BreakpointState::Disabled;
                    self.notices.push(format!(
                        "duplicated breakpoint: {} (same as #{})",
                        bp.describe(),
                        existing
                    ));
                }
            }
        }
        activated
    }

    /// Re-resolve every location breakpoint
    ///
    /// Hooks are reinstalled for breakpoints whose resolved location moved.
    pub fn rehash(&mut self, runtime: &dyn Runtime) {
        let units = runtime.loaded_units();
        for pos in 0..self.entries.len() {
            let bp = &self.entries[pos];
            let BreakpointKind::Line {
                path,
                line,
                hook_call,
                resolved,
            } = &bp.kind
            else {
                continue;
            };
            if bp.state != BreakpointState::Active {
                continue;
            }

            let fresh = resolve_location(&units, path, *line, *hook_call);
            if fresh == *resolved {
                continue;
            }

            tracing::debug!(id = bp.id, "breakpoint location changed on rehash");
            let id = bp.id;
            self.hooks_mut().remove(id);
            if let BreakpointKind::Line { resolved, .. } = &mut self.entries[pos].kind {
                *resolved = None;
            }
            self.entries[pos].state = BreakpointState::Pending;
            if let Err(existing) = self.activate(pos, runtime) {
                let bp = &mut self.entries[pos];
                bp.state = BreakpointState::Disabled;
                self.notices.push(format!(
                    "duplicated breakpoint: {} (same as #{})",
                    bp.describe(),
                    existing
                ));
            }
        }
    }

    /// Count a hit; oneshot breakpoints are deleted
    pub fn record_hit(&mut self, id: BreakpointId) -> Option<HitRecord> {
        let index = self.position(id)?;
        let bp = &mut self.entries[index];
        bp.hits += 1;
        let record = HitRecord {
            index,
            description: bp.describe(),
            breakpoint: bp.clone(),
        };
        if bp.oneshot {
            self.delete(index);
        }
        Some(record)
    }

    /// Live breakpoints in listing order
    pub fn list(&self) -> impl Iterator<Item = (usize, &Breakpoint)> {
        self.entries.iter().enumerate()
    }

    pub fn get(&self, index: usize) -> Option<&Breakpoint> {
        self.entries.get(index)
    }

    pub fn find(&self, id: BreakpointId) -> Option<(usize, &Breakpoint)> {
        self.entries.iter().enumerate().find(|(_, bp)| bp.id == id)
    }

    pub fn find_key(&self, key: &BreakpointKey) -> Option<(usize, &Breakpoint)> {
        self.entries.iter().enumerate().find(|(_, bp)| bp.key() == *key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain text notices produced by activation
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn position(&self, id: BreakpointId) -> Option<usize> {
        self.entries.iter().position(|bp| bp.id == id)
    }

    fn duplicate_of(&self, bp: &Breakpoint, skip: Option<BreakpointId>) -> Option<usize> {
        if bp.oneshot {
            return None;
        }
        let key = bp.key();
        self.entries
            .iter()
            .position(|other| Some(other.id) != skip && other.key() == key)
    }

    /// Try to make the breakpoint at `pos` active
    ///
    /// `Err(index)` means the resolved key collides with the breakpoint at
    /// `index`; the caller decides whether to drop or disable it.
    fn activate(&mut self, pos: usize, runtime: &dyn Runtime) -> std::result::Result<(), usize> {
        let id = self.entries[pos].id;

        let target = match &mut self.entries[pos].kind {
            BreakpointKind::Line {
                path,
                line,
                hook_call,
                resolved,
            } => {
                let units = runtime.loaded_units();
                let Some(loc) = resolve_location(&units, path, *line, *hook_call) else {
                    tracing::debug!(id, path = %path, line = *line, "breakpoint pending");
                    return Ok(());
                };
                if let Err(reason) = runtime.check_instrumentable(&loc.path, loc.line) {
                    let location = format!("{}:{}", loc.path, loc.line);
                    self.entries[pos].state = BreakpointState::Disabled;
                    self.notices
                        .push(Error::hook_registration(&location, &reason).to_string());
                    tracing::warn!(id, location = %location, reason = %reason, "hook registration failed");
                    return Ok(());
                }
                let target = HookTarget::Line {
                    path: loc.path.clone(),
                    line: loc.line,
                    event: loc.event,
                };
                *resolved = Some(loc);
                target
            }
            BreakpointKind::Method {
                owner,
                singleton,
                name,
                resolved,
            } => {
                let unit = runtime
                    .loaded_units()
                    .into_iter()
                    .find(|u| u.defines(owner, *singleton, name));
                let Some(unit) = unit else {
                    return Ok(());
                };
                *resolved = Some((unit.path.clone(), unit.first_line));
                HookTarget::Method {
                    owner: owner.clone(),
                    singleton: *singleton,
                    name: name.clone(),
                }
            }
            BreakpointKind::Catch { pattern } => HookTarget::Catch {
                pattern: pattern.clone(),
            },
            BreakpointKind::Watch {
                expr,
                receiver,
                initial,
            } => HookTarget::Watch {
                expr: expr.clone(),
                receiver: *receiver,
                current: Mutex::new(initial.clone()),
            },
            BreakpointKind::Check { expr } => HookTarget::Check { expr: expr.clone() },
        };

        let bp = &self.entries[pos];
        if let Some(existing) = self.duplicate_of(bp, Some(id)) {
            return Err(existing);
        }

        let hook = Hook {
            id,
            target,
            condition: bp.condition.clone(),
            oneshot: bp.oneshot,
        };
        self.hooks_mut().install(hook);
        self.entries[pos].state = BreakpointState::Active;
        tracing::info!(id, key = %self.entries[pos].key(), "breakpoint activated");
        Ok(())
    }

    fn hooks_mut(&self) -> RwLockWriteGuard<'_, HookTable> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CodeUnit, EventKind, Frame, NativeThreadId, UnitKind, Value};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Units {
        units: RwLock<Vec<Arc<CodeUnit>>>,
        refuse: Option<u32>,
    }

    impl Units {
        fn load(&self, unit: CodeUnit) {
            self.units.write().unwrap().push(Arc::new(unit));
        }
    }

    impl Runtime for Units {
        fn capture_frames(&self, _thread: NativeThreadId) -> Vec<Frame> {
            Vec::new()
        }
        fn evaluate(&self, _: NativeThreadId, _: &Frame, _: &str) -> std::result::Result<Value, String> {
            Err("unsupported".into())
        }
        fn live_threads(&self) -> Vec<NativeThreadId> {
            Vec::new()
        }
        fn loaded_units(&self) -> Vec<Arc<CodeUnit>> {
            self.units.read().unwrap().clone()
        }
        fn check_instrumentable(&self, _path: &str, line: u32) -> std::result::Result<(), String> {
            match self.refuse {
                Some(l) if l == line => Err("not instrumentable".into()),
                _ => Ok(()),
            }
        }
        fn terminate(&self, _code: i32) {}
    }

    fn script(lines: &[u32]) -> CodeUnit {
        CodeUnit {
            id: 1,
            path: "/app/file.rb".into(),
            name: "<main>".into(),
            owner: None,
            singleton: false,
            kind: UnitKind::Script,
            first_line: 1,
            last_line: 20,
            lines: lines
                .iter()
                .map(|l| (*l, vec![EventKind::Line]))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn registry() -> (Registry, Arc<RwLock<HookTable>>) {
        let hooks = Arc::new(RwLock::new(HookTable::default()));
        (Registry::new(Arc::clone(&hooks)), hooks)
    }

    #[test]
    fn test_pending_breakpoint_activates_on_load() {
        let (mut reg, hooks) = registry();
        let rt = Units::default();

        let outcome = reg.add(Breakpoint::line("/app/file.rb", 8, true), &rt);
        assert!(matches!(outcome, AddOutcome::Added { index: 0, .. }));
        assert_eq!(reg.get(0).unwrap().state, BreakpointState::Pending);
        assert!(hooks.read().unwrap().is_empty());

        rt.load(script(&[3, 10, 12]));
        assert_eq!(reg.on_load(&rt), 1);

        let bp = reg.get(0).unwrap();
        assert_eq!(bp.state, BreakpointState::Active);
        assert_eq!(bp.key(), BreakpointKey::Line("/app/file.rb".into(), 10));
        assert!(hooks.read().unwrap().has_line("/app/file.rb", 10));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let (mut reg, _) = registry();
        let rt = Units::default();
        rt.load(script(&[10]));

        assert!(matches!(
            reg.add(Breakpoint::line("/app/file.rb", 10, true), &rt),
            AddOutcome::Added { .. }
        ));
        assert_eq!(
            reg.add(Breakpoint::line("/app/file.rb", 10, true), &rt),
            AddOutcome::Duplicate { index: 0 }
        );
        assert_eq!(reg.len(), 1);

        // Resolving onto an occupied line is a duplicate too
        assert_eq!(
            reg.add(Breakpoint::line("/app/file.rb", 9, true), &rt),
            AddOutcome::Duplicate { index: 0 }
        );
        assert_eq!(reg.len(), 1);

        // Oneshot breakpoints may share a key
        assert!(matches!(
            reg.add(Breakpoint::line("/app/file.rb", 10, true).oneshot(), &rt),
            AddOutcome::Added { index: 1, .. }
        ));
    }

    #[test]
    fn test_hook_registration_failure_disables() {
        let (mut reg, hooks) = registry();
        let rt = Units {
            refuse: Some(10),
            ..Default::default()
        };
        rt.load(script(&[10]));

        reg.add(Breakpoint::line("/app/file.rb", 10, true), &rt);
        assert_eq!(reg.get(0).unwrap().state, BreakpointState::Disabled);
        assert!(hooks.read().unwrap().is_empty());

        let notices = reg.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("not instrumentable"));
    }

    #[test]
    fn test_delete_skips_in_listing() {
        let (mut reg, hooks) = registry();
        let rt = Units::default();
        rt.load(script(&[1, 2, 3]));

        for line in 1..=3 {
            reg.add(Breakpoint::line("/app/file.rb", line, true), &rt);
        }
        let removed = reg.delete(1).unwrap();
        assert_eq!(removed.state, BreakpointState::Deleted);
        assert_eq!(hooks.read().unwrap().len(), 2);

        let keys: Vec<_> = reg.list().map(|(i, bp)| (i, bp.key().to_string())).collect();
        assert_eq!(
            keys,
            vec![(0, "/app/file.rb:1".to_string()), (1, "/app/file.rb:3".to_string())]
        );
        assert!(reg.delete(5).is_none());
        assert!(reg.delete_key(&BreakpointKey::Line("/app/file.rb".into(), 3)).is_some());
        assert_eq!(reg.delete_all().len(), 1);
        assert!(hooks.read().unwrap().is_empty());
    }

    #[test]
    fn test_enable_disable() {
        let (mut reg, hooks) = registry();
        let rt = Units::default();
        reg.add(Breakpoint::catch("RuntimeError"), &rt);
        assert!(hooks.read().unwrap().contains(1));

        reg.disable(0).unwrap();
        assert!(!hooks.read().unwrap().contains(1));
        assert!(reg.get(0).unwrap().describe().ends_with("(disabled)"));

        reg.enable(0, &rt).unwrap();
        assert!(hooks.read().unwrap().contains(1));
        assert!(reg.disable(3).is_err());
    }

    #[test]
    fn test_oneshot_deleted_after_hit() {
        let (mut reg, hooks) = registry();
        let rt = Units::default();
        reg.add(Breakpoint::catch("RuntimeError").oneshot(), &rt);

        let hit = reg.record_hit(1).unwrap();
        assert_eq!(hit.index, 0);
        assert_eq!(hit.breakpoint.hits, 1);
        assert!(reg.is_empty());
        assert!(hooks.read().unwrap().is_empty());
    }

    #[test]
    fn test_method_breakpoint_waits_for_definition() {
        let (mut reg, _) = registry();
        let rt = Units::default();
        reg.add(Breakpoint::method("Foo#bar").unwrap(), &rt);
        assert_eq!(reg.get(0).unwrap().state, BreakpointState::Pending);

        let mut unit = script(&[2]);
        unit.id = 2;
        unit.kind = UnitKind::Method;
        unit.owner = Some("Foo".into());
        unit.name = "bar".into();
        unit.first_line = 2;
        rt.load(unit);

        assert_eq!(reg.on_load(&rt), 1);
        assert_eq!(
            reg.get(0).unwrap().describe(),
            "BP - Method  Foo#bar at /app/file.rb:2"
        );
    }

    #[test]
    fn test_rehash_moves_hook() {
        let (mut reg, hooks) = registry();
        let rt = Units::default();
        rt.load(script(&[10]));
        reg.add(Breakpoint::line("/app/file.rb", 5, true), &rt);
        assert!(hooks.read().unwrap().has_line("/app/file.rb", 10));

        // A newer version of the file gains a closer line
        rt.units.write().unwrap().clear();
        rt.load(script(&[6, 10]));
        reg.rehash(&rt);

        assert!(hooks.read().unwrap().has_line("/app/file.rb", 6));
        assert!(!hooks.read().unwrap().has_line("/app/file.rb", 10));
        assert_eq!(
            reg.get(0).unwrap().key(),
            BreakpointKey::Line("/app/file.rb".into(), 6)
        );
    }
}

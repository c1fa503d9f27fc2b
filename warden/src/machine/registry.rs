//! In-memory machine registry.
//!
//! Authoritative table of machines by id and by name (aliases included).
//! Readers take the read side; every mutation is writer-exclusive. The
//! invariant is that an id maps to a machine iff its name and all of its
//! aliases map to the same machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use warden_shared::{WardenError, WardenResult};

use super::Machine;

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<Machine>>,
    by_name: HashMap<String, Arc<Machine>>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a machine under its name and aliases.
    pub fn insert(&self, machine: Arc<Machine>) -> WardenResult<()> {
        let (name, aliases) = {
            let st = machine.lock();
            (st.record.name.clone(), st.record.aliases.clone())
        };

        let mut inner = self.write();
        if inner.by_id.contains_key(&machine.id) {
            return Err(WardenError::Internal(format!(
                "machine {} already registered",
                machine.id
            )));
        }
        for n in std::iter::once(&name).chain(aliases.iter()) {
            if inner.by_name.contains_key(n) {
                return Err(WardenError::NameTaken(n.clone()));
            }
        }

        inner.by_id.insert(machine.id.clone(), Arc::clone(&machine));
        inner.by_name.insert(name, Arc::clone(&machine));
        for alias in aliases {
            inner.by_name.insert(alias, Arc::clone(&machine));
        }
        Ok(())
    }

    /// Remove a machine and all of its names.
    pub fn remove(&self, id: &str) -> Option<Arc<Machine>> {
        let mut inner = self.write();
        let machine = inner.by_id.remove(id)?;
        inner
            .by_name
            .retain(|_, m| !Arc::ptr_eq(m, &machine));
        Some(machine)
    }

    /// Atomically move a machine's primary name. The new name must be free.
    pub fn rename(&self, id: &str, old_name: &str, new_name: &str) -> WardenResult<()> {
        let mut inner = self.write();
        let machine = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| WardenError::MachineNotFound(id.to_string()))?;

        match inner.by_name.get(new_name) {
            Some(owner) if !Arc::ptr_eq(owner, &machine) => {
                return Err(WardenError::NameTaken(new_name.to_string()));
            }
            _ => {}
        }
        match inner.by_name.get(old_name) {
            Some(owner) if Arc::ptr_eq(owner, &machine) => {}
            _ => {
                return Err(WardenError::Internal(format!(
                    "name {} is not owned by machine {}",
                    old_name, id
                )));
            }
        }

        inner.by_name.remove(old_name);
        inner.by_name.insert(new_name.to_string(), machine);
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Machine>> {
        self.read().by_id.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Machine>> {
        self.read().by_name.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Machine>> {
        self.read().by_id.values().cloned().collect()
    }

    pub fn count_non_builtin(&self) -> usize {
        self.read()
            .by_id
            .values()
            .filter(|m| !m.lock().record.builtin)
            .count()
    }

    /// Run `f` over every machine under the read lock; errors are joined and
    /// never short-circuit.
    pub fn for_each<F>(&self, mut f: F) -> WardenResult<()>
    where
        F: FnMut(&Arc<Machine>) -> WardenResult<()>,
    {
        let machines = self.list();
        let errors: Vec<_> = machines.iter().filter_map(|m| f(m).err()).collect();
        warden_shared::errors::join_errors(errors)
    }

    /// Check the id/name coherence invariant; test helper.
    #[cfg(test)]
    pub fn assert_coherent(&self) {
        let inner = self.read();
        for (id, machine) in &inner.by_id {
            let st = machine.lock();
            assert_eq!(&machine.id, id);
            for n in std::iter::once(&st.record.name).chain(st.record.aliases.iter()) {
                let owner = inner.by_name.get(n).expect("name missing from index");
                assert!(Arc::ptr_eq(owner, machine), "name {} owned by wrong machine", n);
            }
        }
        for (name, machine) in &inner.by_name {
            let st = machine.lock();
            assert!(
                st.record.name == *name || st.record.aliases.iter().any(|a| a == name),
                "stale name index entry {}",
                name
            );
        }
    }
}

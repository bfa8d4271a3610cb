//! DC handles and the live directory.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use relay_mtproto::auth_key::AuthKeyPtr;
use relay_mtproto::dc_id::{
    bare_dc_id, is_temporary_dc_id, real_id_from_temporary_dc_id, DcId, ShiftedDcId,
};

// ─── Dcenter ─────────────────────────────────────────────────────────────────

/// One data center as the orchestrator sees it: the bare id plus the
/// persistent authorization key, if one exists yet.
pub struct Dcenter {
    dc_id: DcId,
    key: Mutex<Option<AuthKeyPtr>>,
}

impl Dcenter {
    pub fn new(dc_id: DcId, key: Option<AuthKeyPtr>) -> Self {
        Self {
            dc_id,
            key: Mutex::new(key),
        }
    }

    pub fn dc_id(&self) -> DcId {
        self.dc_id
    }

    pub fn persistent_key(&self) -> Option<AuthKeyPtr> {
        self.key.lock().unwrap().clone()
    }

    pub fn set_persistent_key(&self, key: Option<AuthKeyPtr>) {
        *self.key.lock().unwrap() = key;
    }

    /// Clear the key if it is exactly the one the server confirmed destroyed.
    /// Returns `false` when the key already rotated to a different one.
    pub fn destroy_confirmed_forgotten_key(&self, key_id: u64) -> bool {
        let mut key = self.key.lock().unwrap();
        match key.as_ref() {
            Some(current) if current.key_id() == key_id => {
                *key = None;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Dcenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dcenter(dc={})", self.dc_id)
    }
}

// ─── Directory ───────────────────────────────────────────────────────────────

/// The in-memory map of shifted DC id → [`Dcenter`].
///
/// Removal only quarantines the handle in `to_destroy`: a Dcenter may be
/// removed from inside a callback it fired itself, so actual destruction is
/// deferred to a queued task on the orchestrator's event loop.
#[derive(Default)]
pub struct DcDirectory {
    dcenters: BTreeMap<ShiftedDcId, Arc<Dcenter>>,
    to_destroy: Vec<Arc<Dcenter>>,
}

impl DcDirectory {
    pub fn find(&self, shifted_dc_id: ShiftedDcId) -> Option<Arc<Dcenter>> {
        self.dcenters.get(&shifted_dc_id).cloned()
    }

    /// Insert a new Dcenter for `shifted_dc_id`, with an optional boot key.
    pub fn add(&mut self, shifted_dc_id: ShiftedDcId, key: Option<AuthKeyPtr>) -> Arc<Dcenter> {
        let dc = Arc::new(Dcenter::new(bare_dc_id(shifted_dc_id), key));
        self.dcenters.insert(shifted_dc_id, dc.clone());
        dc
    }

    pub fn remove(&mut self, shifted_dc_id: ShiftedDcId) {
        if let Some(dc) = self.dcenters.remove(&shifted_dc_id) {
            self.to_destroy.push(dc);
        }
    }

    /// Resolve a shifted id to its Dcenter, creating one lazily:
    /// 1. direct hit on the shifted id;
    /// 2. a temporary id resolves through its real DC id;
    /// 3. otherwise a fresh keyless Dcenter for the bare id.
    pub fn get_or_create(&mut self, shifted_dc_id: ShiftedDcId) -> Arc<Dcenter> {
        if let Some(dc) = self.find(shifted_dc_id) {
            return dc;
        }
        let dc_id = {
            let bare = bare_dc_id(shifted_dc_id);
            if is_temporary_dc_id(bare) {
                let real = real_id_from_temporary_dc_id(bare);
                if real != 0 {
                    real
                } else {
                    bare
                }
            } else {
                bare
            }
        };
        if dc_id != shifted_dc_id {
            if let Some(dc) = self.find(dc_id) {
                return dc;
            }
        }
        self.add(dc_id, None)
    }

    pub fn is_empty(&self) -> bool {
        self.dcenters.is_empty()
    }

    pub fn shifted_ids(&self) -> Vec<ShiftedDcId> {
        self.dcenters.keys().copied().collect()
    }

    /// Drop quarantined Dcenters; called from a queued task once the stack
    /// that removed them has unwound.
    pub fn drain_destroyed(&mut self) {
        self.to_destroy.clear();
    }
}

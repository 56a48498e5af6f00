//! Live connections of one session and their convergence to a selection.
//!
//! Connections play one of two roles. `listening` connections were accepted
//! from the peer; `dialed` connections were opened by this side, each bound
//! to one selected path. Only dialed connections take part in
//! reconciliation.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::path::{Path, PathId};
use crate::quality::PathSet;
use crate::transport::Connection;
use crate::types::{ConnectionId, ConnectionState};

/// A dialed connection and its reconciliation state.
#[derive(Clone)]
pub struct TrackedConnection {
    pub conn: Arc<dyn Connection>,
    pub state: ConnectionState,
}

impl TrackedConnection {
    fn path_id(&self) -> Option<PathId> {
        self.conn.path_id()
    }
}

impl fmt::Debug for TrackedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("id", &self.conn.id())
            .field("path", &self.path_id())
            .field("state", &self.state)
            .finish()
    }
}

/// Steps needed to converge a [`ConnectionSet`] to a new selection.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Active connections whose path is still selected.
    pub reuse: Vec<ConnectionId>,
    /// Stale connections whose path was selected again.
    pub revive: Vec<ConnectionId>,
    /// Selected paths without a connection yet.
    pub establish: Vec<Path>,
    /// Active connections whose path is no longer selected.
    pub mark_stale: Vec<ConnectionId>,
    /// Stale connections left unselected for a second round.
    pub close: Vec<ConnectionId>,
    /// Selected path ids, in selection order.
    pub order: Vec<PathId>,
}

impl ReconcilePlan {
    /// Whether applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.revive.is_empty()
            && self.establish.is_empty()
            && self.mark_stale.is_empty()
            && self.close.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSet {
    listening: Vec<Arc<dyn Connection>>,
    dialed: Vec<TrackedConnection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listening(&self) -> Vec<Arc<dyn Connection>> {
        self.listening.clone()
    }

    /// Active dialed connections, in selection order.
    pub fn dialed(&self) -> Vec<Arc<dyn Connection>> {
        self.dialed
            .iter()
            .filter(|t| t.state == ConnectionState::Active)
            .map(|t| Arc::clone(&t.conn))
            .collect()
    }

    pub fn stale(&self) -> Vec<Arc<dyn Connection>> {
        self.dialed
            .iter()
            .filter(|t| t.state == ConnectionState::Stale)
            .map(|t| Arc::clone(&t.conn))
            .collect()
    }

    pub fn tracked(&self) -> &[TrackedConnection] {
        &self.dialed
    }

    /// Every connection of both roles.
    pub fn all(&self) -> Vec<Arc<dyn Connection>> {
        self.listening
            .iter()
            .cloned()
            .chain(self.dialed.iter().map(|t| Arc::clone(&t.conn)))
            .collect()
    }

    pub fn add_listening(&mut self, conn: Arc<dyn Connection>) {
        if !self.listening.iter().any(|c| c.id() == conn.id()) {
            self.listening.push(conn);
        }
    }

    pub fn add_dialed(&mut self, conn: Arc<dyn Connection>) {
        if !self.dialed.iter().any(|t| t.conn.id() == conn.id()) {
            self.dialed.push(TrackedConnection {
                conn,
                state: ConnectionState::Active,
            });
        }
    }

    pub fn active_count(&self) -> usize {
        self.dialed
            .iter()
            .filter(|t| t.state == ConnectionState::Active)
            .count()
    }

    /// Paths of the active dialed connections, in selection order.
    pub fn path_ids(&self) -> Vec<PathId> {
        self.dialed
            .iter()
            .filter(|t| t.state == ConnectionState::Active)
            .filter_map(TrackedConnection::path_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listening.len() + self.dialed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listening.is_empty() && self.dialed.is_empty()
    }

    /// Compute the steps to converge to `selected`.
    ///
    /// A selection smaller than the number of active dialed connections is
    /// rejected, leaving the current set in place.
    pub fn plan(&self, selected: &PathSet) -> Result<ReconcilePlan> {
        let active = self.active_count();
        if selected.len() < active {
            return Err(Error::InvalidPathSet {
                paths: selected.len(),
                connections: active,
            });
        }

        let mut plan = ReconcilePlan::default();
        for quality in selected {
            let id = quality.id();
            if plan.order.contains(&id) {
                continue;
            }
            plan.order.push(id);

            match self.dialed.iter().find(|t| t.path_id() == Some(id)) {
                Some(t) if t.state == ConnectionState::Active => plan.reuse.push(t.conn.id()),
                Some(t) if t.state == ConnectionState::Stale => plan.revive.push(t.conn.id()),
                _ => plan.establish.push(quality.path.clone()),
            }
        }

        for t in &self.dialed {
            let selected = t.path_id().is_some_and(|id| plan.order.contains(&id));
            if selected {
                continue;
            }
            match t.state {
                ConnectionState::Active => plan.mark_stale.push(t.conn.id()),
                ConnectionState::Stale | ConnectionState::Closed => plan.close.push(t.conn.id()),
            }
        }

        Ok(plan)
    }

    /// Apply `plan`, adding the `established` connections.
    ///
    /// Returns the connections removed from the set. The caller closes them.
    pub fn apply(
        &mut self,
        plan: &ReconcilePlan,
        established: Vec<Arc<dyn Connection>>,
    ) -> Vec<Arc<dyn Connection>> {
        let mut removed = Vec::new();
        self.dialed.retain(|t| {
            if plan.close.contains(&t.conn.id()) {
                removed.push(Arc::clone(&t.conn));
                false
            } else {
                true
            }
        });

        for t in &mut self.dialed {
            let id = t.conn.id();
            if plan.revive.contains(&id) {
                t.state = ConnectionState::Active;
            } else if plan.mark_stale.contains(&id) {
                t.state = ConnectionState::Stale;
            }
        }

        for conn in established {
            self.add_dialed(conn);
        }

        let position = |t: &TrackedConnection| {
            t.path_id()
                .and_then(|id| plan.order.iter().position(|p| *p == id))
                .unwrap_or(usize::MAX)
        };
        self.dialed
            .sort_by_key(|t| (t.state != ConnectionState::Active, position(t)));

        removed
    }

    /// Drop connections that were closed underneath the set.
    pub fn prune_closed(&mut self) -> Vec<Arc<dyn Connection>> {
        let mut removed = Vec::new();
        self.listening.retain(|c| {
            if c.is_closed() {
                removed.push(Arc::clone(c));
                false
            } else {
                true
            }
        });
        self.dialed.retain(|t| {
            if t.conn.is_closed() {
                removed.push(Arc::clone(&t.conn));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> Vec<Arc<dyn Connection>> {
        let mut all: Vec<Arc<dyn Connection>> = self.listening.drain(..).collect();
        all.extend(self.dialed.drain(..).map(|t| t.conn));
        all
    }
}

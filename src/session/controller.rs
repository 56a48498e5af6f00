//! Session controller: one peer, many paths.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::connection_set::ConnectionSet;
use super::handshake::{Acceptor, HandshakeOutcome, Initiator};
use super::scheduler::Scheduler;
use super::{ConnectOptions, SessionConfig, SessionEvent};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::AggregateBandwidth;
use crate::path::{PathId, PathLookup};
use crate::quality::{PathQualityDatabase, PathSet};
use crate::selection::{select_paths, SelectionHistory, Selector};
use crate::transport::{Listener, Transport};
use crate::types::PeerAddr;

/// Drives path selection and connection management for one peer.
///
/// Background work runs in three kinds of tasks: the metrics tick, the
/// reselection round and the incoming handshake loop. All of them stop on
/// [`disconnect`](Self::disconnect) or when the controller is dropped.
pub struct SessionController {
    local: PeerAddr,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    database: PathQualityDatabase,
    scheduler: Arc<dyn Scheduler>,
    initiator: Initiator,
    acceptor: Arc<Acceptor>,
    selector: RwLock<Arc<dyn Selector>>,
    /// Combinations tried in earlier rounds.
    history: Mutex<SelectionHistory>,
    connections: Mutex<ConnectionSet>,
    peer: RwLock<Option<PeerAddr>>,
    listener: RwLock<Option<Arc<dyn Listener>>>,
    /// Serializes reselection rounds.
    round: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics_started: AtomicBool,
    reselect_started: AtomicBool,
    incoming_started: AtomicBool,
    closed: AtomicBool,
}

impl SessionController {
    /// Create a controller for the local session address `local`.
    ///
    /// Metrics are registered in the registry of `transport`.
    pub fn new(
        config: &Config,
        local: PeerAddr,
        lookup: Arc<dyn PathLookup>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let session = config.session.clone();
        let selector = session.selector.build(session.disjoint_explore_slots)?;
        let (events, _) = broadcast::channel(session.event_capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            local,
            database: PathQualityDatabase::new(lookup, config.database.clone()),
            scheduler: session.scheduler.build(config.transport.max_frame_size),
            initiator: Initiator::new(Arc::clone(&transport), config.handshake.clone(), local),
            acceptor: Arc::new(Acceptor::new(
                Arc::clone(&transport),
                config.handshake.clone(),
                local,
            )),
            transport,
            selector: RwLock::new(selector),
            history: Mutex::new(SelectionHistory::new()),
            connections: Mutex::new(ConnectionSet::new()),
            peer: RwLock::new(None),
            listener: RwLock::new(None),
            round: tokio::sync::Mutex::new(()),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            metrics_started: AtomicBool::new(false),
            reselect_started: AtomicBool::new(false),
            incoming_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config: session,
        }))
    }

    pub fn local(&self) -> PeerAddr {
        self.local
    }

    pub fn peer(&self) -> Option<PeerAddr> {
        *self.peer.read()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn database(&self) -> &PathQualityDatabase {
        &self.database
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write() = selector;
    }

    pub fn selector_name(&self) -> &'static str {
        self.selector.read().name()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        trace!(?event, "Session event");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Bind the session's well-known listening address.
    ///
    /// Does not wait for a peer. Both accepting and connecting sides listen,
    /// so the peer can dial back.
    pub async fn listen(&self) -> Result<SocketAddr> {
        self.ensure_open()?;
        let listener = self.transport.listen(self.local.host).await?;
        let addr = listener.local_addr();
        *self.listener.write() = Some(Arc::from(listener));
        debug!(local = %self.local, %addr, "Listening");
        Ok(addr)
    }

    /// Connect to `peer` over the paths chosen by `selector`.
    ///
    /// Without a selector the configured one is used. Fails when not a
    /// single connection could be established; fewer connections than
    /// requested is not an error.
    pub async fn connect(
        self: &Arc<Self>,
        peer: PeerAddr,
        selector: Option<Arc<dyn Selector>>,
        options: ConnectOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        if let Some(selector) = selector {
            self.set_selector(selector);
        }
        *self.peer.write() = Some(peer);
        info!(local = %self.local, %peer, selector = self.selector_name(), "Connecting");

        self.reselect().await?;
        if self.connections.lock().active_count() == 0 {
            return Err(Error::HandshakeFailed(format!(
                "no connection to {peer} established"
            )));
        }

        self.start_background(options);
        Ok(())
    }

    /// Wait until a peer connects to the listening address.
    ///
    /// With a selector the controller dials back to the peer right away
    /// (server-side path selection). Further handshakes from the peer are
    /// accepted in the background.
    pub async fn wait_for_peer(self: &Arc<Self>, selector: Option<Arc<dyn Selector>>) -> Result<PeerAddr> {
        self.ensure_open()?;
        let listener = self
            .listener
            .read()
            .clone()
            .ok_or_else(|| Error::HandshakeFailed("not listening".into()))?;

        debug!(local = %self.local, "Waiting for peer");
        let mut shutdown = self.shutdown.subscribe();
        let outcome = tokio::select! {
            _ = shutdown.recv() => return Err(Error::Shutdown),
            outcome = accept_handshake(listener.as_ref(), &self.acceptor) => outcome?,
        };

        let peer = outcome.peer;
        *self.peer.write() = Some(peer);
        self.adopt_incoming(outcome);

        match selector {
            Some(selector) => {
                self.connect(peer, Some(selector), ConnectOptions::default())
                    .await?;
            }
            None => self.start_background(ConnectOptions {
                no_periodic_reselection: true,
                ..ConnectOptions::default()
            }),
        }
        Ok(peer)
    }

    /// Read one frame from the peer.
    ///
    /// Frames arrive on whichever listening connection the peer writes to.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.scheduler.read(buf).await;
        if matches!(result, Err(Error::ConnectionClosed)) {
            self.prune_closed();
        }
        result
    }

    /// Write one frame to the peer.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.scheduler.write(buf).await
    }

    /// Close every connection and stop all background tasks.
    ///
    /// Returns the errors of individual connection closes.
    pub async fn disconnect(&self) -> Vec<Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            handle.abort();
            // Cancelled tasks release their listener and connection handles.
            let _ = handle.await;
        }
        self.listener.write().take();

        let conns = self.connections.lock().drain();
        self.scheduler.set_connections(Vec::new(), Vec::new());
        if let Some(peer) = self.peer() {
            self.database.set_connections(&peer, Vec::new(), Vec::new());
        }

        let mut errors = Vec::new();
        for conn in conns {
            if let Err(e) = conn.close().await {
                errors.push(e);
            }
        }

        info!(local = %self.local, peer = ?self.peer(), errors = errors.len(), "Disconnected");
        self.emit(SessionEvent::ConnectionSetChanged {
            listening: 0,
            dialed: 0,
        });
        errors
    }

    /// Run one reselection round.
    ///
    /// Refreshes the peer's paths, selects a target set and reconciles the
    /// dialed connections with it. Returns the active path ids afterwards.
    /// A rejected or failed round leaves the previous connections in place.
    pub async fn reselect(&self) -> Result<Vec<PathId>> {
        self.ensure_open()?;
        let peer = self.peer().ok_or(Error::NotConnected)?;
        let _round = self.round.lock().await;
        self.prune_closed();

        let refreshed = self.database.refresh(&peer).await;
        let paths = match self.database.get_path_set(&peer) {
            Ok(set) => {
                if let Err(e) = refreshed {
                    warn!(%peer, error = %e, "Path refresh failed, keeping previous paths");
                }
                set
            }
            Err(e) => return Err(refreshed.err().unwrap_or(e)),
        };

        let current = self.connections.lock().path_ids();
        let selected = self.select(&paths, &current);
        if selected.is_empty() {
            warn!(%peer, known = paths.len(), "No paths selected");
            return Ok(current);
        }

        let plan = self.connections.lock().plan(&selected).map_err(|e| {
            warn!(%peer, error = %e, "Reselection rejected, keeping previous paths");
            e
        })?;
        if plan.is_noop() {
            trace!(%peer, "Selection unchanged");
            return Ok(current);
        }
        debug!(
            %peer,
            reuse = plan.reuse.len(),
            revive = plan.revive.len(),
            establish = plan.establish.len(),
            stale = plan.mark_stale.len(),
            close = plan.close.len(),
            "Reconciling connections"
        );

        let established = if plan.establish.is_empty() {
            Vec::new()
        } else {
            let outcome = self.initiator.connect(peer, &plan.establish).await?;
            self.emit(SessionEvent::HandshakeCompleted {
                peer,
                connections: outcome.connections.len(),
            });
            outcome.connections
        };

        let removed = self.connections.lock().apply(&plan, established);
        for conn in removed {
            debug!(conn = %conn.id(), path = ?conn.path_id(), "Closing stale connection");
            if let Err(e) = conn.close().await {
                debug!(conn = %conn.id(), error = %e, "Close failed");
            }
        }

        let ids = self.connections.lock().path_ids();
        if ids != current {
            info!(%peer, paths = ids.len(), "Active path set changed");
            self.emit(SessionEvent::PathSetChanged(ids.clone()));
        }
        self.publish_connections();
        Ok(ids)
    }

    /// Pick the target set, falling back to the best tried combination once
    /// an exploring selector has run out of new ones.
    fn select(&self, paths: &PathSet, current: &[PathId]) -> PathSet {
        let selector = self.selector.read().clone();
        let mut history = self.history.lock();

        if !current.is_empty() {
            let write_bandwidth = paths.select_ids(current).latest_write_bandwidth();
            history.record(current, write_bandwidth);
        }

        let selected = select_paths(selector.as_ref(), paths, self.config.path_count, &history);
        if !selected.is_empty() {
            return selected;
        }

        match history.best() {
            Some(best) => {
                debug!(selector = selector.name(), tried = history.len(), "Falling back to best combination");
                paths.select_ids(best)
            }
            None => selected,
        }
    }

    /// Advance the metrics of the peer's connections by one tick.
    pub fn record_metrics(&self) {
        self.prune_closed();
        if let Some(peer) = self.peer() {
            self.database
                .record_peer_metrics(&peer, self.config.metrics_interval);
        }
    }

    /// Current path set of the peer.
    pub fn path_set(&self) -> Result<PathSet> {
        let peer = self.peer().ok_or(Error::NotConnected)?;
        self.database.get_path_set(&peer)
    }

    /// Paths of the active dialed connections.
    pub fn selected_paths(&self) -> Vec<PathId> {
        self.connections.lock().path_ids()
    }

    /// Number of listening and active dialed connections.
    pub fn connection_counts(&self) -> (usize, usize) {
        let set = self.connections.lock();
        (set.listening().len(), set.active_count())
    }

    /// Bandwidth history summed over all connections.
    pub fn aggregate_bandwidth(&self) -> AggregateBandwidth {
        self.transport.registry().aggregate()
    }

    /// Number of path combinations tried so far.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    fn adopt_incoming(&self, outcome: HandshakeOutcome) {
        let count = outcome.connections.len();
        match self.peer() {
            None => *self.peer.write() = Some(outcome.peer),
            Some(peer) if peer != outcome.peer => {
                warn!(%peer, other = %outcome.peer, "Handshake from another peer");
            }
            Some(_) => {}
        }

        let pruned = {
            let mut set = self.connections.lock();
            let pruned = set.prune_closed();
            for conn in outcome.connections {
                set.add_listening(conn);
            }
            pruned
        };
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Dropped closed connections");
        }
        self.emit(SessionEvent::HandshakeCompleted {
            peer: outcome.peer,
            connections: count,
        });
        self.publish_connections();
    }

    /// Drop closed connections and republish if any were found.
    fn prune_closed(&self) {
        let pruned = self.connections.lock().prune_closed();
        if pruned.is_empty() {
            return;
        }
        debug!(count = pruned.len(), "Dropped closed connections");
        self.publish_connections();
    }

    /// Hand the current connections to the scheduler and the database.
    fn publish_connections(&self) {
        let (listening, dialed) = {
            let set = self.connections.lock();
            (set.listening(), set.dialed())
        };
        if let Some(peer) = self.peer() {
            self.database
                .set_connections(&peer, listening.clone(), dialed.clone());
        }
        let event = SessionEvent::ConnectionSetChanged {
            listening: listening.len(),
            dialed: dialed.len(),
        };
        self.scheduler.set_connections(listening, dialed);
        self.emit(event);
    }

    fn start_background(self: &Arc<Self>, options: ConnectOptions) {
        if self.config.collect_metrics && !options.no_metrics_collection {
            self.start_metrics_loop();
        }
        if self.config.periodic_reselection && !options.no_periodic_reselection {
            self.start_reselect_loop();
        }
        self.start_incoming_loop();
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    fn start_metrics_loop(self: &Arc<Self>) {
        if self.metrics_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.metrics_interval;

        self.spawn_task(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        controller.record_metrics();
                    }
                }
            }
            trace!("Metrics loop stopped");
        });
    }

    fn start_reselect_loop(self: &Arc<Self>) {
        if self.reselect_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.reselect_interval;

        self.spawn_task(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        match controller.reselect().await {
                            Ok(_) => {}
                            Err(e) if e.is_recoverable() || matches!(e, Error::InvalidPathSet { .. }) => {
                                warn!(error = %e, "Reselection round failed, retrying next round");
                            }
                            Err(Error::Shutdown) => break,
                            Err(e) => error!(error = %e, "Reselection round failed"),
                        }
                    }
                }
            }
            trace!("Reselection loop stopped");
        });
    }

    fn start_incoming_loop(self: &Arc<Self>) {
        let Some(listener) = self.listener.read().clone() else {
            return;
        };
        if self.incoming_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let acceptor = Arc::clone(&self.acceptor);
        let mut shutdown = self.shutdown.subscribe();

        self.spawn_task(async move {
            loop {
                let outcome = tokio::select! {
                    _ = shutdown.recv() => break,
                    outcome = accept_handshake(listener.as_ref(), &acceptor) => outcome,
                };
                let Some(controller) = weak.upgrade() else { break };
                match outcome {
                    Ok(outcome) => controller.adopt_incoming(outcome),
                    Err(e) if e.is_closed() => break,
                    Err(e) => warn!(error = %e, "Incoming handshake failed"),
                }
            }
            trace!("Incoming handshake loop stopped");
        });
    }
}

/// Accept the next base connection and serve its handshake.
async fn accept_handshake(listener: &dyn Listener, acceptor: &Acceptor) -> Result<HandshakeOutcome> {
    let base = listener.accept().await?;
    acceptor.accept(base).await
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (listening, dialed) = self.connection_counts();
        f.debug_struct("SessionController")
            .field("local", &self.local)
            .field("peer", &self.peer())
            .field("selector", &self.selector_name())
            .field("listening", &listening)
            .field("dialed", &dialed)
            .finish()
    }
}

//! In-process mesh: N peer workers fully connected over tokio channels,
//! each issuing random concurrent edits against a shared pool of nodes.

use std::time::{Duration, Instant};

use libweave_core::types::{generate_node_id, generate_peer_id};
use libweave_core::{
    Integration, NodeData, NodeId, NodeState, OperationPayload, PeerId, Position, SyncConfig,
    VectorClock,
};
use libweave_peer::{
    NotificationListener, PeerError, PeerHandle, PeerSyncProtocol, PeerWorker, WorkerSnapshot,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// Shape of one simulation run
#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub peers: usize,
    pub edits: usize,
    pub nodes: usize,
    pub seed: u64,
    pub timeout: Duration,
    pub poll: Duration,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditStats {
    pub applied: usize,
    pub unchanged: usize,
    pub invalidated: usize,
}

impl EditStats {
    fn record(&mut self, outcome: &Integration) {
        match outcome {
            Integration::Applied { changed: true, .. } => self.applied += 1,
            Integration::Applied { changed: false, .. }
            | Integration::Duplicate
            | Integration::Deferred => self.unchanged += 1,
            Integration::Invalidated => self.invalidated += 1,
        }
    }

    fn add(&mut self, other: EditStats) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.invalidated += other.invalidated;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSummary {
    pub peer_id: PeerId,
    pub vector_clock: VectorClock,
    pub node_count: usize,
    pub open_peers: usize,
    pub presences: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSummary {
    pub strategy: &'static str,
    pub peers: usize,
    pub edits_per_peer: usize,
    pub converged: bool,
    pub elapsed_ms: u64,
    pub local_edits: EditStats,
    /// Notifications seen by the first peer's listener
    pub notifications: usize,
    pub replicas: Vec<ReplicaSummary>,
    /// Final state of the first replica
    pub nodes: NodeState,
}

/// Spawn the mesh, run the edits, wait for convergence and shut down
pub async fn run_mesh(config: &SyncConfig, options: &MeshOptions) -> Result<MeshSummary, NodeError> {
    if options.peers < 2 {
        return Err(NodeError::InvalidArgs("a mesh needs at least 2 peers".into()));
    }
    if options.nodes == 0 {
        return Err(NodeError::InvalidArgs("node pool must not be empty".into()));
    }

    let started = Instant::now();
    let (handles, tasks, notifications) = spawn_peers(config, options.peers);
    connect_all(&handles).await?;
    info!(peers = handles.len(), strategy = config.strategy.as_str(), "mesh connected");

    let pool: Vec<NodeId> = (0..options.nodes).map(|_| generate_node_id()).collect();
    let local_edits = run_edits(&handles, &pool, options).await?;
    info!(
        applied = local_edits.applied,
        invalidated = local_edits.invalidated,
        "edits issued"
    );

    let (converged, snapshots) = wait_for_convergence(&handles, options).await?;
    if converged {
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "replicas converged");
    } else {
        warn!("replicas did not converge before the timeout");
    }

    for handle in &handles {
        handle.shutdown().await?;
    }
    for task in tasks {
        task.await?;
    }
    let notifications = notifications.await?;

    let replicas = snapshots
        .iter()
        .map(|s| ReplicaSummary {
            peer_id: s.peer_id.clone(),
            vector_clock: s.vector_clock.clone(),
            node_count: s.nodes.len(),
            open_peers: s.open_peers.len(),
            presences: s.presences.len(),
        })
        .collect();

    Ok(MeshSummary {
        strategy: config.strategy.as_str(),
        peers: options.peers,
        edits_per_peer: options.edits,
        converged,
        elapsed_ms: started.elapsed().as_millis() as u64,
        local_edits,
        notifications,
        replicas,
        nodes: snapshots
            .into_iter()
            .next()
            .map(|s| s.nodes)
            .unwrap_or_default(),
    })
}

/// Spawn one worker per peer; the first peer reports to a notification counter
fn spawn_peers(
    config: &SyncConfig,
    count: usize,
) -> (Vec<PeerHandle>, Vec<JoinHandle<()>>, JoinHandle<usize>) {
    let (listener, mut rx) = NotificationListener::channel(config.channel_capacity);
    let counter = tokio::spawn(async move {
        let mut seen = 0;
        while rx.recv().await.is_some() {
            seen += 1;
        }
        seen
    });

    let mut listener = Some(listener);
    let mut handles = Vec::with_capacity(count);
    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        let mut protocol = PeerSyncProtocol::new(generate_peer_id(), config);
        if let Some(listener) = listener.take() {
            protocol = protocol.with_listener(listener);
        }
        let (handle, task) = PeerWorker::spawn(protocol, config);
        debug!(peer = %handle.peer_id(), "spawned peer");
        handles.push(handle);
        tasks.push(task);
    }
    (handles, tasks, counter)
}

async fn connect_all(handles: &[PeerHandle]) -> Result<(), NodeError> {
    for a in handles {
        for b in handles {
            if a.peer_id() != b.peer_id() {
                a.connect_to(b).await?;
            }
        }
    }
    Ok(())
}

async fn run_edits(
    handles: &[PeerHandle],
    pool: &[NodeId],
    options: &MeshOptions,
) -> Result<EditStats, NodeError> {
    let mut tasks = Vec::with_capacity(handles.len());
    for (i, handle) in handles.iter().enumerate() {
        let handle = handle.clone();
        let pool = pool.to_vec();
        let edits = options.edits;
        let seed = options.seed.wrapping_add(i as u64);

        tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut stats = EditStats::default();
            for step in 0..edits {
                let node_id = pool[rng.gen_range(0..pool.len())].clone();
                let payload = random_payload(&mut rng, handle.peer_id(), step);
                let outcome = handle.local_edit(node_id.clone(), payload).await?;
                stats.record(&outcome);

                if step % 5 == 0 {
                    let cursor = random_position(&mut rng);
                    handle.set_presence(Some(cursor), vec![node_id], None).await?;
                }
                tokio::task::yield_now().await;
            }
            Ok::<EditStats, PeerError>(stats)
        }));
    }

    let mut total = EditStats::default();
    for task in tasks {
        total.add(task.await??);
    }
    Ok(total)
}

async fn wait_for_convergence(
    handles: &[PeerHandle],
    options: &MeshOptions,
) -> Result<(bool, Vec<WorkerSnapshot>), NodeError> {
    let deadline = Instant::now() + options.timeout;
    loop {
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await?);
        }

        let converged = snapshots
            .windows(2)
            .all(|pair| pair[0].nodes == pair[1].nodes);
        if converged || Instant::now() >= deadline {
            return Ok((converged, snapshots));
        }
        tokio::time::sleep(options.poll).await;
    }
}

fn random_position(rng: &mut StdRng) -> Position {
    Position::new(
        rng.gen_range(0.0..1000.0_f64).round(),
        rng.gen_range(0.0..1000.0_f64).round(),
    )
}

fn random_payload(rng: &mut StdRng, peer_id: &PeerId, step: usize) -> OperationPayload {
    match rng.gen_range(0..10) {
        0..=2 => {
            let mut data = NodeData::new();
            data.insert("label".into(), json!(format!("{}-{}", peer_id, step)));
            data.insert("size".into(), json!(rng.gen_range(1..100)));
            OperationPayload::Create {
                data,
                position: Some(random_position(rng)),
            }
        }
        3..=6 => {
            let key = ["label", "color", "size"][rng.gen_range(0..3)];
            let mut fields = NodeData::new();
            fields.insert(key.into(), json!(format!("{}-{}", peer_id, step)));
            OperationPayload::Update { fields }
        }
        7..=8 => OperationPayload::Move {
            position: random_position(rng),
        },
        _ => OperationPayload::Delete,
    }
}

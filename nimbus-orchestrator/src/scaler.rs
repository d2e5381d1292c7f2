use crate::cluster_config::ClusterConfig;
use crate::connection::ConnectionPool;
use crate::lifecycle::InstanceLifecycle;
use crate::logger;
use crate::provisioner::{NodePlan, NodeProvisioner};
use nimbus_common::{Cluster, ClusterError, ClusterResult, Instance, InstanceRef};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct ScaleOptions {
    /// Leave successfully created nodes in place when others fail.
    pub skip_cleanup: bool,
    /// Extra top-level template attributes for every new node.
    pub options: Vec<(String, String)>,
}

/// Adds nodes to a running cluster with a bounded set of workers.
pub struct ParallelNodeScaler {
    provisioner: Arc<NodeProvisioner>,
    lifecycle: InstanceLifecycle,
    max_workers: usize,
}

impl ParallelNodeScaler {
    pub fn new(provisioner: Arc<NodeProvisioner>, lifecycle: InstanceLifecycle, max_workers: usize) -> Self {
        Self {
            provisioner,
            lifecycle,
            max_workers: max_workers.max(1),
        }
    }

    /// Create `count` joiner nodes named after the highest existing suffix.
    ///
    /// All or nothing: if any node fails, every node created by this call is
    /// destroyed (unless `skip_cleanup`), `cluster.nodes` is left untouched
    /// and the error lists each failure.
    pub async fn add_cluster_nodes(
        &self,
        pool: &Arc<ConnectionPool>,
        cluster: &mut Cluster,
        count: u32,
        options: &ScaleOptions,
    ) -> ClusterResult<Vec<InstanceRef>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let log_id = logger::log_event_with_metadata(
            "ADD_NODES",
            "in_progress",
            &cluster.name,
            None,
            Some(serde_json::json!({ "count": count, "max_workers": self.max_workers })),
        );

        let mut plan_options = options.options.clone();
        if let Some(mgmt_ip) = cluster.mgmt_ip() {
            if !plan_options.iter().any(|(k, _)| k.eq_ignore_ascii_case("MGMT_URL")) {
                plan_options.push(("MGMT_URL".to_string(), format!("https://{}/", mgmt_ip)));
            }
        }
        let plan = Arc::new(NodePlan {
            cluster_name: cluster.name.clone(),
            machine_type: cluster.machine_type.clone(),
            cluster_config: ClusterConfig::join(cluster)?.encode()?,
            options: plan_options,
        });

        let first = cluster.next_node_number();
        let numbers: Vec<u32> = (first..first + count).collect();
        tracing::info!(
            "➕ [scaler] adding {} node(s) to {}: {} .. {}",
            count,
            cluster.name,
            plan.node_name(first),
            plan.node_name(first + count - 1)
        );

        let (created, mut failures) = self.run_workers(pool, &plan, &numbers).await;

        if failures.is_empty() {
            let mut created = created;
            created.sort_by_key(|i| cluster.node_number(&i.name).unwrap_or(u32::MAX));
            let refs: Vec<InstanceRef> = created.iter().map(Instance::to_ref).collect();
            cluster.nodes.extend(refs.iter().cloned());
            logger::log_event_complete(log_id, "success", started.elapsed().as_millis() as u64, None);
            return Ok(refs);
        }

        failures.sort();
        let mut rollback_errors = Vec::new();
        if options.skip_cleanup {
            tracing::warn!(
                "⚠️ [scaler] leaving {} created node(s) of {} in place",
                created.len(),
                cluster.name
            );
        } else {
            rollback_errors = self.rollback(pool, &created).await;
        }
        let err = ClusterError::ScaleOut {
            failures,
            rollback_errors,
        };
        logger::log_event_complete(
            log_id,
            "failed",
            started.elapsed().as_millis() as u64,
            Some(&err.to_string()),
        );
        Err(err)
    }

    /// Run `min(max_workers, numbers)` workers over a shared task channel.
    ///
    /// Returns successes and formatted failures once every worker has joined.
    async fn run_workers(
        &self,
        pool: &Arc<ConnectionPool>,
        plan: &Arc<NodePlan>,
        numbers: &[u32],
    ) -> (Vec<Instance>, Vec<String>) {
        let (task_tx, task_rx) = mpsc::channel::<u32>(numbers.len().max(1));
        for n in numbers {
            // Capacity covers every task, so this never waits.
            if task_tx.try_send(*n).is_err() {
                tracing::error!("❌ [scaler] task queue rejected node {}", n);
            }
        }
        drop(task_tx);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let (ok_tx, mut ok_rx) = mpsc::unbounded_channel::<Instance>();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();

        let workers = self.max_workers.min(numbers.len());
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let conn = pool.checkout();
            let task_rx = Arc::clone(&task_rx);
            let ok_tx = ok_tx.clone();
            let err_tx = err_tx.clone();
            let plan = Arc::clone(plan);
            let provisioner = Arc::clone(&self.provisioner);

            handles.push(tokio::spawn(async move {
                let conn = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        // No connection: fail whatever this worker would have taken.
                        tracing::error!("❌ [scaler] worker {} has no connection: {:#}", worker, e);
                        while let Some(n) = next_task(&task_rx).await {
                            let _ = err_tx.send(format!("{}: no control-plane connection: {:#}", plan.node_name(n), e));
                        }
                        return;
                    }
                };
                while let Some(n) = next_task(&task_rx).await {
                    let name = plan.node_name(n);
                    tracing::debug!("🔧 [scaler] worker {} provisioning {}", worker, name);
                    match provisioner.create_node(&*conn, &plan, n).await {
                        Ok(instance) => {
                            let _ = ok_tx.send(instance);
                        }
                        Err(e) => {
                            let _ = err_tx.send(format!("{}: {}", name, e));
                        }
                    }
                }
            }));
        }
        drop(ok_tx);
        drop(err_tx);

        let mut failures = Vec::new();
        for (worker, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                failures.push(format!("worker {} aborted: {}", worker, e));
            }
        }

        let mut created = Vec::new();
        while let Ok(instance) = ok_rx.try_recv() {
            created.push(instance);
        }
        while let Ok(msg) = err_rx.try_recv() {
            failures.push(msg);
        }
        (created, failures)
    }

    async fn rollback(&self, pool: &Arc<ConnectionPool>, created: &[Instance]) -> Vec<String> {
        if created.is_empty() {
            return Vec::new();
        }
        let conn = match pool.checkout() {
            Ok(conn) => conn,
            Err(e) => {
                return created
                    .iter()
                    .map(|i| format!("{}: no control-plane connection: {:#}", i.name, e))
                    .collect();
            }
        };
        let mut errors = Vec::new();
        for instance in created {
            tracing::info!("↩️ [scaler] rolling back {} (vm {})", instance.name, instance.id);
            if let Err(e) = self.lifecycle.destroy(&*conn, instance.id).await {
                tracing::warn!("⚠️ [scaler] rollback of {} failed: {}", instance.name, e);
                errors.push(format!("{}: {}", instance.name, e));
            }
        }
        errors
    }
}

async fn next_task(tasks: &Mutex<mpsc::Receiver<u32>>) -> Option<u32> {
    tasks.lock().await.recv().await
}

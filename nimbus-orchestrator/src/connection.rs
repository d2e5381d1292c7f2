use anyhow::Result;
use nimbus_providers::ControlPlane;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Opens a new control-plane connection.
pub type ConnectFn = dyn Fn() -> Result<Arc<dyn ControlPlane>> + Send + Sync;

/// Lazily populated pool of control-plane connections.
///
/// Workers check out their own connection when they are spawned and keep it
/// for their whole lifetime; a connection is never used by two workers at
/// once. Connections go back to the idle list when the lease is dropped.
pub struct ConnectionPool {
    connect: Box<ConnectFn>,
    idle: Mutex<Vec<Arc<dyn ControlPlane>>>,
    opened: AtomicUsize,
}

impl ConnectionPool {
    pub fn new<F>(connect: F) -> Arc<Self>
    where
        F: Fn() -> Result<Arc<dyn ControlPlane>> + Send + Sync + 'static,
    {
        Arc::new(Self {
            connect: Box::new(connect),
            idle: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        })
    }

    /// Pool that always hands out the same backend (useful for in-memory backends).
    pub fn shared(backend: Arc<dyn ControlPlane>) -> Arc<Self> {
        Self::new(move || Ok(backend.clone()))
    }

    /// Reuse an idle connection or open a new one.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledConnection> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = (self.connect)()?;
                let opened = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!("🔌 [connections] opened control-plane connection #{}", opened);
                conn
            }
        };
        Ok(PooledConnection {
            conn,
            pool: Arc::clone(self),
        })
    }

    /// How many connections have been opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Arc<dyn ControlPlane>,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = dyn ControlPlane;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&self.conn));
    }
}

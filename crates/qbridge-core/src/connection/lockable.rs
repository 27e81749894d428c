//! Background processing behind a shared lock.
//!
//! # Thread Safety
//!
//! The processing task holds the lock only while it handles commands, so
//! other tasks can lock the connection between commands and use
//! [`Connection::with_context`] to change objects and notify the client.

use super::{Connection, ReaderEvent};
use crate::{BridgeError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A connection shared between the processing task and the application.
pub type SharedConnection = Arc<Mutex<Connection>>;

impl Connection {
    /// Start the connection and process commands on a spawned task.
    ///
    /// The task ends with the connection's fatal error. After that the
    /// shared connection only returns [`BridgeError::Closed`].
    pub async fn run_lockable(mut self) -> Result<(SharedConnection, JoinHandle<Result<()>>)> {
        self.ensure_started().await?;
        let events = self.events.take().ok_or(BridgeError::Closed)?;

        let shared = Arc::new(Mutex::new(self));
        let task = tokio::spawn(drive(shared.clone(), events));
        Ok((shared, task))
    }
}

async fn drive(shared: SharedConnection, mut events: mpsc::Receiver<ReaderEvent>) -> Result<()> {
    loop {
        let event = events
            .recv()
            .await
            .unwrap_or(ReaderEvent::Failed(BridgeError::Disconnected));

        let mut connection = shared.lock().await;
        connection.buffered.push_back(event);
        while let Ok(event) = events.try_recv() {
            connection.buffered.push_back(event);
        }
        connection.process().await?;
    }
}

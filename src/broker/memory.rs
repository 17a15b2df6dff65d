use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::Broker;

/// In-process queues. Submitting to a queue nobody declared is an error, so a task never
/// sits where no consumer will look.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, (Sender<String>, Receiver<String>)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: &str) -> Option<Sender<String>> {
        self.queues.lock().unwrap().get(queue).map(|(tx, _)| tx.clone())
    }

    fn receiver(&self, queue: &str) -> Option<Receiver<String>> {
        self.queues.lock().unwrap().get(queue).map(|(_, rx)| rx.clone())
    }
}

impl Broker for MemoryBroker {
    fn declare(&self, queue: &str) -> Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_insert_with(unbounded);
        Ok(())
    }

    fn submit(&self, queue: &str, payload: &str) -> Result<()> {
        let Some(tx) = self.sender(queue) else {
            anyhow::bail!("queue {} has no consumers", queue);
        };
        tx.send(payload.to_string())?;
        Ok(())
    }

    fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let Some(rx) = self.receiver(queue) else {
            std::thread::sleep(timeout);
            return Ok(None);
        };
        match rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self.receiver(queue).map(|rx| rx.len()).unwrap_or(0))
    }
}

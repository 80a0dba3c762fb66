use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use loopgrid_shared::Composition;

/// Current composition snapshot plus change notifications. Readers never block;
/// writers publish a whole new snapshot.
pub struct CompositionStore {
    current: ArcSwap<Composition>,
    subscribers: Mutex<Vec<Sender<Arc<Composition>>>>,
}

impl CompositionStore {
    pub fn new(composition: Composition) -> Self {
        Self {
            current: ArcSwap::from_pointee(composition),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<Composition> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> Receiver<Arc<Composition>> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, composition: Composition) {
        let snapshot = Arc::new(composition);
        self.current.store(snapshot.clone());
        // dropped receivers unsubscribe
        self.subscribers
            .lock()
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Copy-on-write edit of the current snapshot. The edit's result is returned and
    /// the new snapshot is published only if the edit succeeds.
    pub fn update<T, E>(&self, edit: impl FnOnce(&mut Composition) -> Result<T, E>) -> Result<T, E> {
        let mut next = (*self.snapshot()).clone();
        let out = edit(&mut next)?;
        self.publish(next);
        Ok(out)
    }
}

//! Ordered event delivery to the application callback.
//!
//! The driver thread is the only producer. Events go through a bounded FIFO
//! channel to a dedicated delivery thread, so the callback never runs on the
//! driver and never under an internal lock. A callback must not block
//! indefinitely or call back into blocking service operations: a full queue
//! stalls the driver until the callback returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::model::Event;

/// Application event callback.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

pub struct EventDispatcher {
    tx: Mutex<Option<SyncSender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Spawn the delivery thread. Without a callback events are only traced.
    pub fn new(callback: Option<EventCallback>, capacity: usize) -> std::io::Result<Self> {
        let Some(cb) = callback else {
            return Ok(Self {
                tx: Mutex::new(None),
                worker: Mutex::new(None),
            });
        };
        let (tx, rx) = sync_channel::<Event>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("zts-events".into())
            .spawn(move || {
                for ev in rx {
                    if catch_unwind(AssertUnwindSafe(|| cb(ev))).is_err() {
                        error!(code = ev.code.code(), id = ev.id, "event callback panicked");
                    }
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue one event. Blocks while the queue is full.
    pub fn emit(&self, ev: Event) {
        trace!(code = ?ev.code, id = format_args!("{:x}", ev.id), "event");
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            // The receiver only goes away after shutdown dropped every sender.
            let _ = tx.send(ev);
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = Event>) {
        for ev in events {
            self.emit(ev);
        }
    }

    /// Deliver everything still queued, then join the delivery thread.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("event delivery thread panicked");
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventCode, NetworkId, NodeId};

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |ev| sink.lock().push(ev)), seen)
    }

    #[test]
    fn delivers_in_order_and_drains_on_shutdown() {
        let (cb, seen) = recorder();
        let d = EventDispatcher::new(Some(cb), 2).unwrap();
        let nwid = NetworkId(0x1234);
        for code in [
            EventCode::NetworkRequestingConfig,
            EventCode::NetworkOk,
            EventCode::NetifUpIp4,
            EventCode::NetworkReadyIp4,
        ] {
            d.emit(Event::network(code, nwid));
        }
        d.shutdown();
        let codes: Vec<EventCode> = seen.lock().iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![
                EventCode::NetworkRequestingConfig,
                EventCode::NetworkOk,
                EventCode::NetifUpIp4,
                EventCode::NetworkReadyIp4,
            ]
        );
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let cb: EventCallback = Arc::new(move |ev: Event| {
            if ev.code == EventCode::NodeUp {
                panic!("callback failure");
            }
            *sink.lock() += 1;
        });
        let d = EventDispatcher::new(Some(cb), 8).unwrap();
        let node = NodeId(0xabcdef0123);
        d.emit(Event::node(EventCode::NodeUp, node));
        d.emit(Event::node(EventCode::NodeOnline, node));
        d.shutdown();
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn no_callback_is_silent() {
        let d = EventDispatcher::new(None, 8).unwrap();
        d.emit(Event::node(EventCode::NodeUp, NodeId(1)));
        d.shutdown();
        d.emit(Event::node(EventCode::NodeDown, NodeId(1)));
    }
}

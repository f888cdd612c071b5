//! Hand-off from connection tasks to packet processing.
//!
//! Connection tasks must never block on routing, so the router only enqueues.
//! A small pool of dispatcher tasks drains the queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::stanza::Packet;
use crate::error::RouteError;

pub trait PacketRouter: Send + Sync {
    fn route(&self, packet: Packet) -> Result<(), RouteError>;
}

/// Processing step run by the dispatcher pool for each routed packet.
pub type PacketProcessor = Arc<dyn Fn(Packet) + Send + Sync>;

/// Router backed by a bounded queue. A full queue is reported, not waited on.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    tx: mpsc::Sender<Packet>,
}

impl ChannelRouter {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }
}

impl PacketRouter for ChannelRouter {
    fn route(&self, packet: Packet) -> Result<(), RouteError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RouteError::Busy,
            mpsc::error::TrySendError::Closed(_) => RouteError::Closed,
        })
    }
}

/// Spawn `workers` dispatcher tasks sharing one queue. They exit once every
/// router handle is dropped and the queue is empty.
pub fn spawn_dispatchers(
    rx: mpsc::Receiver<Packet>,
    workers: usize,
    processor: PacketProcessor,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let processor = processor.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(packet) => processor(packet),
                        None => break,
                    }
                }
                debug!(worker, "Packet dispatcher stopped");
            })
        })
        .collect()
}

/// Default processing step: routing tables live outside this crate, so the
/// packet is only traced.
pub fn log_packet(packet: Packet) {
    debug!(
        conn_id = packet.connection_id,
        kind = ?packet.kind,
        to = packet.to.as_deref().unwrap_or(""),
        from = packet.from.as_deref().unwrap_or(""),
        "Packet routed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn packet(n: u64) -> Packet {
        Packet::parse("<message to='a@example.com'><body>x</body></message>", n).unwrap()
    }

    #[tokio::test]
    async fn test_route_enqueues_in_order() {
        let (router, mut rx) = ChannelRouter::new(8);
        router.route(packet(1)).unwrap();
        router.route(packet(2)).unwrap();
        assert_eq!(rx.recv().await.unwrap().connection_id, 1);
        assert_eq!(rx.recv().await.unwrap().connection_id, 2);
    }

    #[test]
    fn test_full_queue_reports_busy() {
        let (router, _rx) = ChannelRouter::new(1);
        router.route(packet(1)).unwrap();
        assert_eq!(router.route(packet(2)), Err(RouteError::Busy));
    }

    #[test]
    fn test_closed_queue() {
        let (router, rx) = ChannelRouter::new(1);
        drop(rx);
        assert_eq!(router.route(packet(1)), Err(RouteError::Closed));
    }

    #[tokio::test]
    async fn test_dispatchers_drain_queue() {
        let (router, rx) = ChannelRouter::new(64);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handles = spawn_dispatchers(
            rx,
            3,
            Arc::new(move |_packet| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for n in 0..20 {
            router.route(packet(n)).unwrap();
        }
        drop(router);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }
}

// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The sequencer: client responses leave in the exact order the requests
//! arrived, however the processor reorders completions internally.
//!
//! One dedicated worker owns the head of the FIFO. It sleeps on a condition
//! variable until the head's answer is delivered, emits the response, and
//! advances. Deliveries for requests behind the head accumulate in the slot
//! map until their turn.

use oram_types::messages::{ClientRequest, RequestKey};
use slog::{info, trace, Logger};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{Builder as ThreadBuilder, JoinHandle},
};

/// Writes a finished request's answer back to its client. The network layer
/// implements this over the client channel; tests substitute a recorder.
pub trait ClientResponder: Send + Sync + 'static {
    /// Deliver the answer for `req`. For reads `data` is the block payload;
    /// for writes the payload is ignored and a success status is sent.
    fn respond(&self, req: &ClientRequest, data: &[u8]);
}

#[derive(Default)]
struct SequencerState {
    /// Requests in arrival order.
    queue: VecDeque<ClientRequest>,
    /// Answer slots: absent until enqueue, `None` until delivery.
    slots: HashMap<RequestKey, Option<Vec<u8>>>,
}

pub struct Sequencer {
    shared: Arc<(Mutex<SequencerState>, Condvar)>,
    stop_requested: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Sequencer {
    pub fn new<R: ClientResponder>(responder: R, logger: Logger) -> Self {
        let shared = Arc::new((Mutex::new(SequencerState::default()), Condvar::new()));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let thread_shared = shared.clone();
        let thread_stop_requested = stop_requested.clone();
        let join_handle = Some(
            ThreadBuilder::new()
                .name("Sequencer".to_owned())
                .spawn(move || {
                    Self::run(thread_shared, thread_stop_requested, responder, logger)
                })
                .expect("Could not spawn thread"),
        );

        Self {
            shared,
            stop_requested,
            join_handle,
        }
    }

    /// Register a request's ordering slot. Must be called when the request
    /// first arrives, before the processor sees it.
    pub fn enqueue(&self, req: ClientRequest) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().expect("mutex poisoned");
        state.slots.insert(req.key(), None);
        state.queue.push_back(req);
        condvar.notify_all();
    }

    /// Deliver the answer for a request. Emission happens when the request
    /// reaches the head of the FIFO.
    pub fn deliver(&self, key: &RequestKey, data: Vec<u8>) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().expect("mutex poisoned");
        if let Some(slot) = state.slots.get_mut(key) {
            *slot = Some(data);
            condvar.notify_all();
        }
    }

    /// Withdraw a request that will never be answered, so it cannot wedge
    /// the FIFO head. Used when a fetch fails past all retries.
    pub fn abort(&self, key: &RequestKey) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock().expect("mutex poisoned");
        state.slots.remove(key);
        state.queue.retain(|req| req.key() != *key);
        condvar.notify_all();
    }

    /// Stop and join the worker.
    pub fn stop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.stop_requested.store(true, Ordering::SeqCst);
            self.shared.1.notify_all();
            let _ = join_handle.join();
        }
    }

    fn run<R: ClientResponder>(
        shared: Arc<(Mutex<SequencerState>, Condvar)>,
        stop_requested: Arc<AtomicBool>,
        responder: R,
        logger: Logger,
    ) {
        info!(logger, "Sequencer thread started.");
        loop {
            let (req, data) = {
                let (lock, condvar) = &*shared;
                let mut state = lock.lock().expect("mutex poisoned");
                loop {
                    if stop_requested.load(Ordering::SeqCst) {
                        info!(logger, "Sequencer thread stop requested.");
                        return;
                    }
                    let head_ready = match state.queue.front() {
                        Some(head) => matches!(state.slots.get(&head.key()), Some(Some(_))),
                        None => false,
                    };
                    if head_ready {
                        break;
                    }
                    state = condvar.wait(state).expect("mutex poisoned");
                }
                let req = state.queue.pop_front().expect("head was just observed");
                let data = state
                    .slots
                    .remove(&req.key())
                    .expect("slot was just observed")
                    .expect("slot was full");
                (req, data)
            };

            trace!(logger, "emitting response for request {}", req.request_id);
            responder.respond(&req, &data);
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logger;
    use oram_types::messages::{ClientOp, HostPort};
    use std::{sync::mpsc, time::Duration};

    struct ChannelResponder(Mutex<mpsc::Sender<u64>>);

    impl ClientResponder for ChannelResponder {
        fn respond(&self, req: &ClientRequest, _data: &[u8]) {
            self.0
                .lock()
                .expect("mutex poisoned")
                .send(req.request_id)
                .unwrap();
        }
    }

    fn request(request_id: u64) -> ClientRequest {
        ClientRequest {
            op: ClientOp::Read,
            request_id,
            block_id: 1,
            data: Vec::new(),
            client: HostPort {
                host: "127.0.0.1".to_owned(),
                port: 9000,
            },
        }
    }

    #[test]
    fn responses_follow_arrival_order() {
        let (tx, rx) = mpsc::channel();
        let sequencer = Sequencer::new(ChannelResponder(Mutex::new(tx)), test_logger());

        let reqs: Vec<ClientRequest> = (1..=3).map(request).collect();
        for req in &reqs {
            sequencer.enqueue(req.clone());
        }

        // Deliver out of order; emission must still be 1, 2, 3.
        sequencer.deliver(&reqs[2].key(), vec![3]);
        sequencer.deliver(&reqs[1].key(), vec![2]);
        sequencer.deliver(&reqs[0].key(), vec![1]);

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 1);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 3);
    }

    #[test]
    fn head_blocks_until_delivered() {
        let (tx, rx) = mpsc::channel();
        let sequencer = Sequencer::new(ChannelResponder(Mutex::new(tx)), test_logger());

        let first = request(1);
        let second = request(2);
        sequencer.enqueue(first.clone());
        sequencer.enqueue(second.clone());

        // Only the second answer is ready; nothing may be emitted yet.
        sequencer.deliver(&second.key(), vec![2]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        sequencer.deliver(&first.key(), vec![1]);
        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 1);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 2);
    }

    #[test]
    fn stop_joins_the_worker() {
        let (tx, _rx) = mpsc::channel();
        let mut sequencer = Sequencer::new(ChannelResponder(Mutex::new(tx)), test_logger());
        sequencer.stop();
        // Idempotent.
        sequencer.stop();
    }
}

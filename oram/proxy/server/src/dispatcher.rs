// Copyright (c) 2018-2021 The MobileCoin Foundation

//! A fixed pool of worker threads that drive client requests through the
//! processor. Session threads hand requests in and return to their socket;
//! the pool absorbs the per-request blocking on server I/O.

use crate::{error::Error, processor::Processor};
use oram_storage_iface::StorageConnection;
use oram_types::messages::ClientRequest;
use slog::{crit, info, warn, Logger};
use std::{
    sync::{mpsc, Arc, Mutex},
    thread::{Builder as ThreadBuilder, JoinHandle},
};

pub struct RequestDispatcher {
    sender: Option<mpsc::Sender<ClientRequest>>,
    join_handles: Vec<JoinHandle<()>>,
}

impl RequestDispatcher {
    /// Spawn `num_workers` threads serving requests against `processor`.
    pub fn new<C: StorageConnection + 'static>(
        processor: Arc<Processor<C>>,
        num_workers: usize,
        logger: Logger,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<ClientRequest>();
        let receiver = Arc::new(Mutex::new(receiver));

        let join_handles = (0..num_workers)
            .map(|n| {
                let worker_processor = processor.clone();
                let worker_receiver = receiver.clone();
                let worker_logger = logger.clone();
                ThreadBuilder::new()
                    .name(format!("ReadPathWorker{}", n))
                    .spawn(move || {
                        Self::run_worker(worker_processor, worker_receiver, worker_logger)
                    })
                    .expect("Could not spawn thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            join_handles,
        }
    }

    /// Queue a request for a worker. Fails only after shutdown.
    pub fn dispatch(&self, req: ClientRequest) -> Result<(), Error> {
        self.sender
            .as_ref()
            .ok_or(Error::Dispatch)?
            .send(req)
            .map_err(|_| Error::Dispatch)
    }

    /// Stop accepting work and join the pool.
    pub fn stop(&mut self) {
        // Dropping the sender drains the pool: each worker exits when the
        // channel reports disconnect.
        self.sender = None;
        for join_handle in self.join_handles.drain(..) {
            let _ = join_handle.join();
        }
    }

    fn run_worker<C: StorageConnection>(
        processor: Arc<Processor<C>>,
        receiver: Arc<Mutex<mpsc::Receiver<ClientRequest>>>,
        logger: Logger,
    ) {
        info!(logger, "read-path worker started.");
        loop {
            // Hold the receiver lock only for the dequeue itself.
            let req = {
                let receiver = receiver.lock().expect("mutex poisoned");
                receiver.recv()
            };
            let req = match req {
                Ok(req) => req,
                Err(_) => {
                    info!(logger, "read-path worker stopping.");
                    return;
                }
            };

            if let Err(err) = processor.read_path(req) {
                if err.is_fatal() {
                    // A server fed us inauthentic data. Continuing would
                    // serve corrupt state; bring the proxy down.
                    crit!(logger, "fatal processor error: {}", err);
                    std::process::exit(2);
                }
                warn!(logger, "request failed: {}", err);
            }
        }
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

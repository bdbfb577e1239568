// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The processor: orchestrates the oblivious read path, request coalescing,
//! greedy path eviction, and the batched write-back to storage.
//!
//! Every client request costs exactly one path fetch. The first outstanding
//! request for a block performs the real read; concurrent requests for the
//! same block piggyback on it and fetch a uniformly random path instead, so
//! the server-visible access pattern is independent of the request stream.

use crate::{
    config::ProxyServerConfig,
    counters,
    crypto::PathCipher,
    error::{Error, Result},
    position_map::PositionMap,
    sequencer::Sequencer,
    stash::Stash,
    subtree::Subtree,
};
use oram_storage_iface::StorageConnection;
use oram_types::{
    greatest_common_level,
    messages::{ClientOp, ClientRequest, RequestKey},
    random_leaf, Block, Bucket,
};
use rand::rngs::OsRng;
use slog::{info, trace, warn, Logger};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

/// Attempts to locate a block that concurrent flushes keep moving between
/// the subtree and the stash before giving up on it.
const BLOCK_LOOKUP_ATTEMPTS: usize = 8;

#[derive(Default)]
struct ResponseEntry {
    /// Whether this request's own path fetch has come back.
    returned: bool,
    /// The block bytes owed to this request, once the real read finds them.
    data: Option<Vec<u8>>,
}

struct FlushCandidate {
    /// Deepest level this block may occupy on the flushed path.
    level: u32,
    block: Block,
}

impl PartialEq for FlushCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for FlushCandidate {}

impl PartialOrd for FlushCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlushCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.level
            .cmp(&other.level)
            .then_with(|| self.block.id().cmp(&other.block.id()))
    }
}

pub struct Processor<C: StorageConnection> {
    height: u32,
    block_size: usize,
    write_back_threshold: u64,
    stash_capacity: usize,

    /// One connection per storage server, indexed by partition.
    connections: Vec<C>,

    position_map: PositionMap,
    stash: Stash,
    subtree: Subtree,
    cipher: PathCipher,
    sequencer: Arc<Sequencer>,

    /// Per-block FIFO of requests awaiting the real read. The read half
    /// guards insertions in `read_path`; the write half guards the pruning
    /// of empty lists during write-back.
    request_table: RwLock<HashMap<u64, Arc<Mutex<VecDeque<ClientRequest>>>>>,

    /// Tracks, per request, whether its own path returned and whether its
    /// data has been located yet.
    response_table: Mutex<HashMap<RequestKey, ResponseEntry>>,

    /// Leaf -> number of outstanding fetches. A multiset: two concurrent
    /// reads of one leaf are two entries, and the write-back pruner must
    /// not drop buckets either still needs.
    inflight_paths: Mutex<HashMap<u64, usize>>,

    /// Logical clock: incremented once per flush.
    write_back_counter: AtomicU64,
    /// Counter value at which the next write-back fires.
    next_write_back: AtomicU64,
    /// Only the thread that wins this lock advances `next_write_back`.
    write_back_lock: Mutex<()>,

    /// Leaves flushed since the last write-back, in flush order.
    write_queue: Mutex<VecDeque<u64>>,

    logger: Logger,
}

impl<C: StorageConnection> Processor<C> {
    pub fn new(
        config: &ProxyServerConfig,
        connections: Vec<C>,
        sequencer: Arc<Sequencer>,
        logger: Logger,
    ) -> Self {
        let num_servers = connections.len();
        Self {
            height: config.tree_height,
            block_size: config.block_size,
            write_back_threshold: config.write_back_threshold,
            stash_capacity: config.stash_capacity,
            connections,
            position_map: PositionMap::new(config.tree_height, num_servers),
            stash: Stash::new(),
            subtree: Subtree::new(config.tree_height, config.bucket_size, logger.clone()),
            cipher: PathCipher::new(
                &config.path_encryption_key,
                config.tree_height,
                config.bucket_size,
                config.block_size,
            ),
            sequencer,
            request_table: RwLock::new(HashMap::default()),
            response_table: Mutex::new(HashMap::default()),
            inflight_paths: Mutex::new(HashMap::default()),
            write_back_counter: AtomicU64::new(0),
            next_write_back: AtomicU64::new(config.write_back_threshold),
            write_back_lock: Mutex::new(()),
            write_queue: Mutex::new(VecDeque::new()),
            logger,
        }
    }

    /// Serve one client request end to end: fetch a path, answer every
    /// coalesced waiter, and (after a real read) flush and maybe write back.
    ///
    /// The caller must already have registered the request with the
    /// sequencer; responses are emitted through it in arrival order.
    pub fn read_path(&self, req: ClientRequest) -> Result<()> {
        trace!(
            self.logger,
            "read_path for block {} request {}",
            req.block_id,
            req.request_id
        );
        self.response_table()
            .insert(req.key(), ResponseEntry::default());

        let block_id = req.block_id;
        let mut rng = OsRng;

        // Decide real-vs-fake and append to the block's FIFO in one critical
        // section, so exactly one request per coalesced group fetches the
        // real path. An unmapped block still triggers a fetch, to a random
        // leaf, for unlinkability.
        let (fake_read, leaf) = self.with_request_list(block_id, |list| {
            let fake_read = !list.is_empty();
            let leaf = if fake_read {
                random_leaf(self.height, &mut rng)
            } else {
                self.position_map
                    .get(block_id)
                    .unwrap_or_else(|| random_leaf(self.height, &mut rng))
            };
            list.push_back(req.clone());
            (fake_read, leaf)
        });

        self.inflight_increment(leaf);
        if fake_read {
            counters::FAKE_READS.inc();
        } else {
            counters::REAL_READS.inc();
        }

        let server = self.position_map.server_of(leaf);
        let relative_leaf = self.position_map.relative_leaf(leaf);

        // Suspension point: no proxy lock is held across server I/O.
        let path_bytes = match self.connections[server].read_path(relative_leaf) {
            Ok(bytes) => bytes,
            Err(err) => {
                // The fetch is unrecoverable; withdraw the request so it
                // cannot wedge the sequencer FIFO behind it.
                self.inflight_decrement(leaf);
                self.response_table().remove(&req.key());
                self.with_request_list(req.block_id, |list| {
                    list.retain(|waiter| waiter.key() != req.key())
                });
                self.sequencer.abort(&req.key());
                return Err(Error::Storage(err.to_string()));
            }
        };

        self.answer_request(&req, leaf, &path_bytes, fake_read)?;

        if !fake_read {
            self.flush(leaf);
            self.write_back()?;
        }
        Ok(())
    }

    /// Complete a returned path fetch: merge the path, and if this was the
    /// real read, serve every waiter and remap the block.
    fn answer_request(
        &self,
        req: &ClientRequest,
        leaf: u64,
        path_bytes: &[u8],
        is_fake: bool,
    ) -> Result<()> {
        let path = self.cipher.decrypt_path(leaf, path_bytes)?;
        self.subtree.add_path(path);

        // If the real read landed first, this later fetch only has to hand
        // its waiter the already-located data.
        {
            let mut table = self.response_table();
            if let Some(entry) = table.get_mut(&req.key()) {
                entry.returned = true;
                if let Some(data) = entry.data.clone() {
                    table.remove(&req.key());
                    drop(table);
                    self.sequencer.deliver(&req.key(), data);
                    self.inflight_decrement(leaf);
                    return Ok(());
                }
            }
        }

        if is_fake {
            // The eventual real-read completion wakes the waiter.
            self.inflight_decrement(leaf);
            return Ok(());
        }

        let block_id = req.block_id;
        let mut element_exists = self.position_map.get(block_id).is_some();

        // Drain the coalesced waiters in FIFO order. Writes are applied at
        // their drain turn, so every waiter observes the value left by the
        // most recent earlier write.
        loop {
            let waiter = match self.with_request_list(block_id, |list| list.pop_front()) {
                Some(waiter) => waiter,
                None => break,
            };

            let data = if element_exists {
                self.read_block_data(block_id)
            } else {
                vec![0u8; self.block_size]
            };

            if waiter.op == ClientOp::Write {
                if element_exists {
                    self.write_block_data(block_id, &waiter.data);
                } else {
                    self.stash.add(Block::new(block_id, waiter.data.clone()));
                }
            }

            let mut table = self.response_table();
            if let Some(entry) = table.get_mut(&waiter.key()) {
                entry.data = Some(data.clone());
                if entry.returned {
                    table.remove(&waiter.key());
                    drop(table);
                    self.sequencer.deliver(&waiter.key(), data);
                }
            }

            element_exists = true;
        }

        // The remap at the heart of the ORAM: after a real access the block
        // lives on a fresh unpredictable path.
        let mut rng = OsRng;
        self.position_map
            .set(block_id, random_leaf(self.height, &mut rng));

        self.inflight_decrement(leaf);
        Ok(())
    }

    /// Greedy eviction along the just-read path: gather the stash and the
    /// path's blocks, then repack them as deep as their positions allow.
    fn flush(&self, leaf: u64) {
        trace!(self.logger, "flush of leaf {}", leaf);
        let timestamp = self.write_back_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let path = self.subtree.ensure_path(leaf);
        // Bucket locks are taken root-down; concurrent flushes over
        // overlapping paths acquire the shared prefix in the same order.
        let mut guards: Vec<MutexGuard<Bucket>> = path.iter().map(|b| b.lock()).collect();

        // The candidate multiset, deduped by id. The path copy is canonical:
        // it may hold writes the stash copy predates.
        let mut candidates: HashMap<u64, Block> = HashMap::default();
        for block in self.stash.snapshot() {
            candidates.insert(block.id(), block);
        }
        for (level, guard) in guards.iter_mut().enumerate() {
            for block in self.subtree.clear_bucket(path[level].node(), guard) {
                candidates.insert(block.id(), block);
            }
        }

        // Deepest-sinking blocks first. A block with no position yet can
        // only be guaranteed a slot at the root.
        let mut heap: BinaryHeap<FlushCandidate> = candidates
            .into_iter()
            .map(|(id, block)| FlushCandidate {
                level: self
                    .position_map
                    .get(id)
                    .map(|p| greatest_common_level(self.height, leaf, p))
                    .unwrap_or(0),
                block,
            })
            .collect();

        let mut level = self.height as i64;
        while level >= 0 {
            let target = match heap.peek() {
                Some(candidate) => candidate.level as i64,
                None => break,
            };
            let guard = &mut guards[level as usize];
            if target == level && !guard.is_full() {
                let candidate = heap.pop().expect("heap top was just observed");
                let block_id = candidate.block.id();
                if self
                    .subtree
                    .place_block(path[level as usize].node(), guard, candidate.block, timestamp)
                {
                    self.stash.remove(block_id);
                }
                // More candidates may share this level.
                continue;
            }
            level -= 1;
        }

        // Whatever could not be placed returns to the stash.
        let mut returned = 0usize;
        for candidate in heap {
            self.stash.add(candidate.block);
            returned += 1;
        }
        if returned > 0 {
            trace!(
                self.logger,
                "flush of leaf {} returned {} blocks to the stash",
                leaf,
                returned
            );
        }

        drop(guards);

        let stash_len = self.stash.len();
        if stash_len > self.stash_capacity {
            // Security degradation, not a crash: the access pattern stays
            // oblivious, but H or Z is undersized for the workload.
            warn!(
                self.logger,
                "stash overflow: {} blocks exceed capacity {}", stash_len, self.stash_capacity
            );
            counters::STASH_OVERFLOWS.inc();
        }

        self.write_queue().push_back(leaf);
    }

    /// Ship a batch of K flushed paths back to storage, then prune the
    /// subtree. Only the thread that advances `next_write_back` runs the
    /// batch; everyone else returns immediately.
    fn write_back(&self) -> Result<()> {
        if self.write_back_counter.load(Ordering::SeqCst) < self.next_write_back.load(Ordering::SeqCst)
        {
            return Ok(());
        }

        let write_back_time = match self.write_back_lock.try_lock() {
            Ok(_guard) => {
                // Another thread may have claimed this slot between the
                // check above and the lock.
                let next = self.next_write_back.load(Ordering::SeqCst);
                if self.write_back_counter.load(Ordering::SeqCst) < next {
                    return Ok(());
                }
                self.next_write_back
                    .store(next + self.write_back_threshold, Ordering::SeqCst);
                next
            }
            Err(_) => return Ok(()),
        };

        // The only place empty request lists are dropped; insertions hold
        // the read half of this lock.
        {
            let mut table = self.request_table.write().expect("lock poisoned");
            table.retain(|_, list| !list.lock().expect("mutex poisoned").is_empty());
        }

        let batch: Vec<u64> = {
            let mut queue = self.write_queue();
            (0..self.write_back_threshold)
                .filter_map(|_| queue.pop_front())
                .collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut groups: HashMap<usize, Vec<u64>> = HashMap::default();
        for leaf in &batch {
            groups
                .entry(self.position_map.server_of(*leaf))
                .or_default()
                .push(*leaf);
        }

        // Snapshot and re-encrypt every path in the batch. Fresh nonces per
        // bucket: after a write-back the whole batch is indistinguishable
        // from random on the wire.
        let mut rng = OsRng;
        let mut shipments: Vec<(usize, Vec<(u64, Vec<u8>)>)> = Vec::with_capacity(groups.len());
        for (server, leaves) in groups {
            let mut paths = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                let snapshot = self.subtree.snapshot_path(leaf);
                let sealed = self.cipher.encrypt_path(&snapshot, &mut rng)?;
                paths.push((self.position_map.relative_leaf(leaf), sealed));
            }
            shipments.push((server, paths));
        }

        // One sender per server, all in flight together; the batch commits
        // only if every server acks.
        let all_acked = std::thread::scope(|scope| {
            let handles: Vec<_> = shipments
                .iter()
                .map(|(server, paths)| {
                    let connection = &self.connections[*server];
                    let logger = &self.logger;
                    scope.spawn(move || match connection.write_paths(paths) {
                        Ok(acked) => acked,
                        Err(err) => {
                            warn!(logger, "write-back to server {} failed: {}", server, err);
                            false
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .all(|handle| handle.join().unwrap_or(false))
        });

        if all_acked {
            counters::WRITE_BACKS.inc();
            // The pruner needs one consistent view of the inflight leaves;
            // copy them out instead of iterating the live multiset.
            let protected: HashSet<u64> = self.inflight().keys().copied().collect();
            for leaf in &batch {
                self.subtree.delete_nodes(*leaf, write_back_time, &protected);
            }
            info!(
                self.logger,
                "write-back of {} paths committed at time {}",
                batch.len(),
                write_back_time
            );
        } else {
            // All-or-nothing: no server group commits alone. Keep the
            // subtree intact and retry the whole batch later.
            counters::WRITE_BACK_FAILURES.inc();
            warn!(
                self.logger,
                "write-back failed; re-queueing {} paths",
                batch.len()
            );
            let mut queue = self.write_queue();
            for leaf in batch.into_iter().rev() {
                queue.push_front(leaf);
            }
        }

        Ok(())
    }

    /// Run `f` on the block's request FIFO while holding the read half of
    /// the request-table lock, creating the list if the block has none.
    fn with_request_list<T>(
        &self,
        block_id: u64,
        f: impl FnOnce(&mut VecDeque<ClientRequest>) -> T,
    ) -> T {
        loop {
            {
                let table = self.request_table.read().expect("lock poisoned");
                if let Some(list) = table.get(&block_id) {
                    let mut list = list.lock().expect("mutex poisoned");
                    return f(&mut list);
                }
            }
            let mut table = self.request_table.write().expect("lock poisoned");
            table.entry(block_id).or_default();
        }
    }

    /// Current bytes of a block that exists somewhere in subtree or stash.
    fn read_block_data(&self, block_id: u64) -> Vec<u8> {
        // Concurrent flushes move blocks between the two homes; look again
        // rather than concluding the block is gone.
        for _ in 0..BLOCK_LOOKUP_ATTEMPTS {
            if let Some(data) = self.subtree.read_block(block_id) {
                return data;
            }
            if let Some(block) = self.stash.find(block_id) {
                return block.data().to_vec();
            }
        }
        warn!(
            self.logger,
            "block {} vanished from subtree and stash", block_id
        );
        vec![0u8; self.block_size]
    }

    /// Overwrite a block that exists somewhere in subtree or stash.
    fn write_block_data(&self, block_id: u64, data: &[u8]) {
        for _ in 0..BLOCK_LOOKUP_ATTEMPTS {
            if self.subtree.write_block(block_id, data) {
                return;
            }
            if self.stash.write_data(block_id, data) {
                return;
            }
        }
        warn!(
            self.logger,
            "block {} vanished during write; reinstalling in stash", block_id
        );
        self.stash.add(Block::new(block_id, data.to_vec()));
    }

    fn inflight_increment(&self, leaf: u64) {
        *self.inflight().entry(leaf).or_insert(0) += 1;
    }

    fn inflight_decrement(&self, leaf: u64) {
        let mut inflight = self.inflight();
        if let Some(count) = inflight.get_mut(&leaf) {
            *count -= 1;
            if *count == 0 {
                inflight.remove(&leaf);
            }
        }
    }

    fn response_table(&self) -> MutexGuard<HashMap<RequestKey, ResponseEntry>> {
        self.response_table.lock().expect("mutex poisoned")
    }

    fn inflight(&self) -> MutexGuard<HashMap<u64, usize>> {
        self.inflight_paths.lock().expect("mutex poisoned")
    }

    fn write_queue(&self) -> MutexGuard<VecDeque<u64>> {
        self.write_queue.lock().expect("mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sequencer::ClientResponder, test_logger};
    use oram_storage_iface::testing::{HeapStorage, HeapStorageError};
    use oram_types::{messages::HostPort, node_id};
    use rand::{rngs::StdRng, SeedableRng};
    use std::{sync::mpsc, thread, time::Duration};

    const HEIGHT: u32 = 3;
    const Z: usize = 4;
    const B: usize = 4;
    const KEY: [u8; 32] = [7u8; 32];

    struct RecordingResponder(Mutex<mpsc::Sender<(u64, Vec<u8>)>>);

    impl ClientResponder for RecordingResponder {
        fn respond(&self, req: &ClientRequest, data: &[u8]) {
            let _ = self
                .0
                .lock()
                .expect("mutex poisoned")
                .send((req.request_id, data.to_vec()));
        }
    }

    /// Delays reads so tests can force two requests to overlap in flight.
    struct SlowStorage {
        inner: Arc<HeapStorage>,
        delay: Duration,
    }

    impl StorageConnection for SlowStorage {
        type Error = HeapStorageError;

        fn read_path(&self, relative_leaf: u64) -> std::result::Result<Vec<u8>, Self::Error> {
            thread::sleep(self.delay);
            self.inner.read_path(relative_leaf)
        }

        fn write_paths(
            &self,
            paths: &[(u64, Vec<u8>)],
        ) -> std::result::Result<bool, Self::Error> {
            self.inner.write_paths(paths)
        }
    }

    /// Returns well-sized garbage, as a tampering server would.
    struct TamperingStorage {
        path_len: usize,
    }

    impl StorageConnection for TamperingStorage {
        type Error = HeapStorageError;

        fn read_path(&self, _relative_leaf: u64) -> std::result::Result<Vec<u8>, Self::Error> {
            Ok(vec![0u8; self.path_len])
        }

        fn write_paths(
            &self,
            _paths: &[(u64, Vec<u8>)],
        ) -> std::result::Result<bool, Self::Error> {
            Ok(true)
        }
    }

    fn config(num_servers: usize, write_back_threshold: u64) -> ProxyServerConfig {
        ProxyServerConfig {
            client_listen_addr: "127.0.0.1:0".parse().unwrap(),
            tree_height: HEIGHT,
            bucket_size: Z,
            block_size: B,
            storage_servers: (0..num_servers)
                .map(|i| format!("127.0.0.1:{}", 20000 + i).parse().unwrap())
                .collect(),
            write_back_threshold,
            stash_capacity: 128,
            request_workers: 2,
            path_encryption_key: KEY,
        }
    }

    fn empty_bucket_template(bucket_size: usize) -> Vec<u8> {
        let cipher = PathCipher::new(&KEY, HEIGHT, bucket_size, B);
        let mut rng: StdRng = SeedableRng::from_seed([9u8; 32]);
        cipher
            .encrypt_bucket(&Bucket::new(bucket_size), &mut rng)
            .unwrap()
    }

    fn read_request(request_id: u64, block_id: u64) -> ClientRequest {
        ClientRequest {
            op: ClientOp::Read,
            request_id,
            block_id,
            data: Vec::new(),
            client: HostPort {
                host: "127.0.0.1".to_owned(),
                port: 9999,
            },
        }
    }

    fn write_request(request_id: u64, block_id: u64, data: Vec<u8>) -> ClientRequest {
        ClientRequest {
            op: ClientOp::Write,
            request_id,
            block_id,
            data,
            client: HostPort {
                host: "127.0.0.1".to_owned(),
                port: 9999,
            },
        }
    }

    struct Harness {
        processor: Arc<Processor<Arc<HeapStorage>>>,
        storages: Vec<Arc<HeapStorage>>,
        sequencer: Arc<Sequencer>,
        responses: mpsc::Receiver<(u64, Vec<u8>)>,
    }

    impl Harness {
        fn new(config: &ProxyServerConfig) -> Self {
            let (tx, rx) = mpsc::channel();
            let sequencer = Arc::new(Sequencer::new(
                RecordingResponder(Mutex::new(tx)),
                test_logger(),
            ));
            let storages: Vec<Arc<HeapStorage>> = (0..config.storage_servers.len())
                .map(|_| {
                    Arc::new(HeapStorage::new(
                        HEIGHT,
                        empty_bucket_template(config.bucket_size),
                    ))
                })
                .collect();
            let processor = Arc::new(Processor::new(
                config,
                storages.clone(),
                sequencer.clone(),
                test_logger(),
            ));
            Self {
                processor,
                storages,
                sequencer,
                responses: rx,
            }
        }

        /// Run one request through the full pipeline and wait for its
        /// sequenced response.
        fn run(&self, req: ClientRequest) -> (u64, Vec<u8>) {
            self.sequencer.enqueue(req.clone());
            self.processor.read_path(req).unwrap();
            self.responses
                .recv_timeout(Duration::from_secs(5))
                .expect("no response emitted")
        }
    }

    #[test]
    fn unmapped_read_returns_zeros_and_remaps() {
        let harness = Harness::new(&config(1, 1000));

        let (request_id, data) = harness.run(read_request(1, 9));
        assert_eq!(request_id, 1);
        assert_eq!(data, vec![0u8; B]);

        // Even a never-written block gets a position after a real access.
        assert!(harness.processor.position_map.get(9).is_some());
        assert!(harness.processor.inflight().is_empty());
    }

    #[test]
    fn write_then_read_round_trip() {
        let harness = Harness::new(&config(1, 1000));

        let (_, pre_image) = harness.run(write_request(1, 5, vec![0xCA, 0xFE, 0xBA, 0xBE]));
        assert_eq!(pre_image, vec![0u8; B], "first write sees zeros");
        assert!(harness.processor.position_map.get(5).is_some());

        let (_, data) = harness.run(read_request(2, 5));
        assert_eq!(data, vec![0xCA, 0xFE, 0xBA, 0xBE]);

        // A block lives in at most one of subtree and stash.
        for block in harness.processor.stash.snapshot() {
            assert!(
                harness
                    .processor
                    .subtree
                    .bucket_with_block(block.id())
                    .is_none(),
                "block {} is in both the stash and the subtree",
                block.id()
            );
        }
        assert!(harness.processor.inflight().is_empty());
    }

    #[test]
    fn sequential_writes_linearize() {
        let harness = Harness::new(&config(1, 1000));
        harness.run(write_request(1, 6, vec![1; B]));
        harness.run(write_request(2, 6, vec![2; B]));
        let (_, data) = harness.run(read_request(3, 6));
        assert_eq!(data, vec![2; B]);
    }

    #[test]
    fn concurrent_reads_of_one_block_coalesce() {
        let config = config(1, 1000);
        let (tx, rx) = mpsc::channel();
        let sequencer = Arc::new(Sequencer::new(
            RecordingResponder(Mutex::new(tx)),
            test_logger(),
        ));
        let inner = Arc::new(HeapStorage::new(HEIGHT, empty_bucket_template(Z)));
        let connection = SlowStorage {
            inner,
            delay: Duration::from_millis(150),
        };
        let processor = Arc::new(Processor::new(
            &config,
            vec![connection],
            sequencer.clone(),
            test_logger(),
        ));

        let first = read_request(1, 7);
        let second = read_request(2, 7);
        sequencer.enqueue(first.clone());
        sequencer.enqueue(second.clone());

        let processor1 = processor.clone();
        let worker1 = thread::spawn(move || processor1.read_path(first).unwrap());
        // Give the first request time to register; the slow fetch keeps it
        // in flight while the second arrives and coalesces onto it.
        thread::sleep(Duration::from_millis(50));
        let processor2 = processor.clone();
        let worker2 = thread::spawn(move || processor2.read_path(second).unwrap());

        worker1.join().unwrap();
        worker2.join().unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (1, vec![0u8; B]));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (2, vec![0u8; B]));

        assert!(processor.position_map.get(7).is_some());
        assert!(processor.inflight().is_empty());
    }

    #[test]
    fn flush_places_blocks_at_their_deepest_legal_level() {
        let harness = Harness::new(&config(1, 1000));
        let processor = &harness.processor;

        // Block 10 may sink to the leaf bucket; block 11 shares only the
        // root with the flushed path.
        processor.position_map.set(10, 5);
        processor.stash.add(Block::new(10, vec![1; B]));
        processor.position_map.set(11, 5 ^ 0b100);
        processor.stash.add(Block::new(11, vec![2; B]));

        processor.flush(5);

        assert!(processor.stash.is_empty());
        assert_eq!(
            processor.subtree.bucket_with_block(10).unwrap().node(),
            node_id(HEIGHT, 5, HEIGHT)
        );
        assert_eq!(processor.subtree.bucket_with_block(11).unwrap().node(), 0);
        assert_eq!(
            processor.write_queue().iter().copied().collect::<Vec<_>>(),
            vec![5]
        );
    }

    #[test]
    fn flush_overflow_returns_blocks_to_the_stash() {
        let harness = Harness::new(&config(1, 1000));
        let processor = &harness.processor;

        // Five blocks compete for the four leaf-bucket slots; the loser may
        // not take a shallower slot because its deepest legal level is the
        // leaf, so it returns to the stash.
        for id in 0..5u64 {
            processor.position_map.set(id, 5);
            processor.stash.add(Block::new(id, vec![id as u8; B]));
        }

        processor.flush(5);
        assert_eq!(processor.stash.len(), 1);
    }

    #[test]
    fn stash_overflow_is_survivable() {
        let mut config = config(1, 1000);
        config.stash_capacity = 2;

        let harness = Harness::new(&config);
        let processor = &harness.processor;

        // Six same-path blocks with four slots: flush leaves four in the
        // stash, above the configured capacity.
        for id in 0..6u64 {
            processor.position_map.set(id, 0);
            processor.stash.add(Block::new(id, vec![id as u8; B]));
        }
        processor.flush(0);
        assert!(processor.stash.len() > config.stash_capacity);

        // The proxy keeps serving.
        let (_, data) = harness.run(read_request(1, 0));
        assert_eq!(data, vec![0u8; B]);
    }

    #[test]
    fn write_back_fires_on_the_threshold() {
        let harness = Harness::new(&config(1, 3));

        harness.run(write_request(1, 1, vec![1; B]));
        harness.run(write_request(2, 2, vec![2; B]));
        assert!(harness.storages[0].write_batches().is_empty());

        harness.run(write_request(3, 3, vec![3; B]));
        let batches = harness.storages[0].write_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);

        // With nothing in flight the whole batch was prunable.
        assert_eq!(harness.processor.subtree.resident_len(), 0);
        assert!(
            harness.processor.subtree.resident_blocks() <= (HEIGHT as usize + 1) * Z * 3
        );

        // Empty request lists were pruned with the batch.
        assert_eq!(
            harness
                .processor
                .request_table
                .read()
                .expect("lock poisoned")
                .len(),
            0
        );
    }

    #[test]
    fn data_survives_a_write_back_round_trip() {
        let harness = Harness::new(&config(1, 3));

        harness.run(write_request(1, 1, vec![0xAA; B]));
        harness.run(write_request(2, 2, vec![0xBB; B]));
        harness.run(write_request(3, 3, vec![0xCC; B]));
        assert_eq!(harness.processor.subtree.resident_len(), 0);

        // Everything now lives only on the server; reads must recover it.
        let (_, data) = harness.run(read_request(4, 1));
        assert_eq!(data, vec![0xAA; B]);
        let (_, data) = harness.run(read_request(5, 2));
        assert_eq!(data, vec![0xBB; B]);
        let (_, data) = harness.run(read_request(6, 3));
        assert_eq!(data, vec![0xCC; B]);
    }

    #[test]
    fn failed_write_back_is_all_or_nothing() {
        let harness = Harness::new(&config(1, 2));
        harness.storages[0].inject_write_failures(1);

        harness.run(write_request(1, 1, vec![1; B]));
        harness.run(write_request(2, 2, vec![2; B]));

        // The batch failed: nothing committed, nothing pruned, and the
        // leaves went back to the queue for a later retry.
        assert!(harness.storages[0].write_batches().is_empty());
        assert!(harness.processor.subtree.resident_len() > 0);
        assert_eq!(harness.processor.write_queue().len(), 2);

        // Two more flushes re-arm the threshold; the retried batch is the
        // two re-queued leaves and commits this time.
        harness.run(write_request(3, 3, vec![3; B]));
        harness.run(write_request(4, 4, vec![4; B]));
        let batches = harness.storages[0].write_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);

        // And the data written before the failure is still intact.
        let (_, data) = harness.run(read_request(5, 1));
        assert_eq!(data, vec![1; B]);
    }

    #[test]
    fn tampered_path_is_fatal() {
        let config = config(1, 1000);
        let (tx, _rx) = mpsc::channel();
        let sequencer = Arc::new(Sequencer::new(
            RecordingResponder(Mutex::new(tx)),
            test_logger(),
        ));
        let path_len = PathCipher::new(&KEY, HEIGHT, Z, B).encrypted_path_len();
        let processor = Processor::new(
            &config,
            vec![TamperingStorage { path_len }],
            sequencer.clone(),
            test_logger(),
        );

        let req = read_request(1, 1);
        sequencer.enqueue(req.clone());
        match processor.read_path(req) {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("tampered path must not decrypt"),
        }
    }

    #[test]
    fn inflight_paths_is_a_multiset() {
        let harness = Harness::new(&config(1, 1000));
        let processor = &harness.processor;

        processor.inflight_increment(3);
        processor.inflight_increment(3);
        processor.inflight_decrement(3);
        assert!(processor.inflight().contains_key(&3));
        processor.inflight_decrement(3);
        assert!(processor.inflight().is_empty());
    }
}

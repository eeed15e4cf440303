use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arpc_proto::{ConnectionKey, DataHeader, Endpoint, PacketTypeId, RpcId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::pool::BufferPool;
use crate::timer::{TIMER_KEY_REASSEMBLY_SWEEP, TimerManager};

/// Entries untouched for this long are dropped by the cleanup sweep;
/// reliable transport, when present, forces retransmission of the message.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Number of state shards. Shard choice is a stable hash of the connection
/// key, so one connection's RPCs always land on one shard.
pub const REASSEMBLY_SHARDS: usize = 256;

/// A fully reassembled message with the quintuple captured from its first
/// fragment. The payload buffer comes from the pool and should be returned
/// there once consumed.
#[derive(Debug)]
pub struct CompleteMessage {
    pub rpc_id: RpcId,
    pub packet_type: PacketTypeId,
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Datagram source address of the fragments.
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
}

/// One stored fragment: the carrier datagram buffer is kept alive here so
/// the payload range stays valid until assembly.
struct FragmentSlot {
    carrier: Vec<u8>,
    range: Range<usize>,
}

struct Entry {
    rpc_id: RpcId,
    total_packets: u16,
    packet_type: PacketTypeId,
    src: Endpoint,
    dst: Endpoint,
    remote: SocketAddr,
    fragments: HashMap<u16, FragmentSlot>,
    last_seen: Instant,
    completed: bool,
}

impl Entry {
    fn new(remote: SocketAddr, header: &DataHeader, now: Instant) -> Self {
        Self {
            rpc_id: header.rpc_id,
            total_packets: header.total_packets,
            packet_type: header.packet_type,
            src: header.src,
            dst: header.dst,
            remote,
            fragments: HashMap::new(),
            last_seen: now,
            completed: false,
        }
    }

    fn release_fragments(&mut self, pool: &BufferPool) {
        for (_, slot) in self.fragments.drain() {
            pool.put(slot.carrier);
        }
    }
}

type Shard = Mutex<HashMap<(ConnectionKey, RpcId), Arc<Mutex<Entry>>>>;

/// Sharded reassembly of fragmented messages, keyed by
/// `(source connection, RPCID)`.
///
/// Shard mutexes are held only for map access; a per-entry lock serializes
/// fragment insertion for one RPC so concurrent RPCs on one connection
/// progress independently.
pub struct Reassembler {
    shards: Vec<Shard>,
    pool: Arc<BufferPool>,
    fragment_timeout: Duration,
}

impl Reassembler {
    pub fn new(pool: Arc<BufferPool>, fragment_timeout: Duration) -> Self {
        let mut shards = Vec::with_capacity(REASSEMBLY_SHARDS);
        for _ in 0..REASSEMBLY_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards,
            pool,
            fragment_timeout,
        }
    }

    fn shard(&self, key: ConnectionKey) -> &Shard {
        let mixed = key.0 ^ (key.0 >> 32);
        &self.shards[(mixed as usize) % REASSEMBLY_SHARDS]
    }

    /// Registers the periodic cleanup sweep, every `fragment_timeout / 2`.
    pub fn start_sweeper(reassembler: &Arc<Reassembler>, timers: &TimerManager) {
        let weak: Weak<Reassembler> = Arc::downgrade(reassembler);
        timers.schedule_periodic(
            TIMER_KEY_REASSEMBLY_SWEEP,
            reassembler.fragment_timeout / 2,
            move || {
                if let Some(reassembler) = weak.upgrade() {
                    reassembler.sweep(Instant::now());
                }
            },
        );
    }

    /// Inserts one fragment. `carrier` is the datagram buffer the fragment
    /// was decoded from and `payload_range` locates the payload inside it;
    /// the buffer is owned by the entry until the message completes or
    /// times out.
    ///
    /// Returns the complete message once the final fragment lands.
    pub fn insert(
        &self,
        remote: SocketAddr,
        header: &DataHeader,
        carrier: Vec<u8>,
        payload_range: Range<usize>,
        now: Instant,
    ) -> Option<CompleteMessage> {
        if header.total_packets == 0 || header.seq_number >= header.total_packets {
            warn!(
                rpc_id = %header.rpc_id,
                seq = header.seq_number,
                total = header.total_packets,
                "dropping fragment with out-of-range sequence"
            );
            self.pool.put(carrier);
            return None;
        }

        let key = (ConnectionKey::from_socket_addr(remote), header.rpc_id);
        let entry = {
            let mut shard = self.shard(key.0).lock();
            shard
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Entry::new(remote, header, now))))
                .clone()
        };

        let complete = {
            let mut entry = entry.lock();
            if entry.completed {
                // Fragment raced with this message's completion; nothing
                // left to contribute to.
                self.pool.put(carrier);
                return None;
            }
            if entry.total_packets != header.total_packets {
                // The sender re-fragmented under a different packet count.
                // Treat it as a fresh delivery attempt.
                warn!(
                    rpc_id = %header.rpc_id,
                    old = entry.total_packets,
                    new = header.total_packets,
                    "fragment count changed; resetting reassembly"
                );
                entry.release_fragments(&self.pool);
                *entry = Entry::new(remote, header, now);
            }
            entry.last_seen = now;
            // Duplicate arrivals overwrite idempotently.
            if let Some(old) = entry.fragments.insert(
                header.seq_number,
                FragmentSlot {
                    carrier,
                    range: payload_range,
                },
            ) {
                self.pool.put(old.carrier);
            }
            if entry.fragments.len() == entry.total_packets as usize {
                entry.completed = true;
                Some(self.assemble(&mut entry))
            } else {
                None
            }
        };

        let message = complete?;
        let mut shard = self.shard(key.0).lock();
        if let Some(current) = shard.get(&key)
            && Arc::ptr_eq(current, &entry)
        {
            shard.remove(&key);
        }
        debug!(
            rpc_id = %message.rpc_id,
            len = message.payload.len(),
            "message reassembled"
        );
        Some(message)
    }

    fn assemble(&self, entry: &mut Entry) -> CompleteMessage {
        let total_len: usize = entry.fragments.values().map(|s| s.range.len()).sum();
        let mut payload = self.pool.get(total_len);
        for seq in 0..entry.total_packets {
            // Completion guarantees exactly the sequence numbers 0..total.
            if let Some(slot) = entry.fragments.remove(&seq) {
                payload.extend_from_slice(&slot.carrier[slot.range.clone()]);
                self.pool.put(slot.carrier);
            }
        }
        CompleteMessage {
            rpc_id: entry.rpc_id,
            packet_type: entry.packet_type,
            src: entry.src,
            dst: entry.dst,
            remote: entry.remote,
            payload,
        }
    }

    /// Drops entries whose last activity is older than the fragment
    /// timeout. Partial messages vanish silently.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|(_, rpc_id), entry| {
                let mut entry = entry.lock();
                let expired =
                    now.saturating_duration_since(entry.last_seen) >= self.fragment_timeout;
                if expired {
                    debug!(rpc_id = %rpc_id, "reassembly entry timed out");
                    entry.release_fragments(&self.pool);
                    removed += 1;
                }
                !expired
            });
        }
        removed
    }

    /// Number of in-progress entries, for tests and diagnostics.
    pub fn pending(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

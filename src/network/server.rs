use crate::config::Config;
use crate::core::{Block, Blockchain, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::node::resolve;
use crate::network::{Delivery, Nodes, SyncState};
use crate::storage::{MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const NODE_VERSION: usize = 1;
const TCP_WRITE_TIMEOUT: u64 = 5000;
const TCP_READ_TIMEOUT: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Tx,
    Block,
}

/// Wire message. Blocks and transactions travel bincode-encoded inside the
/// JSON envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Package {
    Block {
        addr_from: String,
        block: Vec<u8>,
    },
    GetBlocks {
        addr_from: String,
    },
    GetData {
        addr_from: String,
        op_type: OpType,
        id: Vec<u8>,
    },
    Inv {
        addr_from: String,
        op_type: OpType,
        items: Vec<Vec<u8>>,
    },
    Tx {
        addr_from: String,
        transaction: Vec<u8>,
    },
    Version {
        addr_from: String,
        version: usize,
        best_height: usize,
    },
}

impl Package {
    pub fn addr_from(&self) -> &str {
        match self {
            Package::Block { addr_from, .. }
            | Package::GetBlocks { addr_from }
            | Package::GetData { addr_from, .. }
            | Package::Inv { addr_from, .. }
            | Package::Tx { addr_from, .. }
            | Package::Version { addr_from, .. } => addr_from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Package::Block { .. } => "block",
            Package::GetBlocks { .. } => "getblocks",
            Package::GetData { .. } => "getdata",
            Package::Inv { .. } => "inv",
            Package::Tx { .. } => "tx",
            Package::Version { .. } => "version",
        }
    }
}

/// A package addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: String,
    pub package: Package,
}

impl Envelope {
    pub fn new(to: impl Into<String>, package: Package) -> Envelope {
        Envelope {
            to: to.into(),
            package,
        }
    }
}

/// Everything one node knows: its chain, the unspent index, peers, pending
/// transactions and the state of a running block download. Handlers return
/// the packages to send instead of sending them.
pub struct NodeContext {
    node_addr: String,
    bootstrap_node: String,
    mining_addr: Option<String>,
    mining_threshold: usize,
    blockchain: Blockchain,
    utxo_set: UTXOSet,
    /// Held across every chain mutation together with its UTXO maintenance
    chain_lock: Mutex<()>,
    nodes: Nodes,
    mempool: MemoryPool,
    sync: SyncState,
}

impl NodeContext {
    /// Builds the context and rebuilds the UTXO set from the chain.
    pub fn new(
        config: &Config,
        blockchain: Blockchain,
        mining_addr: Option<String>,
    ) -> Result<NodeContext> {
        let utxo_set = UTXOSet::new(blockchain.clone());
        utxo_set.reindex()?;

        let nodes = Nodes::new();
        nodes.add_node(config.bootstrap_node.clone());

        Ok(NodeContext {
            node_addr: config.node_addr.clone(),
            bootstrap_node: config.bootstrap_node.clone(),
            mining_addr,
            mining_threshold: config.mining_threshold,
            blockchain,
            utxo_set,
            chain_lock: Mutex::new(()),
            nodes,
            mempool: MemoryPool::new(),
            sync: SyncState::new(),
        })
    }

    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn utxo_set(&self) -> &UTXOSet {
        &self.utxo_set
    }

    pub fn mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn is_miner(&self) -> bool {
        self.mining_addr.is_some()
    }

    fn lock_chain(&self) -> MutexGuard<'_, ()> {
        self.chain_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A node other than the bootstrap node introduces itself to it.
    pub fn startup_messages(&self) -> Result<Vec<Envelope>> {
        if self.node_addr == self.bootstrap_node {
            return Ok(vec![]);
        }
        Ok(vec![self.version_to(&self.bootstrap_node)?])
    }

    pub fn evict_peer(&self, addr: &str) {
        if self.nodes.node_is_known(addr) {
            warn!("Evicting unreachable peer {addr}");
            self.nodes.evict_node(addr);
        }
        if self.sync.abort_from(addr) {
            warn!("Aborted block download from {addr}");
        }
    }

    pub fn process_message(&self, pkg: Package) -> Result<Vec<Envelope>> {
        match pkg {
            Package::Block { addr_from, block } => self.handle_block(&addr_from, &block),
            Package::GetBlocks { addr_from } => self.handle_get_blocks(&addr_from),
            Package::GetData {
                addr_from,
                op_type,
                id,
            } => self.handle_get_data(&addr_from, op_type, &id),
            Package::Inv {
                addr_from,
                op_type,
                items,
            } => self.handle_inv(&addr_from, op_type, items),
            Package::Tx {
                addr_from,
                transaction,
            } => self.handle_tx(&addr_from, &transaction),
            Package::Version {
                addr_from,
                version,
                best_height,
            } => self.handle_version(&addr_from, version, best_height),
        }
    }

    fn version_to(&self, addr: &str) -> Result<Envelope> {
        Ok(Envelope::new(
            addr,
            Package::Version {
                addr_from: self.node_addr.clone(),
                version: NODE_VERSION,
                best_height: self.blockchain.get_best_height()?,
            },
        ))
    }

    fn get_data_to(&self, addr: &str, op_type: OpType, id: Vec<u8>) -> Envelope {
        Envelope::new(
            addr,
            Package::GetData {
                addr_from: self.node_addr.clone(),
                op_type,
                id,
            },
        )
    }

    /// `package` for every known peer except this node and `except`.
    fn broadcast(&self, package: &Package, except: Option<&str>) -> Vec<Envelope> {
        self.nodes
            .get_nodes()
            .into_iter()
            .map(|node| node.get_addr())
            .filter(|addr| *addr != self.node_addr && Some(addr.as_str()) != except)
            .map(|addr| Envelope::new(addr, package.clone()))
            .collect()
    }

    fn handle_version(
        &self,
        addr_from: &str,
        version: usize,
        best_height: usize,
    ) -> Result<Vec<Envelope>> {
        info!("Version {version} from {addr_from}, best_height={best_height}");
        self.nodes.add_node(addr_from.to_string());

        let local_best_height = self.blockchain.get_best_height()?;
        if local_best_height < best_height {
            return Ok(vec![Envelope::new(
                addr_from,
                Package::GetBlocks {
                    addr_from: self.node_addr.clone(),
                },
            )]);
        }
        if local_best_height > best_height {
            return Ok(vec![self.version_to(addr_from)?]);
        }
        Ok(vec![])
    }

    fn handle_get_blocks(&self, addr_from: &str) -> Result<Vec<Envelope>> {
        let blocks = self.blockchain.get_block_hashes()?;
        Ok(vec![Envelope::new(
            addr_from,
            Package::Inv {
                addr_from: self.node_addr.clone(),
                op_type: OpType::Block,
                items: blocks,
            },
        )])
    }

    fn handle_inv(
        &self,
        addr_from: &str,
        op_type: OpType,
        items: Vec<Vec<u8>>,
    ) -> Result<Vec<Envelope>> {
        info!("Inventory of {} {op_type:?} items from {addr_from}", items.len());
        match op_type {
            OpType::Block => {
                let mut unknown = vec![];
                for hash in items {
                    if !self.blockchain.has_block(&hash)? {
                        unknown.push(hash);
                    }
                }
                if unknown.is_empty() {
                    return Ok(vec![]);
                }
                match self.sync.begin(addr_from, unknown) {
                    Some(first) => Ok(vec![self.get_data_to(addr_from, OpType::Block, first)]),
                    None => {
                        if let Some(source) = self.sync.source() {
                            info!("Download from {source} in progress, ignoring inventory from {addr_from}");
                        }
                        Ok(vec![])
                    }
                }
            }
            OpType::Tx => Ok(items
                .into_iter()
                .filter(|txid| !self.mempool.contains(&HEXLOWER.encode(txid)))
                .map(|txid| self.get_data_to(addr_from, OpType::Tx, txid))
                .collect()),
        }
    }

    fn handle_get_data(&self, addr_from: &str, op_type: OpType, id: &[u8]) -> Result<Vec<Envelope>> {
        match op_type {
            OpType::Block => match self.blockchain.get_block(id)? {
                Some(block) => Ok(vec![Envelope::new(
                    addr_from,
                    Package::Block {
                        addr_from: self.node_addr.clone(),
                        block: block.serialize()?,
                    },
                )]),
                None => {
                    debug!("Block {} requested by {addr_from} not found", HEXLOWER.encode(id));
                    Ok(vec![])
                }
            },
            OpType::Tx => match self.mempool.get(&HEXLOWER.encode(id)) {
                Some(tx) => Ok(vec![Envelope::new(
                    addr_from,
                    Package::Tx {
                        addr_from: self.node_addr.clone(),
                        transaction: tx.serialize()?,
                    },
                )]),
                None => Ok(vec![]),
            },
        }
    }

    fn handle_block(&self, addr_from: &str, block_bytes: &[u8]) -> Result<Vec<Envelope>> {
        let block = match Self::checked_block(addr_from, block_bytes) {
            Ok(block) => block,
            Err(e) => {
                if self.sync.abort_from(addr_from) {
                    warn!("Aborted block download from {addr_from}");
                }
                return Err(e);
            }
        };
        info!("Received block {} from {addr_from}", block.get_hash_hex());

        match self.sync.record(addr_from, block) {
            Delivery::Expected => {}
            Delivery::Unsolicited(block) => return self.reconcile(addr_from, vec![block]),
            Delivery::Unexpected(block) => {
                debug!(
                    "Ignoring block {} from {addr_from}, not part of the running download",
                    block.get_hash_hex()
                );
                return Ok(vec![]);
            }
        }

        if let Some((source, next)) = self.sync.next_request() {
            return Ok(vec![self.get_data_to(&source, OpType::Block, next)]);
        }
        let blocks = self.sync.take_downloaded();
        self.reconcile(addr_from, blocks)
    }

    fn checked_block(addr_from: &str, block_bytes: &[u8]) -> Result<Block> {
        let block = Block::deserialize(block_bytes)?;
        if !ProofOfWork::validate(&block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "{} from {addr_from} has an invalid proof of work",
                block.get_hash_hex()
            )));
        }
        Ok(block)
    }

    /// Applies a finished download (tip first). A chain reaching genesis or
    /// forking from a known block competes with the local chain by length;
    /// blocks extending the tip are appended; anything else makes us ask the
    /// sender for its full chain.
    fn reconcile(&self, addr_from: &str, blocks: Vec<Block>) -> Result<Vec<Envelope>> {
        let Some(oldest) = blocks.last() else {
            return Ok(vec![]);
        };
        let _guard = self.lock_chain();
        let tip = self.blockchain.get_tip_hash();
        let parent = oldest.get_pre_block_hash().to_vec();

        if parent == tip {
            for block in blocks.iter().rev() {
                if self.blockchain.add_block(block, &self.utxo_set)? {
                    self.utxo_set.update(block)?;
                    self.mempool.remove_confirmed(block);
                }
            }
            return Ok(vec![]);
        }

        if oldest.is_genesis() || self.blockchain.has_block(&parent)? {
            let candidate = self.with_local_ancestry(blocks)?;
            if self.blockchain.replace_chain(&candidate)? {
                self.utxo_set.reindex()?;
                for block in &candidate {
                    self.mempool.remove_confirmed(block);
                }
            } else {
                info!(
                    "Kept local chain; chain of {} blocks from {addr_from} is not longer",
                    candidate.len()
                );
            }
            return Ok(vec![]);
        }

        info!(
            "Parent {} is unknown, requesting the chain of {addr_from}",
            HEXLOWER.encode(&parent)
        );
        Ok(vec![Envelope::new(
            addr_from,
            Package::GetBlocks {
                addr_from: self.node_addr.clone(),
            },
        )])
    }

    /// Extends a downloaded tip-first segment with the stored blocks below it.
    fn with_local_ancestry(&self, mut blocks: Vec<Block>) -> Result<Vec<Block>> {
        let mut next = match blocks.last() {
            Some(oldest) if !oldest.is_genesis() => oldest.get_pre_block_hash().to_vec(),
            _ => return Ok(blocks),
        };
        loop {
            let block = self.blockchain.get_block(&next)?.ok_or_else(|| {
                BlockchainError::NotFound(format!("block {}", HEXLOWER.encode(&next)))
            })?;
            let done = block.is_genesis();
            next = block.get_pre_block_hash().to_vec();
            blocks.push(block);
            if done {
                return Ok(blocks);
            }
        }
    }

    fn handle_tx(&self, addr_from: &str, transaction: &[u8]) -> Result<Vec<Envelope>> {
        let tx = Transaction::deserialize(transaction)?;
        let txid_hex = tx.get_id_hex();
        if self.mempool.contains(&txid_hex) {
            debug!("Transaction {txid_hex} is already pending");
            return Ok(vec![]);
        }
        if tx.is_coinbase() {
            return Err(BlockchainError::Transaction(format!(
                "{txid_hex}: coinbase transactions are not relayed"
            )));
        }

        {
            let _guard = self.lock_chain();
            self.blockchain.validate_transaction(&tx, &self.utxo_set)?;
            if self.mempool.conflicts_with(&tx) {
                return Err(BlockchainError::Transaction(format!(
                    "{txid_hex} conflicts with a pending transaction"
                )));
            }
            if !self.mempool.add(tx.clone()) {
                return Ok(vec![]);
            }
        }
        info!("Accepted transaction {txid_hex} from {addr_from}");

        let mut envelopes = self.broadcast(
            &Package::Inv {
                addr_from: self.node_addr.clone(),
                op_type: OpType::Tx,
                items: vec![tx.get_id_bytes()],
            },
            Some(addr_from),
        );

        if self.is_miner() && self.mempool.len() >= self.mining_threshold {
            match self.mine_pending() {
                Ok(announcements) => envelopes.extend(announcements),
                Err(e) => error!("Mining round failed: {e}"),
            }
        }
        Ok(envelopes)
    }

    /// One mining round: takes the whole pool, keeps what is still valid,
    /// mines it with a reward for the miner and announces the block. On
    /// failure the valid transactions go back to the pool.
    pub fn mine_pending(&self) -> Result<Vec<Envelope>> {
        let Some(mining_addr) = self.mining_addr.as_deref() else {
            return Ok(vec![]);
        };
        let _guard = self.lock_chain();

        let mut selected = vec![];
        let mut spent: HashSet<(Vec<u8>, i64)> = HashSet::new();
        for tx in self.mempool.take_all() {
            if let Err(e) = self.blockchain.validate_transaction(&tx, &self.utxo_set) {
                warn!("Dropping transaction {}: {e}", tx.get_id_hex());
                continue;
            }
            let outpoints: Vec<(Vec<u8>, i64)> = tx
                .get_vin()
                .iter()
                .map(|vin| (vin.get_txid().to_vec(), vin.get_vout()))
                .collect();
            if outpoints.iter().any(|outpoint| spent.contains(outpoint)) {
                warn!("Dropping conflicting transaction {}", tx.get_id_hex());
                continue;
            }
            spent.extend(outpoints);
            selected.push(tx);
        }
        if selected.is_empty() {
            info!("No valid transactions to mine");
            return Ok(vec![]);
        }

        let mined = Transaction::new_coinbase_tx(mining_addr, "").and_then(|coinbase| {
            let mut txs = vec![coinbase];
            txs.extend(selected.iter().cloned());
            self.blockchain.mine_block(&txs, &self.utxo_set)
        });
        let block = match mined {
            Ok(block) => block,
            Err(e) => {
                self.mempool.restore(selected);
                return Err(e);
            }
        };

        if let Err(e) = self.utxo_set.update(&block) {
            warn!("Incremental UTXO update failed ({e}), reindexing");
            self.utxo_set.reindex()?;
        }
        info!("New block {} is mined!", block.get_hash_hex());

        Ok(self.broadcast(
            &Package::Inv {
                addr_from: self.node_addr.clone(),
                op_type: OpType::Block,
                items: vec![block.get_hash().to_vec()],
            },
            None,
        ))
    }
}

/// TCP front end of a [`NodeContext`]: one thread per inbound connection,
/// one outbound connection per package.
pub struct Server {
    context: Arc<NodeContext>,
}

impl Server {
    pub fn new(context: NodeContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn run(&self) -> Result<()> {
        let addr = self.context.node_addr().to_string();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        info!("Server listening on {addr}");

        Self::dispatch(&self.context, self.context.startup_messages()?);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let context = Arc::clone(&self.context);
                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(&context, stream) {
                            error!("Connection closed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(context: &NodeContext, stream: TcpStream) -> Result<()> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| BlockchainError::Network(format!("Failed to get peer address: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT)))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let reader = BufReader::new(&stream);
        let pkg_reader = Deserializer::from_reader(reader).into_iter::<Package>();

        for pkg in pkg_reader {
            let pkg = pkg.map_err(|e| {
                BlockchainError::Network(format!("Malformed package from {peer_addr}: {e}"))
            })?;
            info!(
                "Received {} from {} ({peer_addr})",
                pkg.kind(),
                pkg.addr_from()
            );

            match context.process_message(pkg) {
                Ok(envelopes) => Self::dispatch(context, envelopes),
                Err(e) => error!("Error processing message from {peer_addr}: {e}"),
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    /// Sends each envelope; peers that cannot be reached are forgotten.
    pub fn dispatch(context: &NodeContext, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            if let Err(e) = send_data(&envelope.to, &envelope.package) {
                warn!("Peer {} is not available: {e}", envelope.to);
                context.evict_peer(&envelope.to);
            }
        }
    }
}

/// Opens a connection to `addr`, writes `pkg` and closes it.
pub fn send_data(addr: &str, pkg: &Package) -> Result<()> {
    debug!("Sending {} to {addr}", pkg.kind());
    let socket_addr = resolve(addr)?;

    let mut stream =
        TcpStream::connect_timeout(&socket_addr, Duration::from_millis(TCP_WRITE_TIMEOUT))
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;

    serde_json::to_writer(&stream, pkg)
        .map_err(|e| BlockchainError::Network(format!("Failed to send data: {e}")))?;
    stream.flush()?;
    Ok(())
}

/// Hands a transaction to the node at `addr` on behalf of `node_addr`.
pub fn send_tx(node_addr: &str, addr: &str, tx: &Transaction) -> Result<()> {
    let pkg = Package::Tx {
        addr_from: node_addr.to_string(),
        transaction: tx.serialize()?,
    };
    send_data(addr, &pkg)
}

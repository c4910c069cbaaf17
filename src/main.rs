use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info, LevelFilter};
use reciprocus::{
    send_tx, validate_address, Blockchain, BlockchainError, Command, Config, NodeContext, Opt,
    ProofOfWork, Result, Server, Transaction, UTXOSet, Wallets,
};
use std::process;

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    let result = Config::load(opt.config.as_deref()).and_then(|config| run_command(&config, opt.command));
    if let Err(e) = result {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn require_address(address: &str) -> Result<()> {
    if !validate_address(address) {
        return Err(BlockchainError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn open_blockchain(config: &Config) -> Result<Blockchain> {
    Ok(Blockchain::open(config.store_path())?.with_mining_workers(config.mining_threads))
}

fn run_command(config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Createblockchain { address } => {
            require_address(&address)?;
            let blockchain = Blockchain::create_blockchain(&address, config.store_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            require_address(&address)?;
            let utxo_set = UTXOSet::new(open_blockchain(config)?);
            let balance = utxo_set.get_balance(&address)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            require_address(&from)?;
            require_address(&to)?;

            let blockchain = open_blockchain(config)?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let wallets = Wallets::load(config.wallet_path())?;
            let wallet = wallets.require_wallet(&from)?;

            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase = Transaction::new_coinbase_tx(&from, "")?;
                let block = blockchain.mine_block(&[coinbase, transaction], &utxo_set)?;
                utxo_set.update(&block)?;
            } else {
                send_tx(&config.node_addr, &config.bootstrap_node, &transaction)?;
                info!(
                    "Sent transaction {} to {}",
                    transaction.get_id_hex(),
                    config.bootstrap_node
                );
            }
            println!("Success!")
        }
        Command::Printchain => {
            for block in open_blockchain(config)?.iterator() {
                let block = block?;
                println!("============ Block {} ============", block.get_hash_hex());
                println!("Prev. block: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Nonce: {}", block.get_nonce());
                println!("PoW: {}", ProofOfWork::validate(&block));
                for tx in block.get_transactions() {
                    println!("{tx}");
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let utxo_set = UTXOSet::new(open_blockchain(config)?);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = &miner {
                require_address(addr)?;
                println!("Mining is on. Address to receive rewards: {addr}");
            }
            if config.is_bootstrap() {
                info!("Starting bootstrap node {}", config.node_addr);
            } else {
                info!(
                    "Starting node {}, bootstrap node is {}",
                    config.node_addr, config.bootstrap_node
                );
            }

            let blockchain = open_blockchain(config)?;
            let context = NodeContext::new(config, blockchain, miner)?;
            Server::new(context).run()?
        }
    }
    Ok(())
}

//! Ledger integration tests
//!
//! Drive the public API the way the command-line client does: wallets on
//! disk, a chain in a sled directory and the UTXO index next to it.

use reciprocus::core::{Blockchain, ProofOfWork, Transaction, SUBSIDY};
use reciprocus::error::BlockchainError;
use reciprocus::storage::UTXOSet;
use reciprocus::wallet::{convert_address, hash_pub_key, validate_address, Wallets};
use tempfile::tempdir;

#[test]
fn test_send_and_mine_moves_value() {
    let temp_dir = tempdir().unwrap();
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let alice = wallets.create_wallet().unwrap();
    let bob = wallets.create_wallet().unwrap();
    let carol = wallets.create_wallet().unwrap();

    let blockchain = Blockchain::create_blockchain(&alice, temp_dir.path().join("chain")).unwrap();
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex().unwrap();
    assert_eq!(utxo_set.get_balance(&alice).unwrap(), SUBSIDY);

    let tx = Transaction::new_utxo_transaction(
        wallets.require_wallet(&alice).unwrap(),
        &bob,
        30,
        &utxo_set,
    )
    .unwrap();
    let coinbase = Transaction::new_coinbase_tx(&carol, "").unwrap();
    let block = blockchain.mine_block(&[coinbase, tx], &utxo_set).unwrap();
    utxo_set.update(&block).unwrap();

    assert!(ProofOfWork::validate(&block));
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
    assert_eq!(utxo_set.get_balance(&alice).unwrap(), 70);
    assert_eq!(utxo_set.get_balance(&bob).unwrap(), 30);
    assert_eq!(utxo_set.get_balance(&carol).unwrap(), SUBSIDY);
    // Genesis coinbase is fully spent; the new coinbase and the transfer remain
    assert_eq!(utxo_set.count_transactions().unwrap(), 2);
}

#[test]
fn test_overspend_is_rejected() {
    let temp_dir = tempdir().unwrap();
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let alice = wallets.create_wallet().unwrap();
    let bob = wallets.create_wallet().unwrap();

    let blockchain = Blockchain::create_blockchain(&alice, temp_dir.path().join("chain")).unwrap();
    let utxo_set = UTXOSet::new(blockchain);
    utxo_set.reindex().unwrap();

    let result = Transaction::new_utxo_transaction(
        wallets.require_wallet(&alice).unwrap(),
        &bob,
        SUBSIDY + 1,
        &utxo_set,
    );
    assert!(matches!(
        result,
        Err(BlockchainError::InsufficientFunds {
            required: 101,
            available: 100
        })
    ));
}

#[test]
fn test_incremental_update_matches_reindex() {
    let temp_dir = tempdir().unwrap();
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let alice = wallets.create_wallet().unwrap();
    let bob = wallets.create_wallet().unwrap();

    let blockchain = Blockchain::create_blockchain(&alice, temp_dir.path().join("chain")).unwrap();
    let utxo_set = UTXOSet::new(blockchain.clone());
    utxo_set.reindex().unwrap();

    for amount in [10, 20, 5] {
        let tx = Transaction::new_utxo_transaction(
            wallets.require_wallet(&alice).unwrap(),
            &bob,
            amount,
            &utxo_set,
        )
        .unwrap();
        let coinbase = Transaction::new_coinbase_tx(&alice, "").unwrap();
        let block = blockchain.mine_block(&[coinbase, tx], &utxo_set).unwrap();
        utxo_set.update(&block).unwrap();
    }
    let incremental = utxo_set.snapshot().unwrap();

    utxo_set.reindex().unwrap();
    assert_eq!(utxo_set.snapshot().unwrap(), incremental);
    assert_eq!(utxo_set.get_balance(&bob).unwrap(), 35);
    assert_eq!(utxo_set.get_balance(&alice).unwrap(), 4 * SUBSIDY - 35);
}

#[test]
fn test_chain_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("chain");
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let alice = wallets.create_wallet().unwrap();

    let tip = {
        let blockchain = Blockchain::create_blockchain(&alice, &path).unwrap();
        let utxo_set = UTXOSet::new(blockchain.clone());
        let coinbase = Transaction::new_coinbase_tx(&alice, "").unwrap();
        blockchain.mine_block(&[coinbase], &utxo_set).unwrap();
        blockchain.store().flush().unwrap();
        blockchain.get_tip_hash()
    };

    let blockchain = Blockchain::open(&path).unwrap();
    assert_eq!(blockchain.get_tip_hash(), tip);
    assert_eq!(blockchain.get_best_height().unwrap(), 1);
    let utxo_set = UTXOSet::new(blockchain);
    utxo_set.reindex().unwrap();
    assert_eq!(utxo_set.get_balance(&alice).unwrap(), 2 * SUBSIDY);

    let reloaded = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    assert_eq!(reloaded.get_addresses(), vec![alice]);
}

#[test]
fn test_lifecycle_errors() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("chain");
    assert!(matches!(
        Blockchain::open(&path),
        Err(BlockchainError::NotInitialized)
    ));

    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let alice = wallets.create_wallet().unwrap();
    let blockchain = Blockchain::create_blockchain(&alice, &path).unwrap();
    drop(blockchain);
    assert!(matches!(
        Blockchain::create_blockchain(&alice, &path),
        Err(BlockchainError::AlreadyInitialized)
    ));
}

#[test]
fn test_address_round_trip() {
    let temp_dir = tempdir().unwrap();
    let mut wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
    let address = wallets.create_wallet().unwrap();
    let wallet = wallets.require_wallet(&address).unwrap();

    assert!(validate_address(&address));
    assert_eq!(convert_address(&hash_pub_key(wallet.get_public_key())), address);

    let mut corrupted: Vec<char> = address.chars().collect();
    let last = corrupted.len() - 1;
    corrupted[last] = if corrupted[last] == '1' { '2' } else { '1' };
    let corrupted: String = corrupted.into_iter().collect();
    assert!(!validate_address(&corrupted));
}

// Value moves through unspent transaction outputs: every transaction consumes
// earlier outputs through its inputs and creates new outputs for later spends.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{hash_pub_key, locking_hash_from_address, Wallet};
use data_encoding::HEXLOWER;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Reward carried by every coinbase transaction.
pub const SUBSIDY: u64 = 100;

/// Output index a coinbase input points at.
const COINBASE_VOUT: i64 = -1;

/// Reference to an earlier output together with the proof of ownership.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>, // r || s; the memo for coinbase inputs
    pub_key: Vec<u8>,
}

impl TXInput {
    pub fn new(txid: &[u8], vout: i64) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_txid_hex(&self) -> String {
        HEXLOWER.encode(self.txid.as_slice())
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, if it can be one.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    /// True when this input's public key hashes to `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        let locking_hash = hash_pub_key(self.pub_key.as_slice());
        locking_hash.eq(pub_key_hash)
    }
}

/// An amount locked to the hash of a public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let mut output = TXOutput {
            value,
            pub_key_hash: vec![],
        };
        output.lock(address)?;
        Ok(output)
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    fn lock(&mut self, address: &str) -> Result<()> {
        self.pub_key_hash = locking_hash_from_address(address)?;
        Ok(())
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Issues [`SUBSIDY`] to `to`. An empty memo is replaced with random bytes
    /// so two rewards to the same address never share an id.
    pub fn new_coinbase_tx(to: &str, memo: &str) -> Result<Transaction> {
        let txout = TXOutput::new(SUBSIDY, to)?;
        let payload = if memo.is_empty() {
            Uuid::new_v4().as_bytes().to_vec()
        } else {
            memo.as_bytes().to_vec()
        };
        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: payload,
            pub_key: vec![],
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Builds and signs a transfer of `amount` from `wallet` to `to`, paying
    /// change back to the wallet's own address.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }
        let recipient = TXOutput::new(amount, to)?;

        let public_key_hash = wallet.get_pub_key_hash();
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(public_key_hash.as_slice(), amount)?;
        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Transaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                let vout = i64::try_from(out).map_err(|_| {
                    BlockchainError::Transaction(format!("Output index {out} out of range"))
                })?;
                inputs.push(TXInput {
                    txid: txid.clone(),
                    vout,
                    signature: vec![],
                    pub_key: wallet.get_public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![recipient];
        if accumulated > amount {
            outputs.push(TXOutput {
                value: accumulated - amount,
                pub_key_hash: public_key_hash,
            });
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };

        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        tx.id = tx.hash()?;
        debug!(
            "Built transaction {} spending {accumulated} for {amount}",
            tx.get_id_hex()
        );
        Ok(tx)
    }

    /// Copy with every signature and public key cleared.
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    /// Output referenced by `input`, looked up in `prev_txs`.
    fn referenced_output<'a>(
        input: &TXInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<&'a TXOutput> {
        let txid_hex = input.get_txid_hex();
        let prev_tx = prev_txs
            .get(&txid_hex)
            .ok_or_else(|| BlockchainError::MissingPriorTransaction(txid_hex.clone()))?;
        input
            .output_index()
            .and_then(|index| prev_tx.vout.get(index))
            .ok_or_else(|| {
                BlockchainError::UnknownInput(format!("{txid_hex}:{}", input.get_vout()))
            })
    }

    /// Signs every input. The digest for input `i` is the hash of the trimmed
    /// copy with input `i`'s key field set to the locking hash it spends.
    pub fn sign(
        &mut self,
        pkcs8: &[u8],
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter_mut().enumerate() {
            let output = Self::referenced_output(vin, prev_txs)?;

            tx_copy.vin[idx].pub_key = output.pub_key_hash.clone();
            let digest = tx_copy.hash()?;
            tx_copy.vin[idx].pub_key = vec![];

            vin.signature = ecdsa_p256_sha256_sign_digest(pkcs8, digest.as_slice())?;
        }
        Ok(())
    }

    /// Checks every input against the outputs it spends. A prior transaction
    /// missing from `prev_txs` is an error; any bad input makes the result
    /// `false`.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        for vin in &self.vin {
            let txid_hex = vin.get_txid_hex();
            if !prev_txs.contains_key(&txid_hex) {
                return Err(BlockchainError::MissingPriorTransaction(txid_hex));
            }
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let output = match Self::referenced_output(vin, prev_txs) {
                Ok(output) => output,
                Err(e) => {
                    debug!("Transaction {}: {e}", self.get_id_hex());
                    return Ok(false);
                }
            };
            if !vin.uses_key(output.get_pub_key_hash()) {
                debug!(
                    "Transaction {}: input {idx} key does not match locking hash",
                    self.get_id_hex()
                );
                return Ok(false);
            }

            tx_copy.vin[idx].pub_key = output.pub_key_hash.clone();
            let digest = tx_copy.hash()?;
            tx_copy.vin[idx].pub_key = vec![];

            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                digest.as_slice(),
            ) {
                debug!(
                    "Transaction {}: bad signature on input {idx}",
                    self.get_id_hex()
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// SHA-256 of the serialization with an empty id.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(tx_copy.serialize()?.as_slice()))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_bytes(&self) -> Vec<u8> {
        self.id.clone()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(self.id.as_slice())
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

#[cfg(test)]
impl Transaction {
    /// Copy carrying `id` instead of the hash of its contents.
    pub fn with_id(&self, id: Vec<u8>) -> Transaction {
        Transaction {
            id,
            ..self.clone()
        }
    }

    /// Copy whose first output pays `value`, re-hashed but not re-signed.
    pub fn with_first_output_value(&self, value: u64) -> Transaction {
        let mut tx = self.clone();
        tx.vout[0].value = value;
        tx.id = tx.hash().unwrap();
        tx
    }

    /// Spends exactly `inputs` into `outputs`, signed by `wallet`, with no
    /// balance checks.
    pub fn signed_transfer(
        wallet: &Wallet,
        inputs: &[(Vec<u8>, i64)],
        outputs: Vec<TXOutput>,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin: inputs
                .iter()
                .map(|(txid, vout)| TXInput {
                    txid: txid.clone(),
                    vout: *vout,
                    signature: vec![],
                    pub_key: wallet.get_public_key().to_vec(),
                })
                .collect(),
            vout: outputs,
        };
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        tx.id = tx.hash()?;
        Ok(tx)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.get_id_hex())?;
        for (idx, input) in self.vin.iter().enumerate() {
            writeln!(f, "     Input {idx}:")?;
            writeln!(f, "       TXID:      {}", input.get_txid_hex())?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", HEXLOWER.encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", HEXLOWER.encode(&input.pub_key))?;
        }
        for (idx, output) in self.vout.iter().enumerate() {
            writeln!(f, "     Output {idx}:")?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", HEXLOWER.encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}

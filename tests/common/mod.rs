#![allow(dead_code)]

use std::collections::HashMap;

use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::{Address, Network, OutPoint, PublicKey, Script, ScriptBuf, TxOut};

use bitcoin_tx_assembler::config::UtxoRecord;

pub fn keypair(seed: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    bytes[0] = 0x02;
    bytes[31] = seed;
    let secret_key = SecretKey::from_slice(&bytes).unwrap();
    (secret_key, PublicKey::new(secret_key.public_key(&secp)))
}

pub fn sign(secret_key: &SecretKey, digest_hex: &str) -> String {
    let digest: [u8; 32] = hex::decode(digest_hex).unwrap().try_into().unwrap();
    let secp = Secp256k1::new();
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret_key);
    hex::encode(signature.serialize_der())
}

pub fn p2pkh_address(public_key: &PublicKey) -> Address {
    Address::from_script(&ScriptBuf::new_p2pkh(&public_key.pubkey_hash()), Network::Testnet).unwrap()
}

pub fn p2sh_address(redeem_script: &Script) -> Address {
    Address::from_script(&ScriptBuf::new_p2sh(&redeem_script.script_hash()), Network::Testnet).unwrap()
}

pub fn record(txid_byte: u8, vout: u32, value_sats: u64, script_pubkey: &Script) -> UtxoRecord {
    UtxoRecord {
        txid: hex::encode([txid_byte; 32]),
        vout,
        value_sats,
        script_pubkey_hex: script_pubkey.to_hex_string(),
        confirmations: 1,
        addresses: Vec::new(),
    }
}

/// レコードが指す出力をインタプリタ検証用の参照表にする
pub fn spent_outputs(records: &[UtxoRecord]) -> HashMap<OutPoint, TxOut> {
    records
        .iter()
        .map(|record| {
            let utxo = record.clone().into_unspent(Network::Testnet).unwrap();
            (utxo.out_point, TxOut { value: utxo.value, script_pubkey: utxo.script_pubkey })
        })
        .collect()
}

//! 単体テスト用の決定的な鍵とUTXO

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, Network, OutPoint, PublicKey, Script, ScriptBuf, Txid};

use crate::types::{ProcessedUtxo, ScriptKind, UnspentOutput};

pub fn keypair(seed: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    bytes[0] = 0x01;
    bytes[31] = seed;
    let secret_key = SecretKey::from_slice(&bytes).unwrap();
    (secret_key, PublicKey::new(secret_key.public_key(&secp)))
}

/// DER形式 (sighash型バイトなし) の署名
pub fn sign_digest(secret_key: &SecretKey, digest: [u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::new();
    secp.sign_ecdsa(&Message::from_digest(digest), secret_key).serialize_der().to_vec()
}

/// s を n - s に置き換えた同じ意味の high-S 署名
pub fn high_s_variant(der: &[u8]) -> Vec<u8> {
    let mut compact = Signature::from_der(der).unwrap().serialize_compact();
    let negated = SecretKey::from_slice(&compact[32..]).unwrap().negate();
    compact[32..].copy_from_slice(&negated.secret_bytes());
    Signature::from_compact(&compact).unwrap().serialize_der().to_vec()
}

/// R の先頭に不要な 0x00 を足した非最小DER
pub fn padded_r_variant(der: &[u8]) -> Vec<u8> {
    let len_r = der[3] as usize;
    let mut padded = vec![0x30, der[1] + 1, 0x02, der[3] + 1, 0x00];
    padded.extend_from_slice(&der[4..4 + len_r]);
    padded.extend_from_slice(&der[4 + len_r..]);
    padded
}

pub fn p2pkh_address(public_key: &PublicKey) -> Address {
    Address::from_script(&ScriptBuf::new_p2pkh(&public_key.pubkey_hash()), Network::Testnet).unwrap()
}

pub fn p2sh_address(redeem_script: &Script) -> Address {
    Address::from_script(&ScriptBuf::new_p2sh(&redeem_script.script_hash()), Network::Testnet).unwrap()
}

pub fn utxo(txid_seed: u8, vout: u32, sats: u64, script_pubkey: ScriptBuf, confirmations: u32) -> UnspentOutput {
    UnspentOutput {
        out_point: OutPoint::new(Txid::from_byte_array([txid_seed; 32]), vout),
        value: Amount::from_sat(sats),
        script_pubkey,
        confirmations,
        addresses: Vec::new(),
    }
}

pub fn processed(utxo: UnspentOutput) -> ProcessedUtxo {
    let kind = ScriptKind::classify(&utxo.script_pubkey);
    ProcessedUtxo { utxo, kind, redeem_script: None }
}

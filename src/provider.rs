//! 未使用出力 (UTXO) を取得する外部コラボレーターの境界
//!
//! コアはこのトレイト経由でのみUTXOを取得する。リトライは行わず、
//! 失敗はそのまま `ProviderError` として呼び出し側へ伝える。

use std::path::Path;
use std::str::FromStr;

use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Txid};
use thiserror::Error;

use crate::config::{load_json, UtxoRecord};
use crate::error::AppError;
use crate::types::UnspentOutput;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("UTXO取得サービスに接続できません: {0}")]
    Unavailable(String),

    #[error("UTXOデータの形式が不正です: {0}")]
    Malformed(String),
}

pub trait UnspentOutputProvider {
    /// 指定アドレス群のUTXOを取得する。順序は実装側の順序 (通常は古い順) のまま返す。
    fn unspent_outputs(&self, addresses: &[Address]) -> Result<Vec<UnspentOutput>, ProviderError>;
}

/// 事前に読み込んだUTXOセットから返すプロバイダー
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    utxos: Vec<UnspentOutput>,
}

impl StaticProvider {
    pub fn new(utxos: Vec<UnspentOutput>) -> Self {
        StaticProvider { utxos }
    }

    pub fn from_records(records: Vec<UtxoRecord>, network: Network) -> Result<Self, ProviderError> {
        let utxos = records
            .into_iter()
            .map(|record| record.into_unspent(network))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("{} 件のUTXOを読み込みました。", utxos.len());
        Ok(StaticProvider { utxos })
    }

    /// ローカルのUTXOファイルから読み込む。ファイルの不備は呼び出し側の入力不備として扱う。
    pub fn from_json_file(path: &Path, network: Network) -> Result<Self, AppError> {
        let records: Vec<UtxoRecord> = load_json(path)?;
        Self::from_records(records, network).map_err(|e| {
            log::error!("UTXOファイルの内容が不正です: {:?}", path);
            AppError::InputValidation(format!("{}: {}", path.display(), e))
        })
    }
}

impl UnspentOutputProvider for StaticProvider {
    fn unspent_outputs(&self, addresses: &[Address]) -> Result<Vec<UnspentOutput>, ProviderError> {
        let scripts: Vec<ScriptBuf> = addresses.iter().map(|a| a.script_pubkey()).collect();
        Ok(self
            .utxos
            .iter()
            .filter(|utxo| scripts.contains(&utxo.script_pubkey) || utxo.addresses.iter().any(|a| addresses.contains(a)))
            .cloned()
            .collect())
    }
}

impl UtxoRecord {
    pub fn into_unspent(self, network: Network) -> Result<UnspentOutput, ProviderError> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| ProviderError::Malformed(format!("無効なTXID形式 ({}): {}", self.txid, e)))?;
        let script_pubkey = hex::decode(&self.script_pubkey_hex)
            .map(ScriptBuf::from_bytes)
            .map_err(|e| ProviderError::Malformed(format!("scriptPubkeyHexのデコード失敗: {}", e)))?;
        let addresses = self
            .addresses
            .iter()
            .map(|s| {
                Address::from_str(s)
                    .and_then(|addr| addr.require_network(network))
                    .map_err(|e| ProviderError::Malformed(format!("UTXOのアドレスが不正です ({}): {}", s, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UnspentOutput {
            out_point: OutPoint::new(txid, self.vout),
            value: Amount::from_sat(self.value_sats),
            script_pubkey,
            confirmations: self.confirmations,
            addresses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::{keypair, p2pkh_address};
    use std::io::Write;

    #[test]
    fn test_static_provider_filters_by_address() {
        let mine = p2pkh_address(&keypair(1).1);
        let other = p2pkh_address(&keypair(2).1);
        let provider = StaticProvider::new(vec![
            crate::test_utils::utxo(1, 0, 5_000, mine.script_pubkey(), 3),
            crate::test_utils::utxo(2, 1, 7_000, other.script_pubkey(), 3),
        ]);

        let found = provider.unspent_outputs(&[mine.clone()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, Amount::from_sat(5_000));
        assert!(provider.unspent_outputs(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_load_from_json_file() {
        let address = p2pkh_address(&keypair(1).1);
        let json = format!(
            r#"[{{
                "txid": "{}",
                "vout": 1,
                "valueSats": 10000,
                "scriptPubkeyHex": "{}",
                "confirmations": 6,
                "addresses": ["{}"]
            }}]"#,
            "7914fdc5d64b5f4f0d8841a8a7d9e9a38c9c16ef266dbd779221a347e3d29d53",
            address.script_pubkey().to_hex_string(),
            address
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let provider = StaticProvider::from_json_file(file.path(), Network::Testnet).unwrap();
        let found = provider.unspent_outputs(&[address]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].out_point.vout, 1);
        assert_eq!(found[0].confirmations, 6);
    }

    #[test]
    fn test_malformed_record_is_reported() {
        let record = UtxoRecord {
            txid: "not-a-txid".to_string(),
            vout: 0,
            value_sats: 1,
            script_pubkey_hex: String::new(),
            confirmations: 0,
            addresses: vec![],
        };
        assert!(matches!(record.into_unspent(Network::Testnet), Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn test_local_file_errors_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("utxos.json");
        let err = StaticProvider::from_json_file(&missing, Network::Testnet).unwrap_err();
        assert!(matches!(err, AppError::FileRead { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), "CH600");

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"[{ \"txid\": ").unwrap();
        let err = StaticProvider::from_json_file(broken.path(), Network::Testnet).unwrap_err();
        assert!(matches!(err, AppError::JsonParse { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut bad_record = tempfile::NamedTempFile::new().unwrap();
        bad_record
            .write_all(br#"[{"txid": "zz", "vout": 0, "valueSats": 1, "scriptPubkeyHex": "", "confirmations": 1}]"#)
            .unwrap();
        let err = StaticProvider::from_json_file(bad_record.path(), Network::Testnet).unwrap_err();
        assert!(matches!(err, AppError::InputValidation(_)));
        assert_eq!(err.code(), "CH600");
    }
}

use std::fs;
use std::path::Path;

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode;
use bitcoin::{Address, Amount, Network, ScriptBuf, Transaction};
use hex::FromHex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::assembler::{AssembleOptions, MultisigVerification};
use crate::error::AppError;
use crate::selector::DEFAULT_DUST_THRESHOLD_SATS;
use crate::transaction::{BuildRequest, BuildResult, SweepRequest, DEFAULT_FEE_RATE_SATS_PER_KB};
use crate::types::{
    ChangePolicy, DustPolicy, FundingSource, RequestedOutput, SelectionOrder, SignatureMaterial, SignedTransaction,
    SigningRequest, UnsignedTransaction,
};

pub const SIGNATURE_PLACEHOLDER: &str = "!---insert-signature---!";
pub const PUBLIC_KEY_PLACEHOLDER: &str = "!---insert-public-key---!";
pub const FIRST_SIGNATURE_PLACEHOLDER: &str = "!---insert-first-signature---!";
pub const FIRST_PUBLIC_KEY_PLACEHOLDER: &str = "!---insert-first-public-key---!";
const ELLIPSIS_PLACEHOLDER: &str = "...";

fn default_fee_rate() -> u64 {
    DEFAULT_FEE_RATE_SATS_PER_KB
}

fn default_dust_threshold() -> u64 {
    DEFAULT_DUST_THRESHOLD_SATS
}

/// UTXOセットファイルの1レコード
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UtxoRecord {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub script_pubkey_hex: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// 資金元の指定。アドレス文字列のみ、または redeem script 付きのオブジェクト
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum FundingInputDef {
    Address(String),
    Detailed(FundingInputObject),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FundingInputObject {
    pub address: String,
    #[serde(default)]
    pub redeem_script: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutputDef {
    #[serde(default)]
    pub address: Option<String>,
    /// 16進数のロックスクリプト (アドレスの代わり)
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequestFile {
    #[serde(default)]
    pub inputs: Vec<FundingInputDef>,
    #[serde(default)]
    pub outputs: Vec<TransactionOutputDef>,
    #[serde(default)]
    pub change_address: Option<String>,
    /// 1000バイトあたりの手数料 (sats)
    #[serde(default = "default_fee_rate")]
    pub miner_fee_rate: u64,
    #[serde(default)]
    pub min_confirmations: u32,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sats: u64,
    #[serde(default)]
    pub dust_policy: DustPolicy,
    #[serde(default)]
    pub selection_order: SelectionOrder,
}

impl BuildRequestFile {
    pub fn into_request(self, network: Network) -> Result<BuildRequest, AppError> {
        if self.inputs.is_empty() {
            return Err(AppError::MissingInput);
        }
        if self.outputs.is_empty() {
            return Err(AppError::MissingOutput);
        }
        let change_address = self.change_address.ok_or(AppError::MissingChangeAddress)?;

        let inputs = parse_funding_inputs(self.inputs, network)?;
        let outputs = self
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| parse_output(index, output, network))
            .collect::<Result<Vec<_>, _>>()?;
        let change_address = checked_address(&change_address, network, AppError::InvalidChangeAddress)?;

        Ok(BuildRequest {
            network,
            inputs,
            outputs,
            change_address,
            fee_rate: Amount::from_sat(self.miner_fee_rate),
            min_confirmations: self.min_confirmations,
            change_policy: ChangePolicy {
                dust_threshold: Amount::from_sat(self.dust_threshold_sats),
                on_dust: self.dust_policy,
            },
            order: self.selection_order,
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequestFile {
    #[serde(default)]
    pub inputs: Vec<FundingInputDef>,
    #[serde(default)]
    pub destination_address: Option<String>,
    #[serde(default = "default_fee_rate")]
    pub miner_fee_rate: u64,
    #[serde(default)]
    pub min_confirmations: u32,
}

impl SweepRequestFile {
    pub fn into_request(self, network: Network) -> Result<SweepRequest, AppError> {
        if self.inputs.is_empty() {
            return Err(AppError::MissingInput);
        }
        let destination = self.destination_address.ok_or(AppError::MissingOutput)?;
        let inputs = parse_funding_inputs(self.inputs, network)?;
        let destination = checked_address(&destination, network, |reason| AppError::InvalidOutput { index: 0, reason })?;

        Ok(SweepRequest {
            network,
            inputs,
            destination,
            fee_rate: Amount::from_sat(self.miner_fee_rate),
            min_confirmations: self.min_confirmations,
        })
    }
}

fn parse_funding_inputs(inputs: Vec<FundingInputDef>, network: Network) -> Result<Vec<FundingSource>, AppError> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let (address, redeem_script) = match input {
                FundingInputDef::Address(address) => (address, None),
                FundingInputDef::Detailed(object) => (object.address, object.redeem_script),
            };
            let address = checked_address(&address, network, |reason| AppError::InvalidInput { index, reason })?;
            let redeem_script = redeem_script
                .map(|script_hex| {
                    hex::decode(&script_hex).map(ScriptBuf::from_bytes).map_err(|e| AppError::InvalidInput {
                        index,
                        reason: format!("redeemScriptのデコード失敗: {}", e),
                    })
                })
                .transpose()?;
            Ok(FundingSource { address, redeem_script })
        })
        .collect()
}

fn parse_output(index: usize, output: TransactionOutputDef, network: Network) -> Result<RequestedOutput, AppError> {
    let script_pubkey = match (output.address, output.script) {
        (Some(address), None) => {
            checked_address(&address, network, |reason| AppError::InvalidOutput { index, reason })?.script_pubkey()
        }
        (None, Some(script_hex)) => hex::decode(&script_hex).map(ScriptBuf::from_bytes).map_err(|e| {
            AppError::InvalidOutput { index, reason: format!("scriptのデコード失敗: {}", e) }
        })?,
        (Some(_), Some(_)) => {
            return Err(AppError::InvalidOutput {
                index,
                reason: "addressとscriptは同時に指定できません".to_string(),
            })
        }
        (None, None) => {
            return Err(AppError::InvalidOutput { index, reason: "addressまたはscriptが必要です".to_string() })
        }
    };

    let amount = output
        .amount
        .ok_or_else(|| AppError::InvalidOutput { index, reason: "amountが必要です".to_string() })?;
    let amount = u64::try_from(amount).map_err(|_| AppError::InvalidOutputAmount { index, amount })?;
    Ok(RequestedOutput { script_pubkey, amount: Amount::from_sat(amount) })
}

/// アドレスをパースし、指定ネットワーク用であることを確認する
fn checked_address<F>(raw: &str, network: Network, on_parse_error: F) -> Result<Address, AppError>
where
    F: FnOnce(String) -> AppError,
{
    let unchecked: Address<NetworkUnchecked> = raw
        .parse()
        .map_err(|e| on_parse_error(format!("無効なアドレス形式 ({}): {}", raw, e)))?;
    if !unchecked.is_valid_for_network(network) {
        return Err(AppError::MultipleBlockChains { address: raw.to_string(), network: network.to_string() });
    }
    Ok(unchecked.assume_checked())
}

fn is_placeholder(value: &str) -> bool {
    value == ELLIPSIS_PLACEHOLDER || (value.starts_with("!---") && value.ends_with("---!"))
}

fn decode_field(input_index: usize, field: &'static str, value: &str) -> Result<Option<Vec<u8>>, AppError> {
    if is_placeholder(value) {
        return Ok(None);
    }
    hex::decode(value)
        .map(Some)
        .map_err(|source| AppError::InvalidHex { input_index, field, source })
}

fn decode_list(input_index: usize, field: &'static str, values: &[String]) -> Result<Vec<Vec<u8>>, AppError> {
    let mut decoded = Vec::with_capacity(values.len());
    for value in values {
        decoded.extend(decode_field(input_index, field, value)?);
    }
    Ok(decoded)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDef {
    pub hex: String,
    pub total_output_amount: u64,
    pub fee: u64,
}

impl TransactionDef {
    pub fn from_unsigned(unsigned: &UnsignedTransaction) -> Self {
        TransactionDef {
            hex: unsigned.to_hex(),
            total_output_amount: unsigned.total_output_amount.to_sat(),
            fee: unsigned.fee.to_sat(),
        }
    }

    pub fn from_signed(signed: &SignedTransaction) -> Self {
        TransactionDef {
            hex: signed.to_hex(),
            total_output_amount: signed.total_output_amount.to_sat(),
            fee: signed.fee.to_sat(),
        }
    }

    pub fn into_unsigned(self) -> Result<UnsignedTransaction, AppError> {
        let bytes = hex::decode(&self.hex)
            .map_err(|e| AppError::InvalidTransactionEncoding(format!("16進数デコードエラー: {}", e)))?;
        let transaction: Transaction = encode::deserialize(&bytes)?;
        Ok(UnsignedTransaction {
            transaction,
            total_output_amount: Amount::from_sat(self.total_output_amount),
            fee: Amount::from_sat(self.fee),
        })
    }
}

/// 外部署名者とやり取りする署名リクエスト
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequestDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub hash_to_sign: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_script: Option<String>,
}

impl SigningRequestDef {
    pub fn from_request(request: &SigningRequest) -> Self {
        let mut def = SigningRequestDef {
            address: request.address.as_ref().map(|address| address.to_string()),
            hash_to_sign: hex::encode(request.digest),
            signature: None,
            public_key: None,
            signatures: None,
            public_keys: None,
            signature_script: None,
        };
        match &request.material {
            SignatureMaterial::Single { signature, public_key } => {
                def.signature = Some(signature.as_ref().map_or_else(|| SIGNATURE_PLACEHOLDER.to_string(), hex::encode));
                def.public_key =
                    Some(public_key.as_ref().map_or_else(|| PUBLIC_KEY_PLACEHOLDER.to_string(), hex::encode));
            }
            SignatureMaterial::Multi { signatures, public_keys } => {
                def.signatures = Some(if signatures.is_empty() {
                    vec![FIRST_SIGNATURE_PLACEHOLDER.to_string(), ELLIPSIS_PLACEHOLDER.to_string()]
                } else {
                    signatures.iter().map(hex::encode).collect()
                });
                def.public_keys = Some(if public_keys.is_empty() {
                    vec![FIRST_PUBLIC_KEY_PLACEHOLDER.to_string(), ELLIPSIS_PLACEHOLDER.to_string()]
                } else {
                    public_keys.iter().map(hex::encode).collect()
                });
            }
            SignatureMaterial::SignatureScript(script) => {
                def.signature_script = Some(script.to_hex_string());
            }
        }
        def
    }

    pub fn into_request(self, input_index: usize, network: Network) -> Result<SigningRequest, AppError> {
        let digest = <[u8; 32]>::from_hex(&self.hash_to_sign)
            .map_err(|source| AppError::InvalidHex { input_index, field: "hashToSign", source })?;
        // アドレスは参考情報のため、解釈できなければ無視する
        let address = self
            .address
            .as_deref()
            .and_then(|raw| raw.parse::<Address<NetworkUnchecked>>().ok())
            .and_then(|address| address.require_network(network).ok());

        let signature_script = match &self.signature_script {
            Some(raw) => decode_field(input_index, "signatureScript", raw)?,
            None => None,
        };
        let material = if let Some(script) = signature_script {
            SignatureMaterial::SignatureScript(ScriptBuf::from_bytes(script))
        } else if self.signatures.is_some() || self.public_keys.is_some() {
            SignatureMaterial::Multi {
                signatures: decode_list(input_index, "signatures", self.signatures.as_deref().unwrap_or_default())?,
                public_keys: decode_list(input_index, "publicKeys", self.public_keys.as_deref().unwrap_or_default())?,
            }
        } else {
            let signature = match &self.signature {
                Some(raw) => decode_field(input_index, "signature", raw)?,
                None => None,
            };
            let public_key = match &self.public_key {
                Some(raw) => decode_field(input_index, "publicKey", raw)?,
                None => None,
            };
            SignatureMaterial::Single { signature, public_key }
        };

        Ok(SigningRequest { address, digest, material })
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub inputs_to_sign: Vec<SigningRequestDef>,
    pub unsigned_transaction: TransactionDef,
}

impl BuildResponse {
    pub fn from_result(result: &BuildResult) -> Self {
        BuildResponse {
            inputs_to_sign: result.signing_requests.iter().map(SigningRequestDef::from_request).collect(),
            unsigned_transaction: TransactionDef::from_unsigned(&result.unsigned_transaction),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssembleRequestFile {
    #[serde(default)]
    pub inputs_to_sign: Vec<SigningRequestDef>,
    pub unsigned_transaction: TransactionDef,
    #[serde(default)]
    pub multisig_verification: MultisigVerification,
}

impl AssembleRequestFile {
    pub fn into_parts(
        self,
        network: Network,
    ) -> Result<(UnsignedTransaction, Vec<SigningRequest>, AssembleOptions), AppError> {
        let unsigned = self.unsigned_transaction.into_unsigned()?;
        let requests = self
            .inputs_to_sign
            .into_iter()
            .enumerate()
            .map(|(input_index, def)| def.into_request(input_index, network))
            .collect::<Result<Vec<_>, _>>()?;
        let options = AssembleOptions { multisig_verification: self.multisig_verification };
        Ok((unsigned, requests, options))
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssembleResponse {
    pub signed_transaction: TransactionDef,
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    let content = fs::read_to_string(path).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", path);
        AppError::FileRead { file_path: path.to_path_buf(), source: e }
    })?;
    serde_json::from_str(&content).map_err(|e| {
        log::error!("入力JSONのパースに失敗しました: {:?}", path);
        AppError::JsonParse { file_path: path.to_path_buf(), source: e }
    })
}

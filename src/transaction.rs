use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, Network, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::{
    error::AppError,
    provider::UnspentOutputProvider,
    selector::{self, Selection},
    types::{
        is_data_carrier, ChangePolicy, FundingSource, ProcessedUtxo, RequestedOutput, SelectionOrder,
        SignatureMaterial, SigningRequest, UnsignedTransaction,
    },
};

// 1000バイトあたりの手数料 (sats)
pub const DEFAULT_FEE_RATE_SATS_PER_KB: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub network: Network,
    pub inputs: Vec<FundingSource>,
    pub outputs: Vec<RequestedOutput>,
    pub change_address: Address,
    /// 1000バイトあたりの手数料
    pub fee_rate: Amount,
    pub min_confirmations: u32,
    pub change_policy: ChangePolicy,
    pub order: SelectionOrder,
}

impl BuildRequest {
    pub fn new(network: Network, inputs: Vec<FundingSource>, outputs: Vec<RequestedOutput>, change_address: Address) -> Self {
        BuildRequest {
            network,
            inputs,
            outputs,
            change_address,
            fee_rate: Amount::from_sat(DEFAULT_FEE_RATE_SATS_PER_KB),
            min_confirmations: 0,
            change_policy: ChangePolicy::default(),
            order: SelectionOrder::default(),
        }
    }
}

/// 資金元の全UTXOを1つの宛先へ送るリクエスト
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub network: Network,
    pub inputs: Vec<FundingSource>,
    pub destination: Address,
    pub fee_rate: Amount,
    pub min_confirmations: u32,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub unsigned_transaction: UnsignedTransaction,
    pub signing_requests: Vec<SigningRequest>,
}

pub fn build_transaction<P: UnspentOutputProvider + ?Sized>(
    provider: &P,
    request: &BuildRequest,
) -> Result<BuildResult, AppError> {
    log::info!("トランザクション構築処理を開始します。");

    // ネットワーク呼び出しの前にリクエストを検証する
    validate_funding(&request.inputs, request.network)?;
    if request.outputs.is_empty() {
        return Err(AppError::MissingOutput);
    }
    for (index, output) in request.outputs.iter().enumerate() {
        validate_output(index, output)?;
    }
    require_network(&request.change_address, request.network)?;

    let candidates =
        selector::fetch_candidates(provider, &request.inputs, request.min_confirmations, request.order)?;
    let change_script = request.change_address.script_pubkey();
    let selection = selector::select_from(
        candidates,
        &request.outputs,
        &change_script,
        request.fee_rate,
        &request.change_policy,
    )?;

    let change_output = if selection.change > Amount::ZERO {
        log::debug!("おつり発生: {}, おつりアドレス: {}", selection.change, request.change_address);
        Some(TxOut { value: selection.change, script_pubkey: change_script })
    } else {
        None
    };

    finish(&selection, &request.outputs, change_output, request.network)
}

pub fn build_sweep<P: UnspentOutputProvider + ?Sized>(provider: &P, request: &SweepRequest) -> Result<BuildResult, AppError> {
    log::info!("スイープトランザクションの構築を開始します。宛先: {}", request.destination);

    validate_funding(&request.inputs, request.network)?;
    require_network(&request.destination, request.network)?;

    let candidates = selector::fetch_candidates(
        provider,
        &request.inputs,
        request.min_confirmations,
        SelectionOrder::AsProvided,
    )?;
    let destination_script = request.destination.script_pubkey();
    let selection = selector::select_all(candidates, &destination_script, request.fee_rate)?;
    let outputs = [RequestedOutput { script_pubkey: destination_script, amount: selection.requested_value }];

    finish(&selection, &outputs, None, request.network)
}

fn finish(
    selection: &Selection,
    outputs: &[RequestedOutput],
    change_output: Option<TxOut>,
    network: Network,
) -> Result<BuildResult, AppError> {
    let unsigned_transaction = build_unsigned(selection, outputs, change_output)?;
    let signing_requests = signing_requests(&unsigned_transaction.transaction, &selection.utxos, network)?;
    log::info!(
        "未署名トランザクションの構築が完了しました。入力 {} 件, 出力 {} 件, 出力合計 {}, 手数料 {}",
        unsigned_transaction.transaction.input.len(),
        unsigned_transaction.transaction.output.len(),
        unsigned_transaction.total_output_amount,
        unsigned_transaction.fee
    );
    Ok(BuildResult { unsigned_transaction, signing_requests })
}

fn validate_funding(inputs: &[FundingSource], network: Network) -> Result<(), AppError> {
    if inputs.is_empty() {
        return Err(AppError::MissingInput);
    }
    for (index, source) in inputs.iter().enumerate() {
        require_network(&source.address, network)?;
        let script_pubkey = source.address.script_pubkey();

        if script_pubkey.is_p2sh() {
            let redeem_script = source.redeem_script.as_ref().ok_or_else(|| AppError::InvalidInput {
                index,
                reason: "P2SHアドレスにはredeem scriptが必要です".to_string(),
            })?;
            if redeem_script.to_p2sh() != script_pubkey {
                return Err(AppError::InvalidInput {
                    index,
                    reason: "redeem scriptのハッシュがP2SHアドレスと一致しません".to_string(),
                });
            }
        } else if script_pubkey.is_p2pkh() {
            if source.redeem_script.is_some() {
                return Err(AppError::InvalidInput {
                    index,
                    reason: "P2SH以外のアドレスにredeem scriptは指定できません".to_string(),
                });
            }
        } else {
            return Err(AppError::InvalidInput {
                index,
                reason: format!("未対応のアドレス種別です: {}", source.address),
            });
        }
    }
    Ok(())
}

/// 金額0はOP_RETURNのデータキャリア出力にのみ許可する
pub fn validate_output(index: usize, output: &RequestedOutput) -> Result<(), AppError> {
    if output.amount == Amount::ZERO && !is_data_carrier(&output.script_pubkey) {
        return Err(AppError::InvalidOutputAmount { index, amount: 0 });
    }
    Ok(())
}

pub fn require_network(address: &Address, network: Network) -> Result<(), AppError> {
    if address.as_unchecked().is_valid_for_network(network) {
        Ok(())
    } else {
        Err(AppError::MultipleBlockChains { address: address.to_string(), network: network.to_string() })
    }
}

/// 各入力の script_sig に前の出力のロックスクリプトをプレースホルダーとして入れる。
/// このプレースホルダーはアンロックスクリプトとしては無効で、署名組み立て時に置き換えられる。
pub fn build_unsigned(
    selection: &Selection,
    outputs: &[RequestedOutput],
    change_output: Option<TxOut>,
) -> Result<UnsignedTransaction, AppError> {
    let input: Vec<TxIn> = selection
        .utxos
        .iter()
        .map(|pu| TxIn {
            previous_output: pu.utxo.out_point,
            script_sig: pu.utxo.script_pubkey.clone(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();

    let mut output: Vec<TxOut> = outputs
        .iter()
        .map(|o| TxOut { value: o.amount, script_pubkey: o.script_pubkey.clone() })
        .collect();
    output.extend(change_output);

    let total_output_amount = selector::sum_amounts(output.iter().map(|o| &o.value))?;
    let fee = selection.selected_value.checked_sub(total_output_amount).ok_or(AppError::InsufficientFunds {
        available: selection.selected_value,
        required: total_output_amount,
        fee: selection.fee,
    })?;

    let transaction = Transaction { version: Version::ONE, lock_time: LockTime::ZERO, input, output };
    Ok(UnsignedTransaction { transaction, total_output_amount, fee })
}

/// SIGHASH_ALL のレガシー署名ハッシュ。
/// 対象入力の script_sig を `script_code` に、他の入力の script_sig を空にして計算される。
pub fn signature_hash(tx: &Transaction, input_index: usize, script_code: &Script) -> Result<[u8; 32], AppError> {
    let sighash_cache = SighashCache::new(tx);
    let sighash = sighash_cache
        .legacy_signature_hash(input_index, script_code, EcdsaSighashType::All.to_u32())
        .map_err(|e| AppError::InputValidation(format!("Sighash計算エラー (入力インデックス {}): {}", input_index, e)))?;
    Ok(sighash.to_byte_array())
}

fn signing_requests(
    tx: &Transaction,
    utxos: &[ProcessedUtxo],
    network: Network,
) -> Result<Vec<SigningRequest>, AppError> {
    utxos
        .iter()
        .enumerate()
        .map(|(input_index, pu)| {
            let digest = signature_hash(tx, input_index, pu.script_code())?;
            log::debug!(
                "入力 {} ({}) の署名ハッシュ: {}",
                input_index,
                pu.kind.name(),
                hex::encode(digest)
            );
            let material = if pu.kind.is_single_key() {
                SignatureMaterial::Single { signature: None, public_key: None }
            } else {
                SignatureMaterial::Multi { signatures: Vec::new(), public_keys: Vec::new() }
            };
            Ok(SigningRequest {
                address: Address::from_script(&pu.utxo.script_pubkey, network).ok(),
                digest,
                material,
            })
        })
        .collect()
}

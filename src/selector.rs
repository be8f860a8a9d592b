use std::collections::{HashMap, HashSet};

use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};

use crate::{
    error::AppError,
    provider::UnspentOutputProvider,
    script::simulated_script_sig_len,
    types::{ChangePolicy, DustPolicy, FundingSource, ProcessedUtxo, RequestedOutput, ScriptKind, SelectionOrder},
};

// Bitcoin Coreのデフォルトダスト閾値 (P2PKH出力に対して)
pub const DEFAULT_DUST_THRESHOLD_SATS: u64 = 546;

/// 手数料率の単位となるバイト数
const FEE_RATE_UNIT_BYTES: u64 = 1000;

/// 選択結果。`selected_value - requested_value - fee == change` が常に成り立つ
#[derive(Debug, Clone)]
pub struct Selection {
    pub utxos: Vec<ProcessedUtxo>,
    pub selected_value: Amount,
    pub requested_value: Amount,
    pub fee: Amount,
    pub change: Amount,
}

/// 外部サービスからUTXOを取得し、確認数でフィルタして選択候補にする。
pub fn fetch_candidates<P: UnspentOutputProvider + ?Sized>(
    provider: &P,
    funding: &[FundingSource],
    min_confirmations: u32,
    order: SelectionOrder,
) -> Result<Vec<ProcessedUtxo>, AppError> {
    let mut addresses: Vec<Address> = Vec::new();
    for source in funding {
        if !addresses.contains(&source.address) {
            addresses.push(source.address.clone());
        }
    }

    let redeem_scripts: HashMap<ScriptBuf, ScriptBuf> = funding
        .iter()
        .filter_map(|source| {
            source
                .redeem_script
                .as_ref()
                .map(|redeem| (source.address.script_pubkey(), redeem.clone()))
        })
        .collect();

    log::info!("{} 個のアドレスのUTXOを取得します。", addresses.len());
    let fetched = provider.unspent_outputs(&addresses)?;
    log::debug!("UTXO取得結果: {} 件", fetched.len());

    let mut seen: HashSet<OutPoint> = HashSet::new();
    let mut candidates = Vec::new();
    for utxo in fetched {
        if utxo.confirmations < min_confirmations {
            log::debug!(
                "確認数不足のUTXOを除外: {} ({} < {})",
                utxo.out_point, utxo.confirmations, min_confirmations
            );
            continue;
        }
        if !seen.insert(utxo.out_point) {
            continue;
        }

        let kind = ScriptKind::classify(&utxo.script_pubkey);
        let redeem_script = redeem_scripts.get(&utxo.script_pubkey).cloned();
        match (&kind, &redeem_script) {
            (ScriptKind::Unsupported, _) => {
                log::warn!("未対応のスクリプトを持つUTXOを除外: {} ({})", utxo.out_point, utxo.script_pubkey.to_hex_string());
                continue;
            }
            (ScriptKind::PayToScriptHash(_), None) => {
                log::warn!("redeem scriptが不明なP2SH UTXOを除外: {}", utxo.out_point);
                continue;
            }
            _ => {}
        }

        candidates.push(ProcessedUtxo { utxo, kind, redeem_script });
    }

    if order == SelectionOrder::LargestFirst {
        candidates.sort_by(|a, b| b.utxo.value.cmp(&a.utxo.value));
    }
    Ok(candidates)
}

/// `fee_rate` は 1000 バイトあたりの手数料。開始した1000バイトごとに課金する。
pub fn fee_for_size(size: usize, fee_rate: Amount) -> Result<Amount, AppError> {
    let units = (size as u64).div_ceil(FEE_RATE_UNIT_BYTES);
    fee_rate
        .checked_mul(units)
        .ok_or_else(|| AppError::InputValidation(format!("手数料の計算がオーバーフローしました (size {} bytes)", size)))
}

/// 署名後のサイズを見積もって手数料を計算する。
/// script_sig にはスクリプト種別ごとの署名後の長さのダミーを入れる。
pub fn estimate_fee(inputs: &[ProcessedUtxo], outputs: &[TxOut], fee_rate: Amount) -> Result<Amount, AppError> {
    let temp_tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|pu| TxIn {
                previous_output: pu.utxo.out_point,
                script_sig: ScriptBuf::from_bytes(vec![0u8; simulated_script_sig_len(&pu.kind, pu.redeem_script.as_deref())]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs.to_vec(),
    };
    let estimated_size = temp_tx.vsize();
    let fee = fee_for_size(estimated_size, fee_rate)?;
    log::debug!("推定サイズ: {} bytes, 手数料率: {} /kB, 手数料: {}", estimated_size, fee_rate, fee);
    Ok(fee)
}

pub fn sum_amounts<'a, I: IntoIterator<Item = &'a Amount>>(amounts: I) -> Result<Amount, AppError> {
    amounts
        .into_iter()
        .try_fold(Amount::ZERO, |acc, amount| acc.checked_add(*amount))
        .ok_or_else(|| AppError::InputValidation("金額の合計がオーバーフローしました".to_string()))
}

/// おつりをポリシーに従って確定する。`None` はさらにUTXOが必要なことを示す。
fn settle_change(change: Amount, policy: &ChangePolicy) -> Option<(Amount, Amount)> {
    if change == Amount::ZERO || change >= policy.dust_threshold {
        return Some((change, Amount::ZERO));
    }
    match policy.on_dust {
        DustPolicy::Keep => Some((change, Amount::ZERO)),
        DustPolicy::AddToFee => {
            log::warn!("おつり {} はダスト閾値 {} 未満のため手数料に含めます。", change, policy.dust_threshold);
            Some((Amount::ZERO, change))
        }
        DustPolicy::Reject => None,
    }
}

/// 候補から順に貪欲にUTXOを積み上げ、出力額 + 手数料を満たした時点で止める。
/// 手数料は入力を追加するたびに再計算する。
pub fn select_from(
    candidates: Vec<ProcessedUtxo>,
    outputs: &[RequestedOutput],
    change_script: &Script,
    fee_rate: Amount,
    policy: &ChangePolicy,
) -> Result<Selection, AppError> {
    let requested_value = sum_amounts(outputs.iter().map(|o| &o.amount))?;

    if candidates.is_empty() && requested_value > Amount::ZERO {
        return Err(AppError::MissingUnspentOutputs);
    }

    // おつり出力は常にサイズ見積もりに含める
    let mut outputs_for_size: Vec<TxOut> = outputs
        .iter()
        .map(|o| TxOut { value: o.amount, script_pubkey: o.script_pubkey.clone() })
        .collect();
    outputs_for_size.push(TxOut { value: Amount::ZERO, script_pubkey: change_script.to_owned() });

    let mut selected: Vec<ProcessedUtxo> = Vec::new();
    let mut selected_value = Amount::ZERO;
    let mut last_fee = estimate_fee(&[], &outputs_for_size, fee_rate)?;
    let mut dust_change: Option<Amount> = None;

    for candidate in candidates {
        selected_value = selected_value
            .checked_add(candidate.utxo.value)
            .ok_or_else(|| AppError::InputValidation("UTXO金額の合計がオーバーフローしました".to_string()))?;
        log::debug!("UTXOを選択: {} ({})", candidate.utxo.out_point, candidate.utxo.value);
        selected.push(candidate);

        let fee = estimate_fee(&selected, &outputs_for_size, fee_rate)?;
        last_fee = fee;
        let Some(required) = requested_value.checked_add(fee) else {
            return Err(AppError::InputValidation("要求額の計算がオーバーフローしました".to_string()));
        };
        let Some(change) = selected_value.checked_sub(required) else {
            continue;
        };

        match settle_change(change, policy) {
            Some((change, folded)) => {
                let fee = fee + folded;
                log::info!(
                    "UTXO選択完了: 入力 {} 件, 選択額 {}, 出力額 {}, 手数料 {}, おつり {}",
                    selected.len(), selected_value, requested_value, fee, change
                );
                return Ok(Selection { utxos: selected, selected_value, requested_value, fee, change });
            }
            None => {
                log::debug!("おつり {} がダスト閾値未満のため、UTXOを追加します。", change);
                dust_change = Some(change);
            }
        }
    }

    if let Some(change) = dust_change {
        return Err(AppError::DustChange { change, threshold: policy.dust_threshold });
    }
    Err(AppError::InsufficientFunds {
        available: selected_value,
        required: requested_value + last_fee,
        fee: last_fee,
    })
}

/// 全UTXOを1つの宛先に送る。手数料を差し引いた全額が出力額になる。
pub fn select_all(candidates: Vec<ProcessedUtxo>, destination: &Script, fee_rate: Amount) -> Result<Selection, AppError> {
    if candidates.is_empty() {
        return Err(AppError::MissingUnspentOutputs);
    }
    let selected_value = sum_amounts(candidates.iter().map(|pu| &pu.utxo.value))?;
    let fee = estimate_fee(
        &candidates,
        &[TxOut { value: Amount::ZERO, script_pubkey: destination.to_owned() }],
        fee_rate,
    )?;

    match selected_value.checked_sub(fee) {
        Some(amount) if amount > Amount::ZERO => {
            log::info!("スイープ: 入力 {} 件, 合計 {}, 手数料 {}, 送金額 {}", candidates.len(), selected_value, fee, amount);
            Ok(Selection { utxos: candidates, selected_value, requested_value: amount, fee, change: Amount::ZERO })
        }
        _ => Err(AppError::InsufficientFunds { available: selected_value, required: fee, fee }),
    }
}

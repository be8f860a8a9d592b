use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, PushBytesBuf, PushBytesError};
use bitcoin::{EcdsaSighashType, PublicKey, Script, ScriptBuf};

use crate::types::ScriptKind;

// 手数料見積もりに使用するダミーデータのサイズ
const DUMMY_SIGNATURE_LEN: usize = 72; // low-S DER署名の最大長 71 + sighash型バイト
const DUMMY_PUBLIC_KEY_LEN: usize = 65; // 圧縮/非圧縮が不明なので非圧縮で見積もる

/// `<m> <pubkey>... <n> OP_CHECKMULTISIG`
pub fn multisig_redeem_script(required: usize, public_keys: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(required as i64);
    for public_key in public_keys {
        builder = builder.push_key(public_key);
    }
    builder
        .push_int(public_keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// script_sig に入れる形式 (署名 + SIGHASH_ALL バイト)
pub fn signature_push(raw_signature: &[u8]) -> Result<PushBytesBuf, PushBytesError> {
    let mut data = raw_signature.to_vec();
    data.push(EcdsaSighashType::All.to_u32() as u8);
    PushBytesBuf::try_from(data)
}

pub fn pay_to_pubkey_script_sig(raw_signature: &[u8]) -> Result<ScriptBuf, PushBytesError> {
    Ok(Builder::new().push_slice(signature_push(raw_signature)?).into_script())
}

pub fn pay_to_pubkey_hash_script_sig(raw_signature: &[u8], public_key: &PublicKey) -> Result<ScriptBuf, PushBytesError> {
    Ok(Builder::new()
        .push_slice(signature_push(raw_signature)?)
        .push_key(public_key)
        .into_script())
}

/// `OP_0 <sig1> ... <sigM> [<redeem script>]`
/// OP_0 は OP_CHECKMULTISIG が余分に1要素を消費するバグのためのダミー
pub fn multisig_script_sig(raw_signatures: &[Vec<u8>], redeem_script: Option<&Script>) -> Result<ScriptBuf, PushBytesError> {
    let mut builder = Builder::new().push_opcode(OP_0);
    for raw_signature in raw_signatures {
        builder = builder.push_slice(signature_push(raw_signature)?);
    }
    if let Some(redeem_script) = redeem_script {
        builder = builder.push_slice(PushBytesBuf::try_from(redeem_script.to_bytes())?);
    }
    Ok(builder.into_script())
}

/// データをプッシュしたときのバイト数 (プッシュオペコード込み)
fn push_len(data_len: usize) -> usize {
    let prefix = match data_len {
        0..=75 => 1,
        76..=0xff => 2,
        0x100..=0xffff => 3,
        _ => 5,
    };
    prefix + data_len
}

/// 署名後の script_sig の長さの見積もり
pub fn simulated_script_sig_len(kind: &ScriptKind, redeem_script: Option<&Script>) -> usize {
    match kind {
        ScriptKind::PayToPubkey(_) => push_len(DUMMY_SIGNATURE_LEN),
        ScriptKind::PayToPubkeyHash(_) => push_len(DUMMY_SIGNATURE_LEN) + push_len(DUMMY_PUBLIC_KEY_LEN),
        ScriptKind::BareMultisig { required, .. } => 1 + required * push_len(DUMMY_SIGNATURE_LEN),
        ScriptKind::PayToScriptHash(_) => {
            let redeem_script = match redeem_script {
                Some(script) => script,
                None => return push_len(DUMMY_SIGNATURE_LEN),
            };
            let signatures = match ScriptKind::classify(redeem_script) {
                ScriptKind::BareMultisig { required, .. } => 1 + required * push_len(DUMMY_SIGNATURE_LEN),
                _ => push_len(DUMMY_SIGNATURE_LEN) + push_len(DUMMY_PUBLIC_KEY_LEN),
            };
            signatures + push_len(redeem_script.len())
        }
        ScriptKind::Unsupported => 0,
    }
}

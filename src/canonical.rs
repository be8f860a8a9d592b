//! 署名と公開鍵のエンコーディング正規性チェック
//!
//! 暗号学的な検証の前に、生の署名 (DER、sighash型バイトなし) と公開鍵が
//! 正規のエンコーディングであることを確認する。BIP66 の厳密DER規則と low-S を要求する。

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{EcdsaSighashType, PublicKey};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("署名の長さが不正です: {0} バイト")]
    SignatureLength(usize),

    #[error("厳密なDER形式ではありません: {0}")]
    NonDer(&'static str),

    #[error("Sの値が曲線位数の半分を超えています (high-S)")]
    HighS,

    #[error("公開鍵の形式が正規ではありません (長さ {len}, 先頭バイト 0x{prefix:02x})")]
    PublicKeyFormat { len: usize, prefix: u8 },

    #[error("公開鍵が曲線上の有効な点ではありません")]
    InvalidPublicKey,
}

/// 生の署名をチェックし、パース済みの署名を返す。
pub fn check_signature_encoding(raw: &[u8]) -> Result<Signature, EncodingError> {
    let mut with_type = raw.to_vec();
    with_type.push(EcdsaSighashType::All.to_u32() as u8);
    check_der_layout(&with_type)?;

    let signature = Signature::from_der(raw).map_err(|_| EncodingError::NonDer("secp256k1でパースできません"))?;
    let mut normalized = signature;
    normalized.normalize_s();
    if normalized != signature {
        return Err(EncodingError::HighS);
    }
    Ok(signature)
}

// BIP66: 0x30 [total-len] 0x02 [R-len] [R] 0x02 [S-len] [S] [sighash]
fn check_der_layout(sig: &[u8]) -> Result<(), EncodingError> {
    let len = sig.len();
    if !(9..=73).contains(&len) {
        return Err(EncodingError::SignatureLength(len.saturating_sub(1)));
    }
    if sig[0] != 0x30 {
        return Err(EncodingError::NonDer("compoundマーカーがありません"));
    }
    if sig[1] as usize != len - 3 {
        return Err(EncodingError::NonDer("全体長が一致しません"));
    }

    let len_r = sig[3] as usize;
    if 5 + len_r >= len {
        return Err(EncodingError::NonDer("Rの長さが範囲外です"));
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != len {
        return Err(EncodingError::NonDer("RとSの長さの合計が一致しません"));
    }

    if sig[2] != 0x02 {
        return Err(EncodingError::NonDer("Rが整数ではありません"));
    }
    if len_r == 0 {
        return Err(EncodingError::NonDer("Rの長さが0です"));
    }
    if sig[4] & 0x80 != 0 {
        return Err(EncodingError::NonDer("Rが負の値です"));
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return Err(EncodingError::NonDer("Rに不要なゼロ埋めがあります"));
    }

    if sig[len_r + 4] != 0x02 {
        return Err(EncodingError::NonDer("Sが整数ではありません"));
    }
    if len_s == 0 {
        return Err(EncodingError::NonDer("Sの長さが0です"));
    }
    if sig[len_r + 6] & 0x80 != 0 {
        return Err(EncodingError::NonDer("Sが負の値です"));
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return Err(EncodingError::NonDer("Sに不要なゼロ埋めがあります"));
    }
    Ok(())
}

/// 圧縮 (02/03, 33バイト) または非圧縮 (04, 65バイト) 形式のみ受け付ける。
/// ハイブリッド形式 (06/07) は拒否する。
pub fn check_public_key_encoding(raw: &[u8]) -> Result<PublicKey, EncodingError> {
    let prefix = raw.first().copied().unwrap_or(0);
    let canonical = match raw.len() {
        33 => prefix == 0x02 || prefix == 0x03,
        65 => prefix == 0x04,
        _ => false,
    };
    if !canonical {
        return Err(EncodingError::PublicKeyFormat { len: raw.len(), prefix });
    }
    PublicKey::from_slice(raw).map_err(|_| EncodingError::InvalidPublicKey)
}

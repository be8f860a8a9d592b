use std::path::PathBuf;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use bitcoin::Amount;
use serde::Serialize;
use thiserror::Error;

use crate::canonical::EncodingError;
use crate::provider::ProviderError;

/// 呼び出し側がリトライ可否を判断するためのエラー分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// リクエストの形式不備。呼び出し側で修正が必要 (リトライしない)
    Validation,
    /// 資金不足。資金を追加するか出力額を減らす必要がある
    InsufficientFunds,
    /// 未対応のスクリプト種別
    UnsupportedOutputScript,
    /// 署名またはスクリプトハッシュの検証失敗
    SignatureMismatch,
    /// 外部のUTXO取得サービスやI/Oの失敗
    NetworkOrService,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("ファイルの読み込みに失敗しました: {file_path:?}, 詳細: {source}")]
    FileRead {
        file_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("トランザクションのデコードに失敗しました: {0}")]
    BitcoinConsensus(#[from] BitcoinEncodeError),

    #[error("UTXO取得サービスのエラー: {0}")]
    Provider(#[from] ProviderError),

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("入力アドレスが少なくとも1つ必要です")]
    MissingInput,

    #[error("出力が少なくとも1つ必要です")]
    MissingOutput,

    #[error("おつりアドレスが必要です")]
    MissingChangeAddress,

    #[error("入力 {index} が不正です: {reason}")]
    InvalidInput { index: usize, reason: String },

    #[error("出力 {index} が不正です: {reason}")]
    InvalidOutput { index: usize, reason: String },

    #[error("おつりアドレスの形式が不正です: {0}")]
    InvalidChangeAddress(String),

    #[error("出力 {index} の金額が不正です: {amount} sats (0はOP_RETURN出力のみ許可)")]
    InvalidOutputAmount { index: usize, amount: i64 },

    #[error("トランザクションに複数のネットワークのアドレスを含めることはできません: {address} は {network} 用ではありません")]
    MultipleBlockChains { address: String, network: String },

    #[error("資金不足: 利用可能な総額 {available} , 要求額 {required} (手数料 {fee} を含む)")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
        fee: Amount,
    },

    #[error("資金不足: 利用可能なUTXOがありません")]
    MissingUnspentOutputs,

    #[error("おつり {change} がダスト閾値 {threshold} 未満です (追加のUTXOでも解消できません)")]
    DustChange { change: Amount, threshold: Amount },

    #[error("トランザクションのエンコードが不正です: {0}")]
    InvalidTransactionEncoding(String),

    #[error("署名対象の入力数が不正です: 期待値 {expected}, 指定数 {given}")]
    InvalidInputCount { expected: usize, given: usize },

    #[error("入力 {input_index} の署名がありません")]
    MissingSignature { input_index: usize },

    #[error("入力 {input_index} の公開鍵がありません")]
    MissingPublicKey { input_index: usize },

    #[error("入力 {input_index} の {field} の16進数デコードに失敗: {source}")]
    InvalidHex {
        input_index: usize,
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("入力 {input_index} の署名が正規形式ではありません: {source}")]
    NonCanonicalSignature {
        input_index: usize,
        #[source]
        source: EncodingError,
    },

    #[error("入力 {input_index} の公開鍵が正規形式ではありません: {source}")]
    NonCanonicalPublicKey {
        input_index: usize,
        #[source]
        source: EncodingError,
    },

    #[error("入力 {input_index} のスクリプトが大きすぎてプッシュできません ({len} バイト)")]
    ScriptTooLarge { input_index: usize, len: usize },

    #[error("入力 {input_index} の署名検証に失敗しました: {reason}")]
    SignatureMismatch { input_index: usize, reason: String },

    #[error("入力 {input_index} の出力スクリプトは未対応です: {script_hex}")]
    UnsupportedOutputScript {
        input_index: usize,
        script_hex: String,
    },

    #[error("入力 {input_index} の署名情報の形式がスクリプト種別と一致しません")]
    UnsupportedSignatureInfo { input_index: usize },
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Io(_) | AppError::Provider(_) => ErrorKind::NetworkOrService,
            AppError::InsufficientFunds { .. }
            | AppError::MissingUnspentOutputs
            | AppError::DustChange { .. } => ErrorKind::InsufficientFunds,
            AppError::UnsupportedOutputScript { .. } => ErrorKind::UnsupportedOutputScript,
            AppError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            _ => ErrorKind::Validation,
        }
    }

    /// 外部公開用の安定したエラーコード
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) | AppError::Provider(_) => "CH000",
            AppError::InputValidation(_) | AppError::FileRead { .. } | AppError::JsonParse { .. } => "CH600",
            AppError::InsufficientFunds { .. }
            | AppError::MissingUnspentOutputs
            | AppError::DustChange { .. } => "CH601",
            AppError::MissingInput => "CH602",
            AppError::MissingOutput => "CH603",
            AppError::InvalidInput { .. } => "CH604",
            AppError::InvalidOutput { .. } => "CH605",
            AppError::InvalidOutputAmount { .. } => "CH606",
            AppError::MultipleBlockChains { .. } => "CH607",
            AppError::MissingChangeAddress | AppError::InvalidChangeAddress(_) => "CH608",
            AppError::InvalidTransactionEncoding(_) | AppError::BitcoinConsensus(_) => "CH609",
            AppError::InvalidInputCount { .. } => "CH610",
            AppError::MissingSignature { .. } | AppError::MissingPublicKey { .. } => "CH611",
            AppError::InvalidHex { .. }
            | AppError::NonCanonicalSignature { .. }
            | AppError::NonCanonicalPublicKey { .. }
            | AppError::ScriptTooLarge { .. } => "CH612",
            AppError::SignatureMismatch { .. } => "CH613",
            AppError::UnsupportedOutputScript { .. } => "CH614",
            AppError::UnsupportedSignatureInfo { .. } => "CH615",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

/// 境界を越えて返すエラー表現 `{message, code}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
}

//! 2段階のビットコイントランザクション構築
//!
//! 1. `transaction::build_transaction` がUTXOを選択し、未署名トランザクションと
//!    入力ごとの署名ハッシュを返す。
//! 2. 外部署名者が署名した後、`assembler::assemble_transaction` が署名を検証して
//!    各入力のアンロックスクリプトを組み立てる。

pub mod assembler;
pub mod canonical;
pub mod cli;
pub mod config;
pub mod error;
pub mod provider;
pub mod script;
pub mod selector;
pub mod transaction;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

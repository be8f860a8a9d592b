use clap::{Parser, Subcommand};
use std::path::PathBuf;
use bitcoin::Network as BitcoinNetwork;
use crate::error::AppError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 使用するネットワーク ("bitcoin", "testnet", "signet", "regtest")
    #[clap(short, long, value_parser, default_value = "testnet", global = true)]
    pub network: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 未署名トランザクションと署名リクエストを生成する
    Build {
        /// 入力・出力・おつりアドレスを記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        request: PathBuf,

        /// UTXOセットを記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        utxos: PathBuf,

        /// 結果のJSONを保存するファイルへのパス
        #[clap(short, long, value_parser)]
        output: PathBuf,
    },

    /// 資金元の全UTXOを1つのアドレスへ送る未署名トランザクションを生成する
    Sweep {
        #[clap(short, long, value_parser)]
        request: PathBuf,

        #[clap(short, long, value_parser)]
        utxos: PathBuf,

        #[clap(short, long, value_parser)]
        output: PathBuf,
    },

    /// 署名済みの署名リクエストから署名済みトランザクションを組み立てる
    Assemble {
        /// 署名リクエストと未署名トランザクションを記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        request: PathBuf,

        #[clap(short, long, value_parser)]
        output: PathBuf,
    },
}

impl Command {
    pub fn output_path(&self) -> &PathBuf {
        match self {
            Command::Build { output, .. } | Command::Sweep { output, .. } | Command::Assemble { output, .. } => output,
        }
    }
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "signet" => Ok(BitcoinNetwork::Signet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}

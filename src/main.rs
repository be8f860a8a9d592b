use std::fs::File;
use std::io::Write;
use std::path::Path;

use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use clap::Parser;
use serde::Serialize;

use bitcoin_tx_assembler::assembler;
use bitcoin_tx_assembler::cli::{parse_network, CliArgs, Command};
use bitcoin_tx_assembler::config::{
    load_json, AssembleRequestFile, AssembleResponse, BuildRequestFile, BuildResponse, SweepRequestFile, TransactionDef,
};
use bitcoin_tx_assembler::error::AppError;
use bitcoin_tx_assembler::provider::StaticProvider;
use bitcoin_tx_assembler::transaction;

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let output_path = args.command.output_path().clone();
    let result = parse_network(&args.network).and_then(|network| {
        log::info!("指定されたネットワーク: {:?}", network);
        run(&args.command, network)
    });

    match result {
        Ok(()) => {
            log::info!("処理が正常に完了しました。");
            Ok(())
        }
        Err(e) => {
            log::error!("処理に失敗しました [{}]: {}", e.code(), e);
            write_json(&output_path, &e.to_response())?;
            Err(e)
        }
    }
}

fn run(command: &Command, network: Network) -> Result<(), AppError> {
    match command {
        Command::Build { request, utxos, output } => {
            let file: BuildRequestFile = load_json(request)?;
            let build_request = file.into_request(network)?;
            let provider = StaticProvider::from_json_file(utxos, network)?;

            let result = transaction::build_transaction(&provider, &build_request)?;
            log::info!("未署名トランザクション: {}", result.unsigned_transaction.to_hex());
            write_json(output, &BuildResponse::from_result(&result))
        }
        Command::Sweep { request, utxos, output } => {
            let file: SweepRequestFile = load_json(request)?;
            let sweep_request = file.into_request(network)?;
            let provider = StaticProvider::from_json_file(utxos, network)?;

            let result = transaction::build_sweep(&provider, &sweep_request)?;
            log::info!("未署名トランザクション: {}", result.unsigned_transaction.to_hex());
            write_json(output, &BuildResponse::from_result(&result))
        }
        Command::Assemble { request, output } => {
            let file: AssembleRequestFile = load_json(request)?;
            let (unsigned, requests, options) = file.into_parts(network)?;

            let secp = Secp256k1::verification_only();
            let signed = assembler::assemble_transaction(&secp, &unsigned, &requests, &options)?;
            log::info!("Raw transaction hex: {}", signed.to_hex());
            write_json(output, &AssembleResponse { signed_transaction: TransactionDef::from_signed(&signed) })
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| AppError::JsonParse {
        file_path: path.to_path_buf(),
        source: e,
    })?;
    let mut output_file = File::create(path).map_err(|e| {
        log::error!("出力ファイルの作成に失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    output_file.write_all(json.as_bytes()).map_err(|e| {
        log::error!("出力ファイルへの書き込みに失敗しました。");
        AppError::Io(e)
    })?;
    log::info!("結果を {:?} に保存しました。", path);
    Ok(())
}

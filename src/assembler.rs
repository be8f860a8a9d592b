//! 外部署名者から受け取った署名を検証し、各入力の script_sig を組み立てる

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1, Verification};
use bitcoin::{PublicKey, Script, ScriptBuf, Transaction};
use serde::Deserialize;

use crate::{
    canonical::{check_public_key_encoding, check_signature_encoding},
    error::AppError,
    script::{multisig_redeem_script, multisig_script_sig, pay_to_pubkey_hash_script_sig, pay_to_pubkey_script_sig},
    transaction::signature_hash,
    types::{ScriptKind, SignatureMaterial, SignedTransaction, SigningRequest, UnsignedTransaction},
};

// スクリプトでプッシュできる要素の最大サイズ
const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// マルチシグ入力で署名と公開鍵の対応をどこまで検証するか
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultisigVerification {
    /// 署名のエンコーディングのみチェックし、どの鍵の署名かは検証しない
    #[default]
    CanonicalOnly,
    /// OP_CHECKMULTISIG と同じ順序で各署名を公開鍵に対して検証する
    Strict,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleOptions {
    pub multisig_verification: MultisigVerification,
}

pub fn assemble_transaction<C: Verification>(
    secp: &Secp256k1<C>,
    unsigned: &UnsignedTransaction,
    requests: &[SigningRequest],
    options: &AssembleOptions,
) -> Result<SignedTransaction, AppError> {
    let original = &unsigned.transaction;

    if requests.is_empty() {
        log::info!("署名リクエストが空のため、トランザクションをそのまま返します。");
        return Ok(SignedTransaction {
            transaction: original.clone(),
            total_output_amount: unsigned.total_output_amount,
            fee: unsigned.fee,
        });
    }
    if requests.len() != original.input.len() {
        return Err(AppError::InvalidInputCount { expected: original.input.len(), given: requests.len() });
    }

    log::info!("署名の組み立てを開始します。入力数: {}", requests.len());

    // 全入力の検証が通ってから書き込む
    let script_sigs = requests
        .iter()
        .enumerate()
        .map(|(input_index, request)| unlocking_script(secp, original, input_index, request, options))
        .collect::<Result<Vec<_>, _>>()?;

    let mut transaction = original.clone();
    for (input, script_sig) in transaction.input.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }

    log::info!("全ての入力の署名を組み立てました。TXID: {}", transaction.compute_txid());
    Ok(SignedTransaction { transaction, total_output_amount: unsigned.total_output_amount, fee: unsigned.fee })
}

fn unlocking_script<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    request: &SigningRequest,
    options: &AssembleOptions,
) -> Result<ScriptBuf, AppError> {
    let placeholder = tx.input[input_index].script_sig.as_script();
    let kind = ScriptKind::classify(placeholder);
    log::debug!("入力 {}: ロックスクリプト種別 {}", input_index, kind.name());

    match (&request.material, &kind) {
        (SignatureMaterial::SignatureScript(script_sig), _) => {
            log::debug!("入力 {}: 指定されたアンロックスクリプトをそのまま使用します", input_index);
            Ok(script_sig.clone())
        }
        (_, ScriptKind::Unsupported) => {
            Err(AppError::UnsupportedOutputScript { input_index, script_hex: placeholder.to_hex_string() })
        }
        (SignatureMaterial::Single { signature, public_key }, ScriptKind::PayToPubkey(embedded)) => {
            let raw_signature = signature.as_deref().ok_or(AppError::MissingSignature { input_index })?;
            let parsed_signature = parse_signature(input_index, raw_signature)?;
            let embedded_key = parse_public_key(input_index, embedded)?;
            if let Some(raw_key) = public_key {
                if parse_public_key(input_index, raw_key)? != embedded_key {
                    return Err(mismatch(input_index, "公開鍵がロックスクリプトの鍵と一致しません"));
                }
            }

            let digest = expected_digest(tx, input_index, placeholder, request)?;
            verify_signature(secp, input_index, digest, &parsed_signature, &embedded_key)?;
            pay_to_pubkey_script_sig(raw_signature).map_err(|_| too_large(input_index, raw_signature.len()))
        }
        (SignatureMaterial::Single { signature, public_key }, ScriptKind::PayToPubkeyHash(hash)) => {
            let raw_signature = signature.as_deref().ok_or(AppError::MissingSignature { input_index })?;
            let raw_key = public_key.as_deref().ok_or(AppError::MissingPublicKey { input_index })?;
            let parsed_signature = parse_signature(input_index, raw_signature)?;
            let key = parse_public_key(input_index, raw_key)?;
            if key.pubkey_hash().to_byte_array() != *hash {
                return Err(mismatch(input_index, "公開鍵のハッシュがロックスクリプトと一致しません"));
            }

            let digest = expected_digest(tx, input_index, placeholder, request)?;
            verify_signature(secp, input_index, digest, &parsed_signature, &key)?;
            pay_to_pubkey_hash_script_sig(raw_signature, &key).map_err(|_| too_large(input_index, raw_signature.len()))
        }
        (SignatureMaterial::Multi { signatures, public_keys }, ScriptKind::BareMultisig { required, public_keys: embedded }) => {
            if signatures.len() < *required {
                return Err(AppError::MissingSignature { input_index });
            }
            if signatures.len() > *required {
                return Err(mismatch(
                    input_index,
                    &format!("署名数 {} が必要数 {} と一致しません", signatures.len(), required),
                ));
            }
            let parsed_signatures = parse_signatures(input_index, signatures)?;
            for raw_key in public_keys {
                parse_public_key(input_index, raw_key)?;
            }

            match options.multisig_verification {
                MultisigVerification::Strict => {
                    let keys = embedded
                        .iter()
                        .map(|raw_key| parse_public_key(input_index, raw_key))
                        .collect::<Result<Vec<_>, _>>()?;
                    let digest = expected_digest(tx, input_index, placeholder, request)?;
                    verify_multisig(secp, input_index, digest, &parsed_signatures, &keys)?;
                }
                MultisigVerification::CanonicalOnly => {
                    log::warn!("入力 {}: マルチシグ署名と公開鍵の対応は検証していません", input_index);
                }
            }
            multisig_script_sig(signatures, None).map_err(|_| too_large(input_index, placeholder.len()))
        }
        (SignatureMaterial::Multi { signatures, public_keys }, ScriptKind::PayToScriptHash(hash)) => {
            if signatures.is_empty() {
                return Err(AppError::MissingSignature { input_index });
            }
            if public_keys.is_empty() {
                return Err(AppError::MissingPublicKey { input_index });
            }
            let parsed_signatures = parse_signatures(input_index, signatures)?;
            let keys = public_keys
                .iter()
                .map(|raw_key| parse_public_key(input_index, raw_key))
                .collect::<Result<Vec<_>, _>>()?;
            if signatures.len() > keys.len() {
                return Err(mismatch(
                    input_index,
                    &format!("署名数 {} が公開鍵の数 {} を超えています", signatures.len(), keys.len()),
                ));
            }

            // 必要署名数は受け取った署名の数とする
            let redeem_script = multisig_redeem_script(signatures.len(), &keys);
            if redeem_script.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(too_large(input_index, redeem_script.len()));
            }
            if redeem_script.script_hash().to_byte_array() != *hash {
                return Err(mismatch(input_index, "redeem scriptのハッシュがP2SHアドレスと一致しません"));
            }

            match options.multisig_verification {
                MultisigVerification::Strict => {
                    let digest = expected_digest(tx, input_index, &redeem_script, request)?;
                    verify_multisig(secp, input_index, digest, &parsed_signatures, &keys)?;
                }
                MultisigVerification::CanonicalOnly => {
                    log::warn!("入力 {}: マルチシグ署名と公開鍵の対応は検証していません", input_index);
                }
            }
            multisig_script_sig(signatures, Some(&redeem_script))
                .map_err(|_| too_large(input_index, redeem_script.len()))
        }
        _ => Err(AppError::UnsupportedSignatureInfo { input_index }),
    }
}

/// 署名ハッシュを再計算する。リクエストの値と異なる場合は再計算した値を使う
fn expected_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    request: &SigningRequest,
) -> Result<[u8; 32], AppError> {
    let digest = signature_hash(tx, input_index, script_code)?;
    if digest != request.digest {
        log::warn!(
            "入力 {}: リクエストの署名ハッシュ {} と再計算値 {} が異なります",
            input_index,
            hex::encode(request.digest),
            hex::encode(digest)
        );
    }
    Ok(digest)
}

fn parse_signature(input_index: usize, raw: &[u8]) -> Result<Signature, AppError> {
    check_signature_encoding(raw).map_err(|source| AppError::NonCanonicalSignature { input_index, source })
}

fn parse_signatures(input_index: usize, raws: &[Vec<u8>]) -> Result<Vec<Signature>, AppError> {
    raws.iter().map(|raw| parse_signature(input_index, raw)).collect()
}

fn parse_public_key(input_index: usize, raw: &[u8]) -> Result<PublicKey, AppError> {
    check_public_key_encoding(raw).map_err(|source| AppError::NonCanonicalPublicKey { input_index, source })
}

fn verify_signature<C: Verification>(
    secp: &Secp256k1<C>,
    input_index: usize,
    digest: [u8; 32],
    signature: &Signature,
    public_key: &PublicKey,
) -> Result<(), AppError> {
    let message = Message::from_digest(digest);
    secp.verify_ecdsa(&message, signature, &public_key.inner)
        .map_err(|e| mismatch(input_index, &format!("署名検証エラー: {}", e)))
}

/// OP_CHECKMULTISIG と同じく、署名と公開鍵を先頭から順に突き合わせる
fn verify_multisig<C: Verification>(
    secp: &Secp256k1<C>,
    input_index: usize,
    digest: [u8; 32],
    signatures: &[Signature],
    public_keys: &[PublicKey],
) -> Result<(), AppError> {
    let message = Message::from_digest(digest);
    let mut remaining = public_keys.iter();
    for (position, signature) in signatures.iter().enumerate() {
        let matched = remaining
            .by_ref()
            .any(|key| secp.verify_ecdsa(&message, signature, &key.inner).is_ok());
        if !matched {
            return Err(mismatch(
                input_index,
                &format!("{} 番目の署名に対応する公開鍵が見つかりません", position + 1),
            ));
        }
    }
    Ok(())
}

fn mismatch(input_index: usize, reason: &str) -> AppError {
    AppError::SignatureMismatch { input_index, reason: reason.to_string() }
}

fn too_large(input_index: usize, len: usize) -> AppError {
    AppError::ScriptTooLarge { input_index, len }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::{high_s_variant, keypair, padded_r_variant, sign_digest};
    use bitcoin::absolute::LockTime;
    use bitcoin::opcodes::all::OP_CHECKSIG;
    use bitcoin::script::{Builder, Instruction};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut, Txid, Witness};

    fn unsigned_with(placeholders: Vec<ScriptBuf>) -> UnsignedTransaction {
        let input = placeholders
            .into_iter()
            .enumerate()
            .map(|(vout, script_sig)| TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([0xab; 32]), vout as u32),
                script_sig,
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();
        let transaction = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::new_p2pkh(&keypair(99).1.pubkey_hash()),
            }],
        };
        UnsignedTransaction { transaction, total_output_amount: Amount::from_sat(5_000), fee: Amount::from_sat(100) }
    }

    fn single(digest: [u8; 32], signature: Option<Vec<u8>>, public_key: Option<Vec<u8>>) -> SigningRequest {
        SigningRequest { address: None, digest, material: SignatureMaterial::Single { signature, public_key } }
    }

    fn multi(digest: [u8; 32], signatures: Vec<Vec<u8>>, public_keys: Vec<Vec<u8>>) -> SigningRequest {
        SigningRequest { address: None, digest, material: SignatureMaterial::Multi { signatures, public_keys } }
    }

    fn pushes(script: &Script) -> Vec<Vec<u8>> {
        script
            .instructions()
            .map(|ins| match ins.unwrap() {
                Instruction::PushBytes(bytes) => bytes.as_bytes().to_vec(),
                Instruction::Op(op) => panic!("unexpected opcode {:?}", op),
            })
            .collect()
    }

    #[test]
    fn test_pay_to_pubkey_hash() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(1);
        let placeholder = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();
        let signature = sign_digest(&sk, digest);

        let request = single(digest, Some(signature.clone()), Some(pk.to_bytes()));
        let signed = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap();
        let script_sig = &signed.transaction.input[0].script_sig;
        let items = pushes(script_sig);
        assert_eq!(items[0][..signature.len()], signature[..]);
        assert_eq!(items[0].last(), Some(&0x01));
        assert_eq!(items[1], pk.to_bytes());
        assert_eq!(signed.fee, unsigned.fee);
        assert_eq!(signed.transaction.output, unsigned.transaction.output);
    }

    #[test]
    fn test_pay_to_pubkey_hash_rejects_wrong_key_and_signature() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(1);
        let (other_sk, other_pk) = keypair(2);
        let placeholder = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();

        let request = single(digest, Some(sign_digest(&sk, digest)), Some(other_pk.to_bytes()));
        let err = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::SignatureMismatch { input_index: 0, .. }));

        let request = single(digest, Some(sign_digest(&other_sk, digest)), Some(pk.to_bytes()));
        let err = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
    }

    #[test]
    fn test_missing_material() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(1);
        let placeholder = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();

        let request = single(digest, None, Some(pk.to_bytes()));
        let err = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::MissingSignature { input_index: 0 }));

        let request = single(digest, Some(sign_digest(&sk, digest)), None);
        let err = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::MissingPublicKey { input_index: 0 }));
    }

    #[test]
    fn test_pay_to_pubkey() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(3);
        let placeholder = Builder::new().push_key(&pk).push_opcode(OP_CHECKSIG).into_script();
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();
        let signature = sign_digest(&sk, digest);

        let signed = assemble_transaction(
            &secp,
            &unsigned,
            &[single(digest, Some(signature.clone()), None)],
            &AssembleOptions::default(),
        )
        .unwrap();
        assert_eq!(pushes(&signed.transaction.input[0].script_sig).len(), 1);

        let wrong_key = single(digest, Some(signature), Some(keypair(4).1.to_bytes()));
        let err = assemble_transaction(&secp, &unsigned, &[wrong_key], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::SignatureMismatch { .. }));
    }

    #[test]
    fn test_non_canonical_signature_is_validation_error() {
        let secp = Secp256k1::new();
        let (sk, pk) = keypair(1);
        let placeholder = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();
        let der = sign_digest(&sk, digest);

        for signature in [high_s_variant(&der), padded_r_variant(&der)] {
            let request = single(digest, Some(signature), Some(pk.to_bytes()));
            let err = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap_err();
            assert!(matches!(err, AppError::NonCanonicalSignature { input_index: 0, .. }));
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.code(), "CH612");
        }
    }

    #[test]
    fn test_bare_multisig() {
        let secp = Secp256k1::new();
        let keys: Vec<_> = (1..=3).map(keypair).collect();
        let public_keys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
        let placeholder = multisig_redeem_script(2, &public_keys);
        let unsigned = unsigned_with(vec![placeholder.clone()]);
        let digest = signature_hash(&unsigned.transaction, 0, &placeholder).unwrap();
        let in_order = vec![sign_digest(&keys[0].0, digest), sign_digest(&keys[2].0, digest)];
        let reversed: Vec<_> = in_order.iter().rev().cloned().collect();
        let strict = AssembleOptions { multisig_verification: MultisigVerification::Strict };

        let signed = assemble_transaction(&secp, &unsigned, &[multi(digest, in_order.clone(), vec![])], &strict).unwrap();
        let items = pushes(&signed.transaction.input[0].script_sig);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_empty());

        // 順序違いは厳密モードでのみ拒否される
        let err = assemble_transaction(&secp, &unsigned, &[multi(digest, reversed.clone(), vec![])], &strict).unwrap_err();
        assert!(matches!(err, AppError::SignatureMismatch { .. }));
        assert!(assemble_transaction(&secp, &unsigned, &[multi(digest, reversed, vec![])], &AssembleOptions::default()).is_ok());

        let too_few = multi(digest, in_order[..1].to_vec(), vec![]);
        let err = assemble_transaction(&secp, &unsigned, &[too_few], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::MissingSignature { input_index: 0 }));
    }

    #[test]
    fn test_script_hash_multisig() {
        let secp = Secp256k1::new();
        let keys: Vec<_> = (1..=3).map(keypair).collect();
        let public_keys: Vec<_> = keys.iter().map(|(_, pk)| *pk).collect();
        let redeem = multisig_redeem_script(2, &public_keys);
        let placeholder = ScriptBuf::new_p2sh(&redeem.script_hash());
        let unsigned = unsigned_with(vec![placeholder]);
        let digest = signature_hash(&unsigned.transaction, 0, &redeem).unwrap();
        let signatures = vec![sign_digest(&keys[0].0, digest), sign_digest(&keys[1].0, digest)];
        let raw_keys: Vec<_> = public_keys.iter().map(|pk| pk.to_bytes()).collect();
        let strict = AssembleOptions { multisig_verification: MultisigVerification::Strict };

        let signed =
            assemble_transaction(&secp, &unsigned, &[multi(digest, signatures.clone(), raw_keys.clone())], &strict).unwrap();
        let items = pushes(&signed.transaction.input[0].script_sig);
        assert_eq!(items.len(), 4);
        assert_eq!(items[3], redeem.to_bytes());

        // 署名が1つだと 1-of-3 として再構築され、ハッシュが一致しない
        let one = multi(digest, signatures[..1].to_vec(), raw_keys.clone());
        let err = assemble_transaction(&secp, &unsigned, &[one], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::SignatureMismatch { input_index: 0, .. }));

        let err = assemble_transaction(&secp, &unsigned, &[multi(digest, signatures, vec![])], &strict).unwrap_err();
        assert!(matches!(err, AppError::MissingPublicKey { input_index: 0 }));
    }

    #[test]
    fn test_request_count_and_passthrough() {
        let secp = Secp256k1::new();
        let pk = keypair(1).1;
        let unsigned = unsigned_with(vec![ScriptBuf::new_p2pkh(&pk.pubkey_hash()); 2]);

        let signed = assemble_transaction(&secp, &unsigned, &[], &AssembleOptions::default()).unwrap();
        assert_eq!(signed.transaction, unsigned.transaction);

        let err = assemble_transaction(&secp, &unsigned, &[single([0; 32], None, None)], &AssembleOptions::default())
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInputCount { expected: 2, given: 1 }));
    }

    #[test]
    fn test_unsupported_and_mismatched_shapes() {
        let secp = Secp256k1::new();
        let pk = keypair(1).1;
        let unsigned = unsigned_with(vec![ScriptBuf::new(), ScriptBuf::new_p2pkh(&pk.pubkey_hash())]);
        let requests = [single([0; 32], None, None), multi([0; 32], vec![], vec![])];

        let err = assemble_transaction(&secp, &unsigned, &requests, &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedOutputScript { input_index: 0, .. }));
        assert_eq!(err.kind(), ErrorKind::UnsupportedOutputScript);

        let requests = [SigningRequest {
            address: None,
            digest: [0; 32],
            material: SignatureMaterial::SignatureScript(ScriptBuf::from_bytes(vec![0x51])),
        }, multi([0; 32], vec![], vec![])];
        let err = assemble_transaction(&secp, &unsigned, &requests, &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedSignatureInfo { input_index: 1 }));
    }

    #[test]
    fn test_signature_script_is_used_as_is() {
        let secp = Secp256k1::new();
        let unsigned = unsigned_with(vec![ScriptBuf::new()]);
        let provided = ScriptBuf::from_bytes(vec![0x00, 0x51]);
        let request = SigningRequest {
            address: None,
            digest: [0; 32],
            material: SignatureMaterial::SignatureScript(provided.clone()),
        };
        let signed = assemble_transaction(&secp, &unsigned, &[request], &AssembleOptions::default()).unwrap();
        assert_eq!(signed.transaction.input[0].script_sig, provided);
    }
}

use bitcoin::consensus::encode;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::Instruction;
use bitcoin::{Address, Amount, OutPoint, Script, ScriptBuf, Transaction};
use serde::Deserialize;

/// ロックスクリプトの分類結果。
/// 埋め込まれた公開鍵は生バイトのまま保持し、正規性のチェックは署名組み立て時に行う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    /// `<pubkey> OP_CHECKSIG`
    PayToPubkey(Vec<u8>),
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    PayToPubkeyHash([u8; 20]),
    /// `<m> <pubkey>... <n> OP_CHECKMULTISIG`
    BareMultisig { required: usize, public_keys: Vec<Vec<u8>> },
    /// `OP_HASH160 <20> OP_EQUAL`
    PayToScriptHash([u8; 20]),
    Unsupported,
}

impl ScriptKind {
    pub fn classify(script: &Script) -> Self {
        let bytes = script.as_bytes();
        if script.is_p2pkh() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes[3..23]);
            return ScriptKind::PayToPubkeyHash(hash);
        }
        if script.is_p2sh() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes[2..22]);
            return ScriptKind::PayToScriptHash(hash);
        }
        if let Some(public_key) = match_pay_to_pubkey(script) {
            return ScriptKind::PayToPubkey(public_key);
        }
        if let Some((required, public_keys)) = match_multisig(script) {
            return ScriptKind::BareMultisig { required, public_keys };
        }
        ScriptKind::Unsupported
    }

    /// 1つの署名と公開鍵で解除できる種別か (署名リクエストの形を決める)
    pub fn is_single_key(&self) -> bool {
        matches!(self, ScriptKind::PayToPubkey(_) | ScriptKind::PayToPubkeyHash(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::PayToPubkey(_) => "P2PK",
            ScriptKind::PayToPubkeyHash(_) => "P2PKH",
            ScriptKind::BareMultisig { .. } => "multisig",
            ScriptKind::PayToScriptHash(_) => "P2SH",
            ScriptKind::Unsupported => "unsupported",
        }
    }
}

/// 証明可能な使用不能スクリプト (OP_RETURN で始まるデータキャリア) か
pub fn is_data_carrier(script: &Script) -> bool {
    script.is_op_return()
}

fn is_public_key_len(len: usize) -> bool {
    len == 33 || len == 65
}

fn match_pay_to_pubkey(script: &Script) -> Option<Vec<u8>> {
    let mut instructions = script.instructions();
    let public_key = match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) if is_public_key_len(bytes.len()) => bytes.as_bytes().to_vec(),
        _ => return None,
    };
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_CHECKSIG => {}
        _ => return None,
    }
    match instructions.next() {
        None => Some(public_key),
        Some(_) => None,
    }
}

fn decode_pushnum(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let byte = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&byte) {
                Some((byte - OP_PUSHNUM_1.to_u8() + 1) as usize)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn match_multisig(script: &Script) -> Option<(usize, Vec<Vec<u8>>)> {
    let instructions: Vec<Instruction> = script.instructions().collect::<Result<_, _>>().ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (total, keys) = rest.split_last()?;

    if *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    let required = decode_pushnum(first)?;
    let total = decode_pushnum(total)?;

    let public_keys = keys
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(bytes) if is_public_key_len(bytes.len()) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if required > total || total != public_keys.len() {
        return None;
    }
    Some((required, public_keys))
}

/// 外部サービスから取得した未使用出力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub out_point: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
    pub addresses: Vec<Address>,
}

/// 資金元。P2SHアドレスの場合は redeem script を伴う
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingSource {
    pub address: Address,
    pub redeem_script: Option<ScriptBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedOutput {
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}

/// 選択対象になったUTXOとその分類結果
#[derive(Debug, Clone)]
pub struct ProcessedUtxo {
    pub utxo: UnspentOutput,
    pub kind: ScriptKind,
    pub redeem_script: Option<ScriptBuf>,
}

impl ProcessedUtxo {
    /// 署名ハッシュ計算に使うスクリプト (P2SHなら redeem script)
    pub fn script_code(&self) -> &Script {
        match &self.redeem_script {
            Some(redeem_script) => redeem_script.as_script(),
            None => self.utxo.script_pubkey.as_script(),
        }
    }
}

/// おつりがダスト閾値未満になったときの扱い
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DustPolicy {
    /// そのままおつり出力にする
    #[default]
    Keep,
    /// UTXOを追加して解消を試み、できなければ資金不足として失敗する
    Reject,
    /// 手数料に含める (マイナーに渡る)
    AddToFee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangePolicy {
    pub dust_threshold: Amount,
    pub on_dust: DustPolicy,
}

impl Default for ChangePolicy {
    fn default() -> Self {
        ChangePolicy {
            dust_threshold: Amount::from_sat(crate::selector::DEFAULT_DUST_THRESHOLD_SATS),
            on_dust: DustPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionOrder {
    /// UTXO取得サービスが返した順序のまま
    #[default]
    AsProvided,
    /// 金額の大きい順 (同額は元の順序を保つ)
    LargestFirst,
}

/// 外部署名者が埋める署名・公開鍵の枠
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureMaterial {
    Single {
        signature: Option<Vec<u8>>,
        public_key: Option<Vec<u8>>,
    },
    Multi {
        signatures: Vec<Vec<u8>>,
        public_keys: Vec<Vec<u8>>,
    },
    /// 呼び出し側が組み立て済みのアンロックスクリプト
    SignatureScript(ScriptBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pub address: Option<Address>,
    pub digest: [u8; 32],
    pub material: SignatureMaterial,
}

/// 各入力の script_sig にロックスクリプトのプレースホルダーを持つ未署名トランザクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub transaction: Transaction,
    pub total_output_amount: Amount,
    pub fee: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub total_output_amount: Amount,
    pub fee: Amount,
}

impl UnsignedTransaction {
    pub fn to_hex(&self) -> String {
        encode::serialize_hex(&self.transaction)
    }
}

impl SignedTransaction {
    pub fn to_hex(&self) -> String {
        encode::serialize_hex(&self.transaction)
    }
}

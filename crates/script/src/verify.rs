//! The signature-verification seam.
//!
//! Block and mempool validation consume script checking through
//! [`verify_script`] and the [`SignatureChecker`] trait. Spends of the
//! standard templates (pay-to-pubkey, pay-to-pubkey-hash, script-hash
//! wrappers and bare multisig) are verified against the checker; anything
//! else fails closed with [`ScriptError::UnsupportedScript`]. Full opcode
//! evaluation is outside this crate's scope.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey};

use coind_primitives::hash::hash160;
use coind_primitives::transaction::Transaction;

use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, PrecomputedTransactionData, SighashType};
use crate::standard::{is_p2pk, is_p2pkh, is_p2sh};
use crate::{
    ScriptFlags, OP_0, OP_1, OP_16, OP_1NEGATE, OP_CHECKMULTISIG, OP_PUSHDATA1, OP_PUSHDATA2,
    OP_PUSHDATA4, SCRIPT_VERIFY_CLEANSTACK, SCRIPT_VERIFY_LOW_S, SCRIPT_VERIFY_NONE,
    SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICTENC,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    SigPushOnly,
    SigEncoding,
    SigHashType,
    SigHighS,
    PubKeyEncoding,
    StackUnderflow,
    CleanStack,
    UnsupportedScript,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::SigPushOnly => write!(f, "signature script is not push-only"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::SigHashType => write!(f, "undefined signature hash type"),
            ScriptError::SigHighS => write!(f, "high-S signature"),
            ScriptError::PubKeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::StackUnderflow => write!(f, "stack underflow"),
            ScriptError::CleanStack => write!(f, "extra items left on stack"),
            ScriptError::UnsupportedScript => write!(f, "unsupported script form"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Checks a single signature against a transaction context. The one seam
/// through which validation reaches cryptography; tests substitute their own.
pub trait SignatureChecker {
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        flags: ScriptFlags,
    ) -> Result<bool, ScriptError>;
}

pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub amount: i64,
    pub precomputed: Option<&'a PrecomputedTransactionData>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: i64) -> Self {
        Self {
            tx,
            input_index,
            amount,
            precomputed: None,
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        flags: ScriptFlags,
    ) -> Result<bool, ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(false);
        }
        let hash_type = SighashType(*sig_bytes.last().ok_or(ScriptError::SigEncoding)? as u32);
        if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !hash_type.is_defined() {
            return Err(ScriptError::SigHashType);
        }

        let der = &sig_bytes[..sig_bytes.len() - 1];
        let sig = match Signature::from_der(der) {
            Ok(sig) => sig,
            Err(_) => {
                if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
                    return Err(ScriptError::SigEncoding);
                }
                return Ok(false);
            }
        };
        let mut normalized = sig;
        normalized.normalize_s();
        if (flags & SCRIPT_VERIFY_LOW_S) != 0 && normalized != sig {
            return Err(ScriptError::SigHighS);
        }

        let pubkey = match PublicKey::from_slice(pubkey_bytes) {
            Ok(pubkey) => pubkey,
            Err(_) => {
                if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
                    return Err(ScriptError::PubKeyEncoding);
                }
                return Ok(false);
            }
        };

        let hash = signature_hash(self.tx, self.input_index, script_code, hash_type)
            .map_err(|_| ScriptError::SigEncoding)?;
        let message = Message::from_digest(hash);
        Ok(secp256k1_verify()
            .verify_ecdsa(&message, &normalized, &pubkey)
            .is_ok())
    }
}

/// Splits a script into its data pushes. `None` when the script contains a
/// non-push opcode or a truncated push.
pub(crate) fn parse_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_0 => pushes.push(Vec::new()),
            0x01..=0x4b => {
                let len = opcode as usize;
                if cursor + len > script.len() {
                    return None;
                }
                pushes.push(script[cursor..cursor + len].to_vec());
                cursor += len;
            }
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                if cursor + len > script.len() {
                    return None;
                }
                pushes.push(script[cursor..cursor + len].to_vec());
                cursor += len;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    return None;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2;
                if cursor + len > script.len() {
                    return None;
                }
                pushes.push(script[cursor..cursor + len].to_vec());
                cursor += len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    return None;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4;
                if cursor + len > script.len() {
                    return None;
                }
                pushes.push(script[cursor..cursor + len].to_vec());
                cursor += len;
            }
            OP_1NEGATE => pushes.push(vec![0x81]),
            OP_1..=OP_16 => pushes.push(vec![opcode - OP_1 + 1]),
            _ => return None,
        }
    }
    Some(pushes)
}

/// Verifies that `script_sig` satisfies `script_pubkey` for the input the
/// checker is bound to.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let stack = parse_pushes(script_sig).ok_or(ScriptError::SigPushOnly)?;

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        let mut stack = stack;
        let redeem_script = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        if hash160(&redeem_script) != script_pubkey[2..22] {
            return Err(ScriptError::EvalFalse);
        }
        return eval_template(&redeem_script, stack, flags, checker);
    }

    eval_template(script_pubkey, stack, flags, checker)
}

fn eval_template(
    script_pubkey: &[u8],
    mut stack: Vec<Vec<u8>>,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    // Anyone-can-spend: a bare OP_TRUE output.
    if script_pubkey == [OP_1] {
        if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && !stack.is_empty() {
            return Err(ScriptError::CleanStack);
        }
        return Ok(());
    }

    if is_p2pkh(script_pubkey) {
        if stack.len() < 2 {
            return Err(ScriptError::StackUnderflow);
        }
        if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 2 {
            return Err(ScriptError::CleanStack);
        }
        let pubkey = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        if hash160(&pubkey) != script_pubkey[3..23] {
            return Err(ScriptError::EvalFalse);
        }
        if !checker.check_sig(&sig, &pubkey, script_pubkey, flags)? {
            return Err(ScriptError::EvalFalse);
        }
        return Ok(());
    }

    if is_p2pk(script_pubkey) {
        if stack.is_empty() {
            return Err(ScriptError::StackUnderflow);
        }
        if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        let key_len = script_pubkey[0] as usize;
        let pubkey = &script_pubkey[1..1 + key_len];
        if !checker.check_sig(&sig, pubkey, script_pubkey, flags)? {
            return Err(ScriptError::EvalFalse);
        }
        return Ok(());
    }

    if let Some((required, pubkeys)) = parse_multisig(script_pubkey) {
        // The off-by-one dummy element consumed by OP_CHECKMULTISIG.
        if stack.len() < required + 1 {
            return Err(ScriptError::StackUnderflow);
        }
        if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != required + 1 {
            return Err(ScriptError::CleanStack);
        }
        let sigs = stack.split_off(stack.len() - required);
        let mut key_cursor = 0usize;
        for sig in &sigs {
            let mut matched = false;
            while key_cursor < pubkeys.len() {
                let pubkey = &pubkeys[key_cursor];
                key_cursor += 1;
                if checker.check_sig(sig, pubkey, script_pubkey, flags)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Err(ScriptError::EvalFalse);
            }
        }
        return Ok(());
    }

    Err(ScriptError::UnsupportedScript)
}

fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if !matches!(
        crate::standard::classify_script_pubkey(script),
        crate::standard::ScriptType::Multisig
    ) {
        return None;
    }
    let required = (script[0] - OP_1 + 1) as usize;
    let mut pubkeys = Vec::new();
    let mut cursor = 1usize;
    while cursor < script.len() - 2 {
        let len = script[cursor] as usize;
        pubkeys.push(script[cursor + 1..cursor + 1 + len].to_vec());
        cursor += 1 + len;
    }
    Some((required, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A checker that approves a signature iff it equals the pubkey; enough
    /// to drive the template dispatch without key material.
    struct MirrorChecker;

    impl SignatureChecker for MirrorChecker {
        fn check_sig(
            &self,
            sig_bytes: &[u8],
            pubkey_bytes: &[u8],
            _script_code: &[u8],
            _flags: ScriptFlags,
        ) -> Result<bool, ScriptError> {
            Ok(!sig_bytes.is_empty() && sig_bytes == pubkey_bytes)
        }
    }

    fn push(data: &[u8]) -> Vec<u8> {
        let mut script = vec![data.len() as u8];
        script.extend_from_slice(data);
        script
    }

    fn p2pkh_for(pubkey: &[u8]) -> Vec<u8> {
        let mut script = vec![crate::OP_DUP, crate::OP_HASH160, 0x14];
        script.extend_from_slice(&hash160(pubkey));
        script.extend_from_slice(&[crate::OP_EQUALVERIFY, crate::OP_CHECKSIG]);
        script
    }

    #[test]
    fn op_true_output_spendable_with_empty_sig() {
        assert_eq!(
            verify_script(&[], &[OP_1], SCRIPT_VERIFY_NONE, &MirrorChecker),
            Ok(())
        );
    }


    #[test]
    fn p2pkh_requires_matching_key_hash() {
        let pubkey = [0xabu8; 33];
        let script_pubkey = p2pkh_for(&pubkey);
        let mut script_sig = push(&pubkey);
        script_sig.extend_from_slice(&push(&pubkey));

        assert_eq!(
            verify_script(
                &script_sig,
                &script_pubkey,
                SCRIPT_VERIFY_NONE,
                &MirrorChecker
            ),
            Ok(())
        );

        let other = [0xcdu8; 33];
        let mut wrong_sig = push(&other);
        wrong_sig.extend_from_slice(&push(&other));
        assert_eq!(
            verify_script(
                &wrong_sig,
                &script_pubkey,
                SCRIPT_VERIFY_NONE,
                &MirrorChecker
            ),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2sh_wraps_inner_template() {
        let pubkey = [0x44u8; 33];
        let redeem = p2pkh_for(&pubkey);

        let mut script_pubkey = vec![crate::OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&hash160(&redeem));
        script_pubkey.push(crate::OP_EQUAL);

        let mut script_sig = push(&pubkey);
        script_sig.extend_from_slice(&push(&pubkey));
        script_sig.extend_from_slice(&push(&redeem));

        assert_eq!(
            verify_script(
                &script_sig,
                &script_pubkey,
                SCRIPT_VERIFY_P2SH,
                &MirrorChecker
            ),
            Ok(())
        );

        // Without the P2SH flag the outer script is an unsupported raw form.
        assert_eq!(
            verify_script(
                &script_sig,
                &script_pubkey,
                SCRIPT_VERIFY_NONE,
                &MirrorChecker
            ),
            Err(ScriptError::UnsupportedScript)
        );
    }

    #[test]
    fn multisig_matches_in_order() {
        let key_a = [0x0au8; 33];
        let key_b = [0x0bu8; 33];
        let mut script = vec![OP_1 + 1];
        script.extend_from_slice(&push(&key_a));
        script.extend_from_slice(&push(&key_b));
        script.push(OP_1 + 1);
        script.push(OP_CHECKMULTISIG);

        let mut ordered = vec![OP_0];
        ordered.extend_from_slice(&push(&key_a));
        ordered.extend_from_slice(&push(&key_b));
        assert_eq!(
            verify_script(&ordered, &script, SCRIPT_VERIFY_NONE, &MirrorChecker),
            Ok(())
        );

        // Out-of-order signatures fail, as OP_CHECKMULTISIG scans forward only.
        let mut reversed = vec![OP_0];
        reversed.extend_from_slice(&push(&key_b));
        reversed.extend_from_slice(&push(&key_a));
        assert_eq!(
            verify_script(&reversed, &script, SCRIPT_VERIFY_NONE, &MirrorChecker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn non_push_script_sig_rejected() {
        assert_eq!(
            verify_script(&[0xac], &[OP_1], SCRIPT_VERIFY_NONE, &MirrorChecker),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn cleanstack_rejects_extra_items() {
        let mut script_sig = push(&[1]);
        script_sig.push(OP_1);
        assert_eq!(
            verify_script(
                &script_sig,
                &[OP_1],
                SCRIPT_VERIFY_CLEANSTACK,
                &MirrorChecker
            ),
            Err(ScriptError::CleanStack)
        );
    }
}

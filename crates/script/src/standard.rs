//! Standard script classification and dust policy.

use coind_consensus::money::Amount;
use coind_primitives::transaction::TxOut;

use crate::{
    OP_1, OP_16, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160,
    OP_RETURN,
};

/// Bytes of payload allowed in a data-carrier output.
pub const MAX_OP_RETURN_RELAY: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
    NonStandard,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2sh(script) {
        ScriptType::ScriptHash
    } else if is_p2pk(script) {
        ScriptType::PubKey
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if is_bare_multisig(script) {
        ScriptType::Multisig
    } else {
        ScriptType::NonStandard
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };
    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

pub fn is_null_data(script: &[u8]) -> bool {
    if script.first() != Some(&OP_RETURN) {
        return false;
    }
    script.len() <= 1 + 2 + MAX_OP_RETURN_RELAY
}

fn is_bare_multisig(script: &[u8]) -> bool {
    // m <pubkey...> n OP_CHECKMULTISIG with 1 <= m <= n <= 3.
    if script.len() < 3 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return false;
    }
    let m_op = script[0];
    let n_op = script[script.len() - 2];
    if !(OP_1..=OP_16).contains(&m_op) || !(OP_1..=OP_16).contains(&n_op) {
        return false;
    }
    let m = m_op - OP_1 + 1;
    let n = n_op - OP_1 + 1;
    if m > n || n > 3 {
        return false;
    }

    let mut cursor = 1usize;
    let mut keys = 0u8;
    while cursor < script.len() - 2 {
        let len = script[cursor] as usize;
        if !(33..=65).contains(&len) {
            return false;
        }
        cursor += 1 + len;
        keys += 1;
    }
    cursor == script.len() - 2 && keys == n
}

/// An output is dust when spending it would cost more than a third of its
/// value at the given relay fee rate. The spend of a typical output adds 148
/// bytes of input data.
pub fn is_dust(output: &TxOut, min_relay_fee_per_kb: Amount) -> bool {
    if is_null_data(&output.script_pubkey) {
        return false;
    }
    let total_size = output_serialized_size(output) as i64 + 148;
    let fee_to_spend = min_relay_fee_per_kb.saturating_mul(total_size) / 1000;
    output.value < fee_to_spend.saturating_mul(3)
}

fn output_serialized_size(output: &TxOut) -> usize {
    let script_len = output.script_pubkey.len();
    let len_prefix = if script_len < 0xfd { 1 } else { 3 };
    8 + len_prefix + script_len
}

/// Whether a script sig consists only of data pushes of small integers and
/// byte arrays, as standardness requires.
pub fn is_push_only(script: &[u8]) -> bool {
    crate::verify::parse_pushes(script).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn classifies_common_templates() {
        assert_eq!(classify_script_pubkey(&p2pkh(1)), ScriptType::PubKeyHash);

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[0u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::ScriptHash);

        let mut p2pk = vec![33];
        p2pk.extend_from_slice(&[2u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify_script_pubkey(&p2pk), ScriptType::PubKey);

        assert_eq!(
            classify_script_pubkey(&[OP_RETURN, 4, 1, 2, 3, 4]),
            ScriptType::NullData
        );
        assert_eq!(classify_script_pubkey(&[0x51]), ScriptType::NonStandard);
    }

    #[test]
    fn bare_multisig_bounds() {
        let mut one_of_two = vec![OP_1];
        one_of_two.push(33);
        one_of_two.extend_from_slice(&[2u8; 33]);
        one_of_two.push(33);
        one_of_two.extend_from_slice(&[3u8; 33]);
        one_of_two.push(OP_1 + 1);
        one_of_two.push(OP_CHECKMULTISIG);
        assert_eq!(classify_script_pubkey(&one_of_two), ScriptType::Multisig);

        // 1-of-4 is over the standardness cap.
        let mut one_of_four = vec![OP_1];
        for tag in 0..4u8 {
            one_of_four.push(33);
            one_of_four.extend_from_slice(&[tag; 33]);
        }
        one_of_four.push(OP_1 + 3);
        one_of_four.push(OP_CHECKMULTISIG);
        assert_eq!(
            classify_script_pubkey(&one_of_four),
            ScriptType::NonStandard
        );
    }

    #[test]
    fn dust_threshold() {
        let output = TxOut {
            value: 546,
            script_pubkey: p2pkh(0),
        };
        assert!(!is_dust(&output, 1_000));
        let dusty = TxOut {
            value: 545,
            script_pubkey: p2pkh(0),
        };
        assert!(is_dust(&dusty, 1_000));
    }

    #[test]
    fn null_data_is_never_dust() {
        let output = TxOut {
            value: 0,
            script_pubkey: vec![OP_RETURN, 1, 0xaa],
        };
        assert!(!is_dust(&output, 1_000));
    }
}

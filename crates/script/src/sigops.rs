//! Signature-operation counting.

use crate::{
    OP_1, OP_16, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY,
    OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4,
};

const MAX_PUBKEYS_PER_MULTISIG: u64 = 20;

/// Counts sigops in a script the way the legacy rule does. With
/// `accurate` set, an OP_CHECKMULTISIG preceded by a small-integer push
/// counts as that many keys instead of the worst-case twenty.
pub fn legacy_sigops(script: &[u8], accurate: bool) -> u64 {
    let mut count = 0u64;
    let mut cursor = 0usize;
    let mut last_opcode: Option<u8> = None;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op) if accurate && (OP_1..=OP_16).contains(&op) => {
                        (op - OP_1 + 1) as u64
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            0x01..=0x4b => {
                cursor = match cursor.checked_add(opcode as usize) {
                    Some(next) if next <= script.len() => next,
                    _ => break,
                };
            }
            OP_PUSHDATA1 => {
                if cursor >= script.len() {
                    break;
                }
                let len = script[cursor] as usize;
                cursor += 1;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            _ => {}
        }
        last_opcode = Some(opcode);
    }
    count
}

/// Sigops contributed by a pay-to-script-hash spend: the accurate count over
/// the redeem script carried as the signature script's final push. Zero for
/// non-P2SH outputs or malformed signature scripts.
pub fn p2sh_sigops(script_pubkey: &[u8], script_sig: &[u8]) -> u64 {
    if !crate::standard::is_p2sh(script_pubkey) {
        return 0;
    }
    let Some(pushes) = crate::verify::parse_pushes(script_sig) else {
        return 0;
    };
    let Some(redeem_script) = pushes.last() else {
        return 0;
    };
    legacy_sigops(redeem_script, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160};

    fn p2pkh_script() -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[0u8; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn checksig_counts_one() {
        assert_eq!(legacy_sigops(&p2pkh_script(), false), 1);
    }

    #[test]
    fn multisig_worst_case_without_accurate() {
        let script = vec![OP_1 + 1, OP_CHECKMULTISIG];
        assert_eq!(legacy_sigops(&script, false), 20);
        assert_eq!(legacy_sigops(&script, true), 2);
    }

    #[test]
    fn truncated_push_stops_walk() {
        // A push length running past the end must not loop or count garbage.
        let script = vec![0x4b, OP_CHECKSIG];
        assert_eq!(legacy_sigops(&script, false), 0);
    }

    #[test]
    fn p2sh_counts_redeem_script() {
        let redeem = vec![OP_1 + 1, OP_CHECKMULTISIG];
        let mut script_sig = vec![redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);

        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[0u8; 20]);
        script_pubkey.push(OP_EQUAL);

        assert_eq!(p2sh_sigops(&script_pubkey, &script_sig), 2);
        assert_eq!(p2sh_sigops(&p2pkh_script(), &script_sig), 0);
    }
}

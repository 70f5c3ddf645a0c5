//! Script policy, sigop accounting, signature hashing, and the
//! signature-verification seam consumed by block and mempool validation.

pub mod sighash;
pub mod sigops;
pub mod standard;
pub mod verify;

mod secp;

pub use sighash::{signature_hash, PrecomputedTransactionData, SighashError, SighashType};
pub use sigops::{legacy_sigops, p2sh_sigops};
pub use standard::{classify_script_pubkey, is_dust, ScriptType};
pub use verify::{
    verify_script, ScriptError, SignatureChecker, TransactionSignatureChecker,
};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
/// Evaluate pay-to-script-hash subscripts.
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
/// Enforce strict DER encoding and defined hash types for signatures.
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
/// Enforce low-S signatures.
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
/// Signature scripts may contain only data pushes.
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
/// Require minimal push encodings.
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
/// Require a clean stack after evaluation.
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
/// Enforce OP_CHECKLOCKTIMEVERIFY.
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
/// Enforce OP_CHECKSEQUENCEVERIFY.
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;

/// Flags every block must satisfy regardless of policy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;

/// Flags applied to transactions entering the memory pool.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_SIGPUSHONLY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;

pub(crate) const OP_0: u8 = 0x00;
pub(crate) const OP_PUSHDATA1: u8 = 0x4c;
pub(crate) const OP_PUSHDATA2: u8 = 0x4d;
pub(crate) const OP_PUSHDATA4: u8 = 0x4e;
pub(crate) const OP_1NEGATE: u8 = 0x4f;
pub(crate) const OP_1: u8 = 0x51;
pub(crate) const OP_16: u8 = 0x60;
pub(crate) const OP_RETURN: u8 = 0x6a;
pub(crate) const OP_DUP: u8 = 0x76;
pub(crate) const OP_EQUAL: u8 = 0x87;
pub(crate) const OP_EQUALVERIFY: u8 = 0x88;
pub(crate) const OP_HASH160: u8 = 0xa9;
pub(crate) const OP_CHECKSIG: u8 = 0xac;
pub(crate) const OP_CHECKSIGVERIFY: u8 = 0xad;
pub(crate) const OP_CHECKMULTISIG: u8 = 0xae;
pub(crate) const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

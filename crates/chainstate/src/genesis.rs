//! Genesis block construction.

use coind_consensus::money::COIN;
use coind_consensus::params::Network;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::{Transaction, TxIn, TxOut};

const GENESIS_COINBASE_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_OUTPUT_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1\
f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

fn bytes_from_hex(hex: &str) -> Vec<u8> {
    fn digit(byte: u8) -> u8 {
        match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            _ => byte - b'A' + 10,
        }
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| (digit(pair[0]) << 4) | digit(pair[1]))
        .collect()
}

fn genesis_coinbase() -> Transaction {
    // The original coinbase script: difficulty bits, the constant 4, and the
    // newspaper headline.
    let mut script_sig = bytes_from_hex("04ffff001d0104");
    script_sig.push(GENESIS_COINBASE_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_COINBASE_MESSAGE);

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(65);
    script_pubkey.extend_from_slice(&bytes_from_hex(GENESIS_OUTPUT_PUBKEY));
    script_pubkey.push(0xac);

    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn genesis_block(network: Network) -> Block {
    let coinbase = genesis_coinbase();
    let merkle_root = coinbase.txid();
    let (time, bits, nonce) = match network {
        Network::Mainnet => (1_231_006_505, 0x1d00_ffff, 2_083_236_893),
        Network::Testnet => (1_296_688_602, 0x1d00_ffff, 414_098_458),
        Network::Regtest => (1_296_688_602, 0x207f_ffff, 2),
    };
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root,
            time,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
    }
}

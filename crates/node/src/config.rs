//! Command-line configuration for the validation core.

use std::path::PathBuf;

use coind_consensus::{hash256_from_hex, Hash256, Network};

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub data_dir: Option<PathBuf>,
    /// UTXO cache budget, MiB.
    pub dbcache_mb: u64,
    /// Script verification threads; 0 runs checks inline.
    pub par: usize,
    /// Prune target, MiB; 0 keeps everything.
    pub prune_mb: u64,
    /// Mempool budget, MiB.
    pub maxmempool_mb: u64,
    /// Mempool expiry, hours.
    pub mempool_expiry_hours: u64,
    pub limit_ancestor_count: u64,
    pub limit_ancestor_size_kb: u64,
    pub limit_descendant_count: u64,
    pub limit_descendant_size_kb: u64,
    /// Free-relay allowance, kB per minute.
    pub limit_free_relay_kb: u64,
    /// Minimum relay fee, base units per kB.
    pub min_relay_tx_fee: i64,
    pub tx_index: bool,
    pub reindex: bool,
    /// Explicit assumed-valid hash; `None` uses the network default, the
    /// zero hash disables the optimization.
    pub assume_valid: Option<Hash256>,
    pub checkpoints: bool,
    /// Blocks replayed by the startup verification pass.
    pub check_blocks: i32,
    pub check_level: u32,
    pub log_level: coind_log::Level,
    pub log_format: coind_log::Format,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: None,
            dbcache_mb: 450,
            par: 0,
            prune_mb: 0,
            maxmempool_mb: 300,
            mempool_expiry_hours: 336,
            limit_ancestor_count: 25,
            limit_ancestor_size_kb: 101,
            limit_descendant_count: 25,
            limit_descendant_size_kb: 101,
            limit_free_relay_kb: 0,
            min_relay_tx_fee: 1_000,
            tx_index: false,
            reindex: false,
            assume_valid: None,
            checkpoints: true,
            check_blocks: 6,
            check_level: 3,
            log_level: coind_log::Level::Info,
            log_format: coind_log::Format::Text,
        }
    }
}

pub fn usage() -> &'static str {
    "usage: coind [options]\n\
     \n\
     --network <mainnet|testnet|regtest>  chain to validate (default mainnet)\n\
     --data-dir <path>                    block files and database location\n\
     --dbcache <mib>                      UTXO cache budget (default 450)\n\
     --par <n>                            script verification threads (default 0 = inline)\n\
     --prune <mib>                        delete old block files beyond this target (0 = keep all)\n\
     --maxmempool <mib>                   mempool budget (default 300)\n\
     --mempoolexpiry <hours>              drop pool entries older than this (default 336)\n\
     --limitancestorcount <n>             in-pool ancestor limit (default 25)\n\
     --limitancestorsize <kb>             in-pool ancestor size limit (default 101)\n\
     --limitdescendantcount <n>           in-pool descendant limit (default 25)\n\
     --limitdescendantsize <kb>           in-pool descendant size limit (default 101)\n\
     --limitfreerelay <kb/min>            below-fee relay allowance (default 0)\n\
     --minrelaytxfee <units/kb>           relay fee floor (default 1000)\n\
     --txindex                            maintain a txid lookup index\n\
     --reindex                            rebuild the database from block files\n\
     --assumevalid <hash|0>               skip signature checks below this block\n\
     --nocheckpoints                      ignore built-in checkpoints\n\
     --checkblocks <n>                    blocks verified at startup (default 6)\n\
     --checklevel <0-4>                   thoroughness of startup verification (default 3)\n\
     --log-level <error|warn|info|debug|trace>\n\
     --log-format <text|json>\n"
}

pub fn parse_args<I>(raw_args: I) -> Result<Config, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = raw_args.into_iter();

    fn value_for(args: &mut impl Iterator<Item = String>, key: &str) -> Result<String, String> {
        args.next()
            .ok_or_else(|| format!("missing value for {key}\n{}", usage()))
    }

    fn numeric<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, String> {
        value
            .parse()
            .map_err(|_| format!("invalid value '{value}' for {key}\n{}", usage()))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = value_for(&mut args, "--network")?;
                config.network = match value.as_str() {
                    "mainnet" => Network::Mainnet,
                    "testnet" => Network::Testnet,
                    "regtest" => Network::Regtest,
                    _ => return Err(format!("unknown network '{value}'\n{}", usage())),
                };
            }
            "--data-dir" => {
                config.data_dir = Some(PathBuf::from(value_for(&mut args, "--data-dir")?));
            }
            "--dbcache" => {
                config.dbcache_mb = numeric(&value_for(&mut args, "--dbcache")?, "--dbcache")?;
            }
            "--par" => {
                config.par = numeric(&value_for(&mut args, "--par")?, "--par")?;
            }
            "--prune" => {
                config.prune_mb = numeric(&value_for(&mut args, "--prune")?, "--prune")?;
            }
            "--maxmempool" => {
                config.maxmempool_mb =
                    numeric(&value_for(&mut args, "--maxmempool")?, "--maxmempool")?;
            }
            "--mempoolexpiry" => {
                config.mempool_expiry_hours =
                    numeric(&value_for(&mut args, "--mempoolexpiry")?, "--mempoolexpiry")?;
            }
            "--limitancestorcount" => {
                config.limit_ancestor_count = numeric(
                    &value_for(&mut args, "--limitancestorcount")?,
                    "--limitancestorcount",
                )?;
            }
            "--limitancestorsize" => {
                config.limit_ancestor_size_kb = numeric(
                    &value_for(&mut args, "--limitancestorsize")?,
                    "--limitancestorsize",
                )?;
            }
            "--limitdescendantcount" => {
                config.limit_descendant_count = numeric(
                    &value_for(&mut args, "--limitdescendantcount")?,
                    "--limitdescendantcount",
                )?;
            }
            "--limitdescendantsize" => {
                config.limit_descendant_size_kb = numeric(
                    &value_for(&mut args, "--limitdescendantsize")?,
                    "--limitdescendantsize",
                )?;
            }
            "--limitfreerelay" => {
                config.limit_free_relay_kb =
                    numeric(&value_for(&mut args, "--limitfreerelay")?, "--limitfreerelay")?;
            }
            "--minrelaytxfee" => {
                config.min_relay_tx_fee =
                    numeric(&value_for(&mut args, "--minrelaytxfee")?, "--minrelaytxfee")?;
            }
            "--txindex" => config.tx_index = true,
            "--reindex" => config.reindex = true,
            "--assumevalid" => {
                let value = value_for(&mut args, "--assumevalid")?;
                if value == "0" {
                    config.assume_valid = Some([0u8; 32]);
                } else {
                    config.assume_valid = Some(
                        hash256_from_hex(&value)
                            .map_err(|_| format!("invalid hash for --assumevalid\n{}", usage()))?,
                    );
                }
            }
            "--nocheckpoints" => config.checkpoints = false,
            "--checkblocks" => {
                config.check_blocks =
                    numeric(&value_for(&mut args, "--checkblocks")?, "--checkblocks")?;
            }
            "--checklevel" => {
                let level: u32 = numeric(&value_for(&mut args, "--checklevel")?, "--checklevel")?;
                if level > 4 {
                    return Err(format!("--checklevel must be 0..=4\n{}", usage()));
                }
                config.check_level = level;
            }
            "--log-level" => {
                let value = value_for(&mut args, "--log-level")?;
                config.log_level = coind_log::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" => {
                let value = value_for(&mut args, "--log-format")?;
                config.log_format = coind_log::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--help" | "help" => return Err(usage().to_string()),
            other => return Err(format!("unknown option '{other}'\n{}", usage())),
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, String> {
        parse_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_without_args() {
        let config = parse(&[]).expect("defaults");
        assert_eq!(config.dbcache_mb, 450);
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.checkpoints);
    }

    #[test]
    fn parses_resource_knobs() {
        let config = parse(&[
            "--network",
            "regtest",
            "--dbcache",
            "64",
            "--par",
            "4",
            "--prune",
            "550",
            "--maxmempool",
            "50",
            "--txindex",
        ])
        .expect("config");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.dbcache_mb, 64);
        assert_eq!(config.par, 4);
        assert_eq!(config.prune_mb, 550);
        assert_eq!(config.maxmempool_mb, 50);
        assert!(config.tx_index);
    }

    #[test]
    fn assumevalid_zero_disables() {
        let config = parse(&["--assumevalid", "0"]).expect("config");
        assert_eq!(config.assume_valid, Some([0u8; 32]));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--dbcache"]).is_err());
        assert!(parse(&["--dbcache", "lots"]).is_err());
        assert!(parse(&["--checklevel", "9"]).is_err());
    }
}

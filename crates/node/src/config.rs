use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ledgerd_chainstate::{ChainConfig, IndexConfig};
use ledgerd_consensus::params::{chain_params, Network};
use ledgerd_log as logging;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "ledgerd.conf";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;
const DEFAULT_DB_CACHE_MB: u64 = 256;
const DEFAULT_ORPHAN_LIMIT: usize = 750;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

/// How the process is supervised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostMode {
    Standalone,
    Service,
}

impl HostMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "standalone" => Some(Self::Standalone),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub log_file: Option<PathBuf>,
    pub tx_index: bool,
    pub address_index: bool,
    pub drop_tx_index: bool,
    pub drop_address_index: bool,
    pub check_scripts: bool,
    pub import_paths: Vec<PathBuf>,
    pub stop_after_import: bool,
    pub status_interval_secs: u64,
    pub host: HostMode,
    pub db_cache_mb: u64,
    pub db_fsync_ms: Option<u16>,
    pub orphan_limit: usize,
}

impl Config {
    /// `<data_dir>/<network>/`.
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join(chain_params(self.network).data_subdir)
    }

    pub fn drop_requested(&self) -> bool {
        self.drop_tx_index || self.drop_address_index
    }

    pub fn chain_config(&self) -> ChainConfig {
        let mut chain = ChainConfig::new(chain_params(self.network)).with_indexes(IndexConfig {
            tx_index: self.tx_index,
            address_index: self.address_index,
        });
        chain.check_scripts = self.check_scripts;
        chain.orphan_limit = self.orphan_limit;
        chain
    }
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_number<T: FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value '{raw}' for {flag}"))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut log_file: Option<PathBuf> = None;
    let mut tx_index = false;
    let mut tx_index_set = false;
    let mut address_index = false;
    let mut address_index_set = false;
    let mut drop_tx_index = false;
    let mut drop_address_index = false;
    let mut check_scripts = true;
    let mut check_scripts_set = false;
    let mut import_paths: Vec<PathBuf> = Vec::new();
    let mut stop_after_import = false;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut status_interval_set = false;
    let mut host = HostMode::Standalone;
    let mut host_set = false;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut db_cache_set = false;
    let mut db_fsync_ms: Option<u16> = None;
    let mut orphan_limit = DEFAULT_ORPHAN_LIMIT;
    let mut orphan_limit_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            "drop-address-index" => {
                drop_address_index = true;
                let _ = args.next();
            }
            "drop-tx-index" => {
                drop_tx_index = true;
                let _ = args.next();
            }
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--log-file" => {
                log_file = Some(PathBuf::from(next_value(&mut args, "--log-file")?));
            }
            "--txindex" => {
                tx_index = true;
                tx_index_set = true;
            }
            "--no-txindex" => {
                tx_index = false;
                tx_index_set = true;
            }
            "--addressindex" => {
                address_index = true;
                address_index_set = true;
            }
            "--no-addressindex" => {
                address_index = false;
                address_index_set = true;
            }
            "--drop-tx-index" => drop_tx_index = true,
            "--drop-address-index" => drop_address_index = true,
            "--skip-script" => {
                check_scripts = false;
                check_scripts_set = true;
            }
            "--import" => {
                import_paths.push(PathBuf::from(next_value(&mut args, "--import")?));
            }
            "--stop-after-import" => stop_after_import = true,
            "--status-interval" => {
                let value = next_value(&mut args, "--status-interval")?;
                status_interval_secs = parse_number("--status-interval", &value)?;
                status_interval_set = true;
            }
            "--host" => {
                let value = next_value(&mut args, "--host")?;
                host = HostMode::parse(&value)
                    .ok_or_else(|| format!("invalid host mode '{value}'\n{}", usage()))?;
                host_set = true;
            }
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = parse_number("--db-cache-mb", &value)?;
                db_cache_set = true;
            }
            "--db-fsync-ms" => {
                let value = next_value(&mut args, "--db-fsync-ms")?;
                let ms: u16 = parse_number("--db-fsync-ms", &value)?;
                db_fsync_ms = (ms > 0).then_some(ms);
            }
            "--orphan-limit" => {
                let value = next_value(&mut args, "--orphan-limit")?;
                orphan_limit = parse_number("--orphan-limit", &value)?;
                orphan_limit_set = true;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let last = |key: &str| conf.get(key).and_then(|values| values.last());
        let invalid = |key: &str, raw: &str| {
            format!("invalid {key} value '{raw}' in {}", conf_file.display())
        };
        let conf_bool = |key: &str| -> Result<Option<bool>, String> {
            match last(key) {
                Some(raw) => parse_conf_bool(raw).map(Some).ok_or_else(|| invalid(key, raw)),
                None => Ok(None),
            }
        };

        if !network_set {
            if let Some(raw) = last("network") {
                network = Network::parse(raw).ok_or_else(|| invalid("network", raw))?;
            } else if conf_bool("regtest")? == Some(true) {
                network = Network::Regtest;
            } else if conf_bool("testnet")? == Some(true) {
                network = Network::Testnet;
            }
        }
        if !backend_set {
            if let Some(raw) = last("backend") {
                backend = Backend::parse(raw).ok_or_else(|| invalid("backend", raw))?;
            }
        }
        if !log_level_set {
            if let Some(raw) = last("loglevel") {
                log_level = logging::Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
            }
        }
        if !log_format_set {
            if let Some(raw) = last("logformat") {
                log_format =
                    logging::Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
            }
        }
        if !log_timestamps_set {
            if let Some(value) = conf_bool("logtimestamps")? {
                log_timestamps = value;
            }
        }
        if log_file.is_none() {
            log_file = last("logfile").map(PathBuf::from);
        }
        if !tx_index_set {
            if let Some(value) = conf_bool("txindex")? {
                tx_index = value;
            }
        }
        if !address_index_set {
            if let Some(value) = conf_bool("addressindex")? {
                address_index = value;
            }
        }
        if !check_scripts_set {
            if let Some(value) = conf_bool("checkscripts")? {
                check_scripts = value;
            }
        }
        if let Some(values) = conf.get("import") {
            import_paths.extend(values.iter().map(PathBuf::from));
        }
        if !status_interval_set {
            if let Some(raw) = last("statusinterval") {
                status_interval_secs = parse_number("statusinterval", raw)?;
            }
        }
        if !host_set {
            if let Some(raw) = last("host") {
                host = HostMode::parse(raw).ok_or_else(|| invalid("host", raw))?;
            }
        }
        if !db_cache_set {
            if let Some(raw) = last("dbcache") {
                db_cache_mb = parse_number("dbcache", raw)?;
            }
        }
        if db_fsync_ms.is_none() {
            if let Some(raw) = last("dbfsyncms") {
                let ms: u16 = parse_number("dbfsyncms", raw)?;
                db_fsync_ms = (ms > 0).then_some(ms);
            }
        }
        if !orphan_limit_set {
            if let Some(raw) = last("orphanlimit") {
                orphan_limit = parse_number("orphanlimit", raw)?;
            }
        }
    }

    if host == HostMode::Service && !log_timestamps_set {
        log_timestamps = false;
    }

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        log_level,
        log_format,
        log_timestamps,
        log_file,
        tx_index,
        address_index,
        drop_tx_index,
        drop_address_index,
        check_scripts,
        import_paths,
        stop_after_import,
        status_interval_secs,
        host,
        db_cache_mb,
        db_fsync_ms,
        orphan_limit,
    }))
}

/// `key=value` lines; `#` and `;` start comments and a bare key means `1`.
fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  ledgerd [options]",
        "  ledgerd <command> [options]",
        "",
        "Commands:",
        "  help                Print this help and exit",
        "  version             Print version and exit",
        "  drop-address-index  Alias for --drop-address-index",
        "  drop-tx-index       Alias for --drop-tx-index",
        "",
        "Options:",
        "  --backend  Storage backend (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/ledgerd.conf)",
        "  --network  Network profile (mainnet|testnet|regtest) (default: mainnet)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on, off for --host service)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --log-file  Also append log lines to this file",
        "  --txindex, --no-txindex  Maintain the transaction index (default: off)",
        "  --addressindex, --no-addressindex  Maintain the address index; requires --txindex (default: off)",
        "  --drop-address-index  Remove the address index, then exit",
        "  --drop-tx-index  Remove the transaction index, then exit",
        "  --skip-script  Disable script checks (testing only)",
        "  --import  Import framed blocks from a file (repeatable)",
        "  --stop-after-import  Exit once every --import file is processed",
        "  --status-interval  Status log interval in seconds (default: 15, 0 disables)",
        "  --host  Process host (standalone|service) (default: standalone)",
        "  --db-cache-mb  Fjall block cache size in MiB (default: 256)",
        "  --db-fsync-ms  Fjall async fsync interval in ms (0 disables)",
        "  --orphan-limit  Blocks held while waiting for their parent (default: 750)",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse args") {
            CliAction::Run(config) => config,
            _ => panic!("expected a run configuration"),
        }
    }

    #[test]
    fn flags_override_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\nregtest=1\ntxindex=1\naddressindex=0 ; comment\nloglevel=debug\n\
             import=a.dat\nimport=b.dat\nbackend=memory\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().into_owned();

        let config = run_config(&[
            "--data-dir",
            &data_dir,
            "--addressindex",
            "--log-level",
            "warn",
            "--import",
            "c.dat",
        ]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert!(config.tx_index);
        assert!(config.address_index);
        assert_eq!(config.log_level, logging::Level::Warn);
        assert_eq!(
            config.import_paths,
            vec![
                PathBuf::from("c.dat"),
                PathBuf::from("a.dat"),
                PathBuf::from("b.dat")
            ]
        );
        assert_eq!(config.network_dir(), dir.path().join("regtest"));
    }

    #[test]
    fn drop_commands_and_service_host() {
        let config = run_config(&[
            "drop-address-index",
            "--drop-tx-index",
            "--host",
            "service",
            "--conf",
            "/nonexistent/ledgerd.conf",
        ]);
        assert!(config.drop_address_index);
        assert!(config.drop_tx_index);
        assert!(config.drop_requested());
        assert_eq!(config.host, HostMode::Service);
        assert!(!config.log_timestamps);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_args_from(args(&["--backend", "rocks"])).is_err());
        assert!(parse_args_from(args(&["--status-interval", "soon"])).is_err());
        assert!(parse_args_from(args(&["--bogus"])).is_err());
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
    }

    #[test]
    fn invalid_conf_bool_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("custom.conf");
        fs::write(&conf, "txindex=maybe\n").expect("write conf");
        let conf = conf.to_string_lossy().into_owned();
        let err = match parse_args_from(args(&["--conf", &conf])) {
            Err(err) => err,
            Ok(_) => panic!("accepted invalid boolean"),
        };
        assert!(err.contains("txindex"));
    }
}

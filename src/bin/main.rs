//! multisig-vault CLI - drive a secure account from the shell
//!
//!   multisig-vault address                 → next receiving address
//!   multisig-vault receive-uri --amount N  → BIP21 URI for the receiving address
//!   multisig-vault decode-uri <uri>        → decoded payment request
//!   multisig-vault setup-2fa               → TOTP secret + otpauth:// URI
//!   multisig-vault sync [--hard]           → refresh balances and transactions
//!
//! Keys come from flags or MULTISIG_VAULT_* environment variables (a `.env` file
//! is honoured). With `--snapshot <file>` account state is restored from and
//! written back to that file.

use anyhow::{anyhow, bail, Context};
use multisig_vault::logging::{init_logging, LogConfig};
use multisig_vault::{
    AccountConfig, AccountSnapshot, ChainEndpoints, CoSigner, HttpChainClient, HttpCoSigner, Network, Response,
    SecureAccount, SyncMode,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

fn main() {
    init_logging(&LogConfig::from_env());

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("multisig-vault {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(run(&opts)),
        Err(e) => Err(anyhow!("Failed to create runtime: {}", e)),
    };

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({"error": format!("{:#}", e)}), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

async fn run(opts: &ParsedArgs) -> anyhow::Result<Value> {
    match opts.command.as_deref() {
        Some("address") => cmd_address(opts).await,
        Some("receive-uri") => cmd_receive_uri(opts).await,
        Some("decode-uri") => cmd_decode_uri(opts),
        Some("setup-2fa") => cmd_setup_two_factor(opts).await,
        Some("sync") => cmd_sync(opts).await,
        Some(cmd) => bail!("Unknown command: {}", cmd),
        None => {
            print_usage();
            Ok(Value::Null)
        }
    }
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    argument: Option<String>,
    mnemonic: Option<String>,
    secondary: Option<String>,
    backend_xpub: Option<String>,
    network: Option<String>,
    indexer_url: Option<String>,
    broadcast_url: Option<String>,
    cosigner_url: Option<String>,
    snapshot: Option<PathBuf>,
    amount: Option<u64>,
    label: Option<String>,
    message: Option<String>,
    hard: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    if !value.is_empty() && env::var(key.trim()).is_err() {
                        env::set_var(key.trim(), value);
                    }
                }
            }
        }

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let value = args.get(i + 1).cloned();
            let mut takes_value = true;
            match arg.as_str() {
                "--help" | "-h" => { opts.help = true; takes_value = false; }
                "--version" | "-V" => { opts.version = true; takes_value = false; }
                "--pretty" => { opts.pretty = true; takes_value = false; }
                "--hard" => { opts.hard = true; takes_value = false; }
                "--mnemonic" | "-m" => opts.mnemonic = value,
                "--secondary" => opts.secondary = value,
                "--backend-xpub" => opts.backend_xpub = value,
                "--network" | "-n" => opts.network = value,
                "--indexer" => opts.indexer_url = value,
                "--broadcast" => opts.broadcast_url = value,
                "--cosigner" => opts.cosigner_url = value,
                "--snapshot" | "-s" => opts.snapshot = value.map(PathBuf::from),
                "--amount" => opts.amount = value.and_then(|v| v.parse().ok()),
                "--label" => opts.label = value,
                "--message" => opts.message = value,
                _ if !arg.starts_with('-') => {
                    positional.push(arg.clone());
                    takes_value = false;
                }
                _ => takes_value = false,
            }
            i += if takes_value { 2 } else { 1 };
        }

        let mut positional = positional.into_iter();
        opts.command = positional.next();
        opts.argument = positional.next();

        let from_env = |key: &str| env::var(key).ok().filter(|s| !s.is_empty());
        opts.mnemonic = opts.mnemonic.take().or_else(|| from_env("MULTISIG_VAULT_MNEMONIC"));
        opts.secondary = opts.secondary.take().or_else(|| from_env("MULTISIG_VAULT_SECONDARY"));
        opts.backend_xpub = opts.backend_xpub.take().or_else(|| from_env("MULTISIG_VAULT_BACKEND_XPUB"));
        opts.network = opts.network.take().or_else(|| from_env("MULTISIG_VAULT_NETWORK"));
        opts.indexer_url = opts.indexer_url.take().or_else(|| from_env("MULTISIG_VAULT_INDEXER"));
        opts.broadcast_url = opts.broadcast_url.take().or_else(|| from_env("MULTISIG_VAULT_BROADCAST"));
        opts.cosigner_url = opts.cosigner_url.take().or_else(|| from_env("MULTISIG_VAULT_COSIGNER"));
        opts.snapshot = opts.snapshot.take().or_else(|| from_env("MULTISIG_VAULT_SNAPSHOT").map(PathBuf::from));
        opts
    }

    fn network(&self) -> anyhow::Result<Network> {
        let raw = self.network.as_deref().unwrap_or("testnet");
        Network::from_str(raw).ok_or_else(|| anyhow!("Invalid network: {}", raw))
    }
}

fn print_usage() {
    println!(
        r#"multisig-vault - two-factor 2-of-3 multisig account

USAGE:
    multisig-vault <command> [argument] [options]

COMMANDS:
    address                 Next receiving address
    receive-uri             BIP21 URI for the receiving address
    decode-uri <uri>        Decode a bitcoin: URI
    setup-2fa               Start two-factor enrollment
    sync                    Refresh balances and transactions

KEY OPTIONS:
    --mnemonic, -m <words>  Primary mnemonic (env: MULTISIG_VAULT_MNEMONIC)
    --secondary <words>     Secondary mnemonic (env: MULTISIG_VAULT_SECONDARY)
    --backend-xpub <xpub>   Co-signer xpub (env: MULTISIG_VAULT_BACKEND_XPUB)
    --network, -n <net>     bitcoin|testnet|signet|regtest (default: testnet)
    --snapshot, -s <file>   Restore from / save to account snapshot

SERVICE OPTIONS:
    --indexer <url>         Multi-address indexer (env: MULTISIG_VAULT_INDEXER)
    --broadcast <url>       Raw transaction broadcast (env: MULTISIG_VAULT_BROADCAST)
    --cosigner <url>        Co-signing service (env: MULTISIG_VAULT_COSIGNER)

COMMAND OPTIONS:
    --amount <sats>         receive-uri amount
    --label <text>          receive-uri label
    --message <text>        receive-uri message
    --hard                  sync: rescan every address from index 0

OUTPUT OPTIONS:
    --pretty                Pretty-print JSON (default for tty)
    --version, -V           Print version

LOGGING (stderr):
    MULTISIG_VAULT_LOG      Filter directive (default: multisig_vault=info,warn)
    MULTISIG_VAULT_LOG_JSON 1 for JSON lines

EXAMPLES:
    multisig-vault address -m "abandon ... about" --secondary "..." --backend-xpub tpub...
    multisig-vault receive-uri --amount 150000 --label "Invoice 7"
    multisig-vault sync --snapshot vault.json --indexer https://indexer.example/multi
"#
    );
}

fn endpoints(opts: &ParsedArgs) -> ChainEndpoints {
    let indexer = opts.indexer_url.clone().unwrap_or_default();
    let broadcast = opts.broadcast_url.clone().unwrap_or_else(|| indexer.clone());
    let endpoints = ChainEndpoints::new(indexer, broadcast);
    match &opts.cosigner_url {
        Some(url) => endpoints.with_cosigner(url.clone()),
        None => endpoints,
    }
}

fn open_account(opts: &ParsedArgs) -> anyhow::Result<SecureAccount> {
    let network = opts.network()?;
    let config = AccountConfig::new(network);
    let mnemonic = opts.mnemonic.as_deref().context("--mnemonic <words> is required")?;

    let endpoints = endpoints(opts);
    let chain = Arc::new(HttpChainClient::new(endpoints.clone())?);
    let cosigner: Arc<dyn CoSigner> =
        Arc::new(HttpCoSigner::new(endpoints.cosigner_url.clone().unwrap_or_default(), endpoints.timeout)?);

    if let Some(path) = opts.snapshot.as_ref().filter(|p| p.exists()) {
        debug!(path = %path.display(), "restoring from snapshot");
        let snapshot = AccountSnapshot::read_from(path)?;
        return Ok(SecureAccount::restore(config, mnemonic, opts.secondary.as_deref(), snapshot, chain, cosigner)?);
    }

    let secondary = opts.secondary.as_deref().context("--secondary <words> is required without a snapshot")?;
    let backend = opts.backend_xpub.as_deref().context("--backend-xpub <xpub> is required without a snapshot")?;
    Ok(SecureAccount::create(config, mnemonic, Some(secondary), chain, cosigner)?.with_backend_xpub(backend)?)
}

async fn save_snapshot(opts: &ParsedArgs, account: &SecureAccount) -> anyhow::Result<()> {
    if let Some(path) = &opts.snapshot {
        account.snapshot().await.write_to(path)?;
        debug!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

fn output<T: Serialize>(response: Response<T>) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(response)?)
}

async fn cmd_address(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let account = open_account(opts)?;
    output(account.receiving_address().await)
}

async fn cmd_receive_uri(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let account = open_account(opts)?;
    output(account.payment_uri(opts.amount, opts.label.as_deref(), opts.message.as_deref()).await)
}

fn cmd_decode_uri(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let uri = opts.argument.as_deref().context("URI required: multisig-vault decode-uri <uri>")?;
    let network = opts.network()?;
    let response = match multisig_vault::uri::decode(uri) {
        Ok(request) if multisig_vault::uri::is_valid_address(&request.address, network) => Response::ok(request),
        Ok(request) => Response::fail(multisig_vault::uri::UriError::InvalidAddress(request.address).into()),
        Err(e) => Response::fail(e.into()),
    };
    output(response)
}

async fn cmd_setup_two_factor(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let account = open_account(opts)?;
    let response = account.setup_two_factor().await;
    if response.is_ok() {
        save_snapshot(opts, &account).await?;
    }
    output(response)
}

async fn cmd_sync(opts: &ParsedArgs) -> anyhow::Result<Value> {
    if opts.indexer_url.is_none() {
        bail!("--indexer <url> is required for sync");
    }
    let account = open_account(opts)?;
    let mode = if opts.hard { SyncMode::Hard } else { SyncMode::Soft };
    let response = account.sync_balances(mode).await;
    if response.is_ok() {
        save_snapshot(opts, &account).await?;
    }
    let balances = account.balances(Default::default()).await;
    Ok(json!({
        "sync": output(response)?,
        "balances": output(balances)?,
    }))
}

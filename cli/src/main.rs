use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use nfcard::nfc::ConnectMode;
use nfcard::pcsc::{Context, PcscTransport};
use nfcard::{Card, CardOptions, Credential, Key, KeyType, Padding, SectorDiscovery, DEFAULT_KEYS};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Error occurred on communicating with the reader: {0}")]
    Reader(#[from] nfcard::pcsc::Error),

    #[error("The card returned an error: {0}")]
    Card(#[from] nfcard::Error),

    #[error("Could not access the file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not serialize the output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid hex data: {0}")]
    Hex(#[from] hex::FromHexError),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(name = "nfcard")]
#[command(about = "Read, write and recover keys of Mifare Classic cards through a PC/SC reader")]
#[command(version)]
struct Args {
    /// Name of the reader to use; the first one by default
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// Use the authenticate command of PC/SC 2.01
    #[arg(long, global = true)]
    legacy_auth: bool,

    /// Connect to the reader directly, without a card in the field
    #[arg(long, global = true)]
    direct: bool,

    /// Log every exchange with the card
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Key to authenticate with, as 12 hex digits
    #[arg(short, long)]
    key: Option<Key>,

    /// Key type the key is used as (A or B)
    #[arg(short = 't', long, default_value = "A")]
    key_type: KeyType,

    /// Try the default keys of the card vendors first
    #[arg(long)]
    default_keys: bool,
}

impl KeyArgs {
    fn credential(&self) -> Credential {
        self.key.map(|k| (self.key_type, k))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Lists the readers known to the PC/SC service
    Readers,

    /// Prints the UID of the card
    Uid,

    /// Prints the manufacturer block of the card
    Info {
        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Reads sectors and prints them as JSON
    Read {
        /// First sector to read
        #[arg(short, long, default_value_t = 0)]
        start: u8,

        /// Last sector to read; the last one of the card by default
        #[arg(short, long)]
        end: Option<u8>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Reads the data regions of the sectors into a file
    Dump {
        /// File to write into
        output: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        start: u8,

        #[arg(short, long)]
        end: Option<u8>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Writes data across the data regions of the sectors
    Write {
        /// Data to write, as hex digits
        #[arg(long, conflicts_with = "input")]
        hex: Option<String>,

        /// File to read the data from
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// First sector to write into
        #[arg(short, long, default_value_t = 1)]
        start: u8,

        /// How to complete the data up to a block boundary (none, block, sector)
        #[arg(short, long, default_value = "sector")]
        padding: Padding,

        /// Use UPDATE BINARY instead of WRITE BINARY
        #[arg(long)]
        update: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Searches the keys of every sector among candidates
    Discover {
        /// Candidate keys, tried in order before the default ones
        #[arg(short, long = "candidate")]
        candidates: Vec<Key>,
    },
}

fn open(args: &Args) -> Result<Card<PcscTransport>> {
    let ctx = Context::try_new()?;
    let device = ctx.open(args.reader.as_deref())?;
    info!("Using reader: {}", device.name());

    let options = CardOptions {
        legacy_auth: args.legacy_auth,
        ..Default::default()
    };

    let mode = match args.direct {
        true => ConnectMode::Direct,
        _ => ConnectMode::Card,
    };

    let card = match mode {
        ConnectMode::Direct => Card::with_options(
            device.transport(),
            nfcard::CardFamily::Iso14443_3A,
            options,
        ),
        ConnectMode::Card => {
            let atr = device.wait_for_card()?;
            Card::from_atr(device.transport(), &atr, options)?
        }
    };

    card.connect(mode)?;
    debug!("Connected to {}", card.family());

    Ok(card)
}

/// Makes the keys known to the card before an operation resolving them by itself.
fn prepare_keys(card: &Card<PcscTransport>, keys: &KeyArgs) -> Result<()> {
    if let Some(key) = keys.key {
        match keys.key_type {
            KeyType::A => card.set_all_keys(Some(key), None)?,
            KeyType::B => card.set_all_keys(None, Some(key))?,
        }
    } else if keys.default_keys {
        let results = card.try_get_all_keys(&DEFAULT_KEYS);
        let found = results
            .values()
            .filter(|r| matches!(r, SectorDiscovery::Found(_)))
            .count();
        info!("Found keys of {} sectors out of {}", found, results.len());
    } else {
        card.set_all_keys(Some(DEFAULT_KEYS[0]), Some(DEFAULT_KEYS[0]))?;
    }

    Ok(())
}

fn read_input(hex: Option<&str>, input: Option<&PathBuf>) -> Result<Vec<u8>> {
    match (hex, input) {
        (Some(h), _) => Ok(hex::decode(h.trim())?),
        (_, Some(path)) => Ok(fs::read(path)?),
        _ => Ok(Vec::new()),
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Readers = args.command {
        for reader in Context::try_new()?.readers()? {
            println!("{}", reader.to_string_lossy());
        }

        return Ok(());
    }

    let card = open(&args)?;

    match &args.command {
        Command::Readers => {}
        Command::Uid => {
            let uid = card.get_uid()?;
            println!("{}", hex::encode_upper(uid));
        }
        Command::Info { keys } => {
            prepare_keys(&card, keys)?;
            let info = card.card_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Read { start, end, keys } => {
            prepare_keys(&card, keys)?;
            let sectors = card.read_sectors(*start, *end, keys.credential())?;
            println!("{}", serde_json::to_string_pretty(&sectors)?);
        }
        Command::Dump {
            output,
            start,
            end,
            keys,
        } => {
            prepare_keys(&card, keys)?;
            let data = card.read_data(*start, *end, keys.credential())?;
            fs::write(output, &data)?;
            info!("Wrote {} bytes into {}", data.len(), output.display());
        }
        Command::Write {
            hex,
            input,
            start,
            padding,
            update,
            yes,
            keys,
        } => {
            let data = read_input(hex.as_deref(), input.as_ref())?;
            if data.is_empty() {
                warn!("Nothing to write");
                return Ok(());
            }

            let confirmed = *yes
                || Confirm::new()
                    .with_prompt(format!(
                        "Write {} bytes from sector {}? This cannot be undone.",
                        data.len(),
                        start,
                    ))
                    .default(false)
                    .interact()?;
            if !confirmed {
                info!("Aborted");
                return Ok(());
            }

            prepare_keys(&card, keys)?;
            let mode = match update {
                true => nfcard::WriteMode::Update,
                _ => nfcard::WriteMode::Write,
            };
            card.write_data_with(&data, *start, keys.credential(), *padding, mode)?;
            info!("Wrote {} bytes", data.len());
        }
        Command::Discover { candidates } => {
            let mut all = candidates.clone();
            all.extend(DEFAULT_KEYS.iter().copied().filter(|k| !candidates.contains(k)));

            let results = card.try_get_all_keys(&all);
            for (sector, result) in &results {
                match result {
                    SectorDiscovery::Found(keys) => {
                        println!("{}: {}", sector, serde_json::to_string(keys)?)
                    }
                    SectorDiscovery::NotFound => println!("{}: not found", sector),
                    SectorDiscovery::Failed(e) => println!("{}: {}", sector, e),
                }
            }
        }
    }

    card.disconnect()?;

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        true => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    run(args)
}

//! Binary entry point for the poda weeder.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use poda::weeder::{DeletionStatus, WeedArgs, Weeder, WeederConfig};
use poda::{Fingerprint, LocalCache, LocalRepository, PkgBuild, PodaError, RootTbl};

#[derive(Parser, Debug)]
#[command(
    name = "poda",
    version,
    about = "Garbage collector for the poda build cache",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        short = 'n',
        long,
        action = ArgAction::SetTrue,
        conflicts_with = "query",
        help = "Run the mark phase but delete nothing"
    )]
    nodelete: bool,

    #[arg(
        short = 'q',
        long,
        action = ArgAction::SetTrue,
        help = "Ask for confirmation before the deletion phase"
    )]
    query: bool,

    #[arg(
        short = 'm',
        long,
        action = ArgAction::SetTrue,
        help = "Print the resolved weeder instructions"
    )]
    models: bool,

    #[arg(
        short = 'r',
        long,
        action = ArgAction::SetTrue,
        help = "Print the disposition of each graph-log root"
    )]
    roots: bool,

    #[arg(
        short = 'k',
        long,
        value_name = "DUR",
        help = "Also keep builds younger than DUR (suffix s/m/h/d, default hours)"
    )]
    keep: Option<String>,

    #[arg(
        short = 'd',
        long,
        value_name = "LEVEL",
        default_value = "warn",
        help = "Logging level (error, warn, info, debug, trace)"
    )]
    debug: String,

    #[arg(long, value_name = "FILE", help = "Configuration file to use")]
    config: Option<PathBuf>,

    #[arg(
        value_name = "INSTRUCTIONS",
        help = "Resolved weeder instructions, one \"<pkg-fp> <model>\" per line; \
                omit to finish a pending weed and exit"
    )]
    instructions: Option<PathBuf>,
}

/// Parses a keep duration like `90m`, `48h`, or `7d` into seconds.
/// A bare number means hours.
fn parse_keep(arg: &str) -> Result<u64, String> {
    let (digits, units) = match arg.chars().last() {
        Some('s') => (&arg[..arg.len() - 1], 1),
        Some('m') => (&arg[..arg.len() - 1], 60),
        Some('h') => (&arg[..arg.len() - 1], 60 * 60),
        Some('d') => (&arg[..arg.len() - 1], 60 * 60 * 24),
        Some(c) if c.is_ascii_digit() => (arg, 60 * 60),
        _ => return Err(format!("unrecognized unit suffix in duration {arg:?}")),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("{arg:?} is not a duration"))?;
    Ok(n * units)
}

/// Reads a resolved instruction file: one package fingerprint (32 hex
/// digits) and model ShortId (hex) per line; `#` starts a comment.
fn read_instructions(path: &PathBuf) -> Result<RootTbl, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read instruction file {}: {e}", path.display()))?;
    let mut roots = RootTbl::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(fp_hex), Some(model_hex), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!(
                "{}:{}: expected \"<pkg-fp> <model>\"",
                path.display(),
                lineno + 1
            ));
        };
        let fp_bytes = hex::decode(fp_hex)
            .ok()
            .and_then(|b| <[u8; 16]>::try_from(b).ok())
            .ok_or_else(|| {
                format!(
                    "{}:{}: package fingerprint must be 32 hex digits",
                    path.display(),
                    lineno + 1
                )
            })?;
        let model = u32::from_str_radix(model_hex.trim_start_matches("0x"), 16)
            .map_err(|_| format!("{}:{}: bad model ShortId", path.display(), lineno + 1))?;
        roots.put(PkgBuild::new(Fingerprint::from_bytes(fp_bytes), model), true);
    }
    Ok(roots)
}

fn run(cli: Cli) -> Result<(), String> {
    let keep_secs = match &cli.keep {
        Some(arg) => {
            if cli.instructions.is_none() {
                return Err("--keep is meaningless with no instruction file".into());
            }
            parse_keep(arg)?
        }
        None => 0,
    };
    if cli.instructions.is_none() && cli.models {
        return Err("--models is meaningless with no instruction file".into());
    }
    if cli.instructions.is_none() && cli.roots {
        return Err("--roots is meaningless with no instruction file".into());
    }

    let cfg = WeederConfig::load(cli.config.clone()).map_err(|e| e.to_string())?;
    let instr_roots = match &cli.instructions {
        Some(path) => Some(read_instructions(path)?),
        None => None,
    };
    if cli.models {
        if let Some(roots) = &instr_roots {
            println!("Resolved weeder instructions:");
            for (pkg, _) in roots.iter() {
                println!("  {pkg}");
            }
        }
    }

    let del_status = if cli.nodelete {
        DeletionStatus::NoDeletions
    } else if cli.query {
        DeletionStatus::QueryDeletions
    } else {
        DeletionStatus::DoDeletions
    };
    let args = WeedArgs {
        instr_roots,
        del_status,
        keep_secs,
        print_roots: cli.roots,
    };

    let repos =
        LocalRepository::open(&cfg.repos_dir, cfg.lease_config()).map_err(|e| e.to_string())?;
    let cache = LocalCache::open(&cfg.graph_log_dir).map_err(|e| e.to_string())?;

    let fatal = |e: PodaError| e.to_string();
    let mut weeder = Weeder::new(&cache, &repos, &cfg).map_err(fatal)?;
    let resumed = weeder.weed(&args).map_err(fatal)?;

    if resumed && args.instr_roots.is_some() {
        // The finished weed was someone else's; now run the requested one.
        let mut weeder = Weeder::new(&cache, &repos, &cfg).map_err(fatal)?;
        weeder.weed(&args).map_err(fatal)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_new(&cli.debug)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("Error: {msg}");
            ExitCode::FAILURE
        }
    }
}

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::{env, path::PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use tricorder::{Table, TableOptions};

const USAGE: &str = "Usage: partition_cache <CSV_PATH> [--overwrite] [--flat] [--column NAME] [--options FILE.yaml]\n       partition_cache --status <CSV_PATH>";

#[derive(Debug, Default)]
struct Args {
    csv: Option<PathBuf>,
    status_only: bool,
    overwrite: bool,
    flat: bool,
    column: Option<String>,
    options: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--status" => args.status_only = true,
            "--overwrite" => args.overwrite = true,
            "--flat" => args.flat = true,
            "--column" => {
                args.column = Some(it.next().context("--column needs a value")?);
            }
            "--options" => {
                args.options = Some(PathBuf::from(
                    it.next().context("--options needs a value")?,
                ));
            }
            "-h" | "--help" => bail!(USAGE),
            other if other.starts_with("--") => bail!("unknown flag {}\n{}", other, USAGE),
            other => {
                if args.csv.replace(PathBuf::from(other)).is_some() {
                    bail!("more than one CSV path given\n{}", USAGE);
                }
            }
        }
    }
    if args.flat && args.column.is_some() {
        bail!("--flat and --column are exclusive\n{}", USAGE);
    }
    Ok(args)
}

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    // ─── 2) arguments and options ────────────────────────────────────
    let args = parse_args()?;
    let csv = args.csv.clone().context(USAGE)?;
    let options = match &args.options {
        Some(path) => TableOptions::from_yaml_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => TableOptions::default(),
    };
    let table = Table::with_options(&csv, options)
        .with_context(|| format!("opening {}", csv.display()))?;

    // ─── 3) status only ──────────────────────────────────────────────
    if args.status_only {
        let status = table.cache().status(table.path())?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    // ─── 4) build ────────────────────────────────────────────────────
    info!(kind = %table.kind(), path = %csv.display(), "building cache");
    let summary = match (&args.column, args.flat) {
        (_, true) => table.partition_flat(args.overwrite),
        (Some(column), false) => table.partition_on(column, args.overwrite),
        (None, false) => table.partition(args.overwrite),
    }
    .with_context(|| format!("building cache for {}", csv.display()))?;

    // ─── 5) report ───────────────────────────────────────────────────
    let status = table.cache().status(table.path())?;
    let report = json!({
        "summary": summary,
        "status": status,
        "load_report": table.load_report(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

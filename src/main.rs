//! Cellslice - Command Line Interface
//!
//! Reads obs metadata, grouped obs counts, or a row-filtered matrix slice from a
//! Parquet experiment on the local filesystem or S3.
//!
//! # Commands
//!
//! - **`obs`** - Prints selected obs columns of the matching rows
//! - **`count`** - Prints row counts per distinct value of the grouping columns
//! - **`slice`** - Retrieves the matrix rows of the matching obs rows and prints a summary
//!
//! # Usage Examples
//!
//! ```bash
//! cellslice obs data/experiment soma_joinid,cell_type --where tissue=lung
//! cellslice count s3://bucket/experiment?anon=true tissue,assay
//! cellslice slice data/experiment --where tissue=lung --layer X --workers 8
//! RUST_LOG=cellslice=debug cellslice slice data/experiment
//! ```
//!
//! # Exit Codes
//!
//! - `0` - Success
//! - `1` - Usage or configuration error, or any other failure
//! - `2` - Store still unavailable after all retries
//! - `3` - No data matched or could be read
//!

use std::env;
use std::process;

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use tracing_subscriber::EnvFilter;

use cellslice::pipeline::{DEFAULT_LAYER, DEFAULT_MEASUREMENT};
use cellslice::{ObsQuery, SliceConfig, SliceError, SliceRequest};

/// Rows printed for tabular results before eliding the rest.
const MAX_PRINTED_ROWS: usize = 50;

/// Parsed command line.
#[derive(Debug, Default)]
struct CliArgs {
    command: String,
    uri: String,
    columns: Vec<String>,
    query: Option<String>,
    measurement: Option<String>,
    layer: Option<String>,
    workers: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cellslice=info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    // Handle --help flag
    if args.len() == 2 && (args[1] == "--help" || args[1] == "-h") {
        print_help();
        return;
    }

    let cli = match parse_args(&args[1..]) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("Error: {}\n", msg);
            print_help();
            process::exit(1);
        }
    };

    let outcome = match cli.command.as_str() {
        "obs" => handle_obs(&cli).await,
        "count" => handle_count(&cli).await,
        "slice" => handle_slice(&cli).await,
        other => {
            eprintln!("Error: Unknown command '{}'\n", other);
            print_help();
            process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("\n✗ {}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        process::exit(exit_code(&e));
    }
}

/// Splits the arguments after the program name into command, positionals and flags.
fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut positionals = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("'{}' requires a value", flag))
        };
        match arg.as_str() {
            "--where" => cli.query = Some(value("--where")?),
            "--measurement" => cli.measurement = Some(value("--measurement")?),
            "--layer" => cli.layer = Some(value("--layer")?),
            "--workers" => {
                let raw = value("--workers")?;
                let workers = raw
                    .parse::<usize>()
                    .map_err(|_| format!("'--workers' expects a number, got '{}'", raw))?;
                cli.workers = Some(workers);
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option '{}'", flag)),
            _ => positionals.push(arg.clone()),
        }
    }

    let mut positionals = positionals.into_iter();
    cli.command = positionals.next().ok_or("missing command")?;
    cli.uri = positionals.next().ok_or("missing experiment URI")?;

    match cli.command.as_str() {
        "obs" | "count" => {
            let columns = positionals
                .next()
                .ok_or_else(|| format!("'{}' requires a comma-separated column list", cli.command))?;
            cli.columns = columns
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        _ => {}
    }

    if let Some(extra) = positionals.next() {
        return Err(format!("unexpected argument '{}'", extra));
    }
    Ok(cli)
}

fn load_config(cli: &CliArgs) -> cellslice::Result<SliceConfig> {
    let config = SliceConfig::from_env()?;
    Ok(match cli.workers {
        Some(workers) => config.with_max_workers(workers),
        None => config,
    })
}

fn parse_query(cli: &CliArgs) -> cellslice::Result<Option<ObsQuery>> {
    cli.query.as_deref().map(ObsQuery::parse).transpose()
}

/// Handles the `obs` command.
async fn handle_obs(cli: &CliArgs) -> cellslice::Result<()> {
    let config = load_config(cli)?;
    let query = parse_query(cli)?;
    let obs = cellslice::get_obs(&cli.uri, &cli.columns, query.as_ref(), &config).await?;
    println!("{} obs rows", obs.num_rows());
    print_batch(&obs)
}

/// Handles the `count` command.
async fn handle_count(cli: &CliArgs) -> cellslice::Result<()> {
    let config = load_config(cli)?;
    let query = parse_query(cli)?;
    let counts = cellslice::count_obs(&cli.uri, &cli.columns, query.as_ref(), None, &config).await?;
    println!("{} groups", counts.num_rows());
    print_batch(&counts)
}

/// Handles the `slice` command.
///
/// Prints the matrix shape, stored value count and the first row identifiers.
async fn handle_slice(cli: &CliArgs) -> cellslice::Result<()> {
    let config = load_config(cli)?;
    let mut request = SliceRequest::new()
        .with_measurement(cli.measurement.as_deref().unwrap_or(DEFAULT_MEASUREMENT))
        .with_layer(cli.layer.as_deref().unwrap_or(DEFAULT_LAYER));
    if let Some(query) = parse_query(cli)? {
        request = request.with_query(query);
    }

    let slice = cellslice::get_slice(&cli.uri, &request, &config).await?;
    let ids = slice.join_ids()?;

    println!("\n✓ Slice retrieved");
    println!("  Shape:         {} x {}", slice.x.n_rows(), slice.x.n_cols());
    println!("  Stored values: {}", slice.x.nnz());
    println!("  Var columns:   {:?}", column_names(&slice.var));
    let preview: Vec<u64> = ids.iter().take(10).copied().collect();
    println!("  First rows:    {:?}{}", preview, if ids.len() > 10 { " ..." } else { "" });
    Ok(())
}

fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch.schema().fields().iter().map(|f| f.name().clone()).collect()
}

/// Prints a batch as tab-separated rows.
fn print_batch(batch: &RecordBatch) -> cellslice::Result<()> {
    let options = FormatOptions::default().with_null("null");
    let formatters = batch
        .columns()
        .iter()
        .map(|c| ArrayFormatter::try_new(c.as_ref() as &dyn Array, &options))
        .collect::<Result<Vec<_>, _>>()?;

    println!("{}", column_names(batch).join("\t"));
    for row in 0..batch.num_rows().min(MAX_PRINTED_ROWS) {
        let cells: Vec<String> = formatters.iter().map(|f| f.value(row).to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    if batch.num_rows() > MAX_PRINTED_ROWS {
        println!("... ({} more rows)", batch.num_rows() - MAX_PRINTED_ROWS);
    }
    Ok(())
}

fn exit_code(err: &SliceError) -> i32 {
    match err {
        SliceError::RetriesExhausted { .. } => 2,
        SliceError::NoData(_) | SliceError::NoMatch => 3,
        SliceError::BlockFetch { source, .. } => exit_code(source),
        _ => 1,
    }
}

/// Displays usage information.
fn print_help() {
    println!("Cellslice - Row-filtered slices of Parquet experiments");
    println!();
    println!("USAGE:");
    println!("    cellslice <command> <experiment-uri> [arguments] [options]");
    println!();
    println!("COMMANDS:");
    println!("    obs <uri> <col[,col...]>      Print obs columns of the matching rows");
    println!("    count <uri> <col[,col...]>    Count matching obs rows per group");
    println!("    slice <uri>                   Retrieve the matrix rows of the matching obs rows");
    println!();
    println!("OPTIONS:");
    println!("    --where EXPR           Row filter: col=value, col!=value, col=a|b (comma = AND)");
    println!("    --measurement NAME     Measurement to slice (default: {})", DEFAULT_MEASUREMENT);
    println!("    --layer NAME           Matrix layer to slice (default: {})", DEFAULT_LAYER);
    println!("    --workers N            Concurrent block reads (default: CELLSLICE_MAX_WORKERS or 1)");
    println!("    -h, --help             Show this help");
    println!();
    println!("ENVIRONMENT:");
    println!("    CELLSLICE_MAX_TRIES, CELLSLICE_RETRY_UNIT_MS, CELLSLICE_OBS_PAGE_SIZE,");
    println!("    CELLSLICE_MATRIX_BATCH_SIZE, RUST_LOG (default: cellslice=info)");
    println!();
    println!("EXIT CODES:");
    println!("    0  success");
    println!("    1  usage or configuration error");
    println!("    2  store unavailable after retries");
    println!("    3  no data");
}

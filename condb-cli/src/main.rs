//! `allocate_seq_no <table> [require_global [db_no]]`
//!
//! Allocates one SEQNO for `table` from the cascade described by the
//! `ENV_TSQL_*` environment and prints it as the last line of stdout, `0`
//! when none could be allocated. `require_global` is `> 0` for global, `0`
//! for automatic and `< 0` for local; both numbers default to 0.
//!
//! ```text
//! seqno=$(allocate_seq_no CALIB 0 0 | tail -1)
//! ```

use condb_core::{DbNo, SeqNo};
use condb_storage::{Cascade, SeqNoRequest};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    table: String,
    request: SeqNoRequest,
    db_no: DbNo,
}

/// Parse the arguments after the program name. Unparsable numbers read as
/// 0, negative entry numbers as entry 0.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Option<Args> {
    let mut args = args.into_iter();
    let table = args.next()?;
    let mut number = || {
        args.next()
            .and_then(|a| a.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };
    let require_global = number().clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    let db_no = DbNo::try_from(number()).unwrap_or(0);
    Some(Args {
        table,
        request: SeqNoRequest::from_i32(require_global),
        db_no,
    })
}

/// `None` when the cascade cannot be built; 0 when allocation failed.
fn allocate(args: &Args) -> Option<SeqNo> {
    let mut cascade = match Cascade::from_env() {
        Ok(cascade) => cascade,
        Err(e) => {
            tracing::error!(error = %e, "Unable to build the cascade");
            return None;
        }
    };
    if args.db_no >= cascade.num_db() {
        tracing::error!(db_no = args.db_no, entries = cascade.num_db(), "No such cascade entry");
        return Some(0);
    }
    Some(cascade.allocate_seq_no(&args.table, args.request, args.db_no))
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args(std::env::args().skip(1)) else {
        tracing::error!("Insufficient arguments: allocate_seq_no <table> [require_global [db_no]]");
        println!("0");
        return ExitCode::FAILURE;
    };

    match allocate(&args) {
        Some(seq_no) => {
            println!("{}", seq_no);
            ExitCode::SUCCESS
        }
        None => {
            println!("0");
            ExitCode::FAILURE
        }
    }
}

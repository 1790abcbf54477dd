//! The scan worker subprocess.
//!
//! Spawned by the scheduler as
//! `duviz-scan-worker <root-dir> <job-id> <uri>`; everything else - options,
//! progress reporting, the commit - goes through the service state below
//! `<root-dir>`. Exit codes are the [`duviz_core::worker::exit_code`] set.

use std::{path::Path, process::ExitCode};

use duviz_core::worker::{self, exit_code};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let code = match args.as_slice() {
        [root_dir, job_id, uri] => match job_id.parse::<i64>() {
            Ok(job_id) => worker::run(Path::new(root_dir), job_id, uri),
            Err(_) => {
                eprintln!("invalid job id: {job_id}");
                exit_code::INVALID_INPUT
            }
        },
        _ => {
            eprintln!("usage: duviz-scan-worker <root-dir> <job-id> <uri>");
            exit_code::INVALID_INPUT
        }
    };

    ExitCode::from(code as u8)
}

//! Implementation of `pgdelta wal-verify`.

use clap::Args;

use crate::backup::{backup_times, wal_segment_of};
use crate::config::Settings;
use crate::wal::verify::{verify_wal_integrity, IntegrityScanLimits};
use crate::wal::{is_wal_filename, parse_wal_filename};
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct WalVerifyArgs {
    /// WAL segment the server is currently writing
    pub current_wal_name: String,

    /// Print JSON instead of text
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

pub fn execute(args: WalVerifyArgs, settings: Settings) -> Result<()> {
    // the earliest backup bounds the scan
    let stop = backup_times(settings.basebackups_folder().as_ref())?
        .iter()
        .map(|b| wal_segment_of(&b.name).to_string())
        .filter(|wal| is_wal_filename(wal))
        .map(|wal| parse_wal_filename(&wal).map(|(_, segment)| segment))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .min();

    let report = verify_wal_integrity(
        settings.wal_folder().as_ref(),
        &args.current_wal_name,
        stop,
        IntegrityScanLimits {
            max_delayed: settings.max_delayed_segments,
            upload_concurrency: settings.upload_concurrency,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("integrity check status: {}", report.status);
    for sequence in &report.details {
        println!(
            "{}\t{}\t{}\t{}",
            sequence.timeline_id, sequence.start_segment, sequence.end_segment, sequence.status
        );
    }
    Ok(())
}

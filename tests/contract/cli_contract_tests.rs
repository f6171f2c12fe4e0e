//! CLI contract tests for pgdelta argument handling.

use pgdelta::cli::{clap_command, parse_args, Command};
use pgdelta::compression::CompressionMethod;
use pgdelta::logging::LogFormat;
use pgdelta::Error;
use tempfile::tempdir;

fn expect_error(args: &[&str], matches_expected: impl Fn(&Error) -> bool) {
    let err = pgdelta::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert!(matches_expected(actual), "unexpected error: {actual:?}");
}

#[test]
fn command_definition_is_consistent() {
    clap_command().debug_assert();
}

#[test]
fn help_lists_every_subcommand() {
    let help = clap_command().render_long_help().to_string();
    for subcommand in [
        "backup-push",
        "backup-fetch",
        "backup-list",
        "backup-mark",
        "wal-push",
        "wal-fetch",
        "wal-verify",
    ] {
        assert!(help.contains(subcommand), "help is missing {subcommand}");
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() -> pgdelta::Result<()> {
    let args = parse_args([
        "pgdelta",
        "backup-fetch",
        "/restore/here",
        "LATEST",
        "--storage",
        "/backups",
        "--compression",
        "zstd",
        "--log-format",
        "json",
    ])?;
    assert_eq!(args.log_format, LogFormat::Json);
    assert_eq!(args.global.compression, Some(CompressionMethod::Zstd));
    let settings = args.global.settings()?;
    assert_eq!(settings.storage_path, std::path::PathBuf::from("/backups"));
    assert_eq!(settings.compression, CompressionMethod::Zstd);
    match args.command {
        Command::BackupFetch(fetch) => {
            assert_eq!(fetch.backup_name, "LATEST");
            assert!(!fetch.catchup);
        }
        other => panic!("parsed into {other:?}"),
    }
    Ok(())
}

#[test]
fn catchup_lsn_conflicts_with_full() {
    let result = clap_command().try_get_matches_from([
        "pgdelta",
        "backup-push",
        "/pgdata",
        "--full",
        "--catchup-from-lsn",
        "0/3000000",
    ]);
    assert_eq!(
        result.map(|_| ()).unwrap_err().kind(),
        clap::error::ErrorKind::ArgumentConflict
    );

    let result = clap_command().try_get_matches_from(["pgdelta", "backup-fetch", "/restore/here"]);
    assert_eq!(
        result.map(|_| ()).unwrap_err().kind(),
        clap::error::ErrorKind::MissingRequiredArgument
    );

    let result = clap_command().try_get_matches_from(["pgdelta", "--compression", "brotli", "backup-list"]);
    assert!(result.is_err());
}

#[test]
fn fetch_into_occupied_directory_fails_fast() {
    let storage = tempdir().unwrap();
    let target = tempdir().unwrap();
    std::fs::write(target.path().join("keep.txt"), b"occupied").unwrap();

    expect_error(
        &[
            "pgdelta",
            "backup-fetch",
            target.path().to_str().unwrap(),
            "base_000000010000000000000002",
            "--storage",
            storage.path().to_str().unwrap(),
        ],
        |e| matches!(e, Error::NonEmptyDataDirectory(_)),
    );
}

#[test]
fn commands_on_empty_storage_report_what_is_missing() {
    let storage = tempdir().unwrap();
    let target = tempdir().unwrap();
    let storage_path = storage.path().to_str().unwrap();

    expect_error(
        &["pgdelta", "backup-fetch", target.path().to_str().unwrap(), "LATEST", "--storage", storage_path],
        |e| matches!(e, Error::MissingBackup(name) if name == "LATEST"),
    );
    expect_error(
        &["pgdelta", "backup-mark", "base_000000010000000000000002", "--storage", storage_path],
        |e| matches!(e, Error::MissingBackup(_)),
    );
    expect_error(
        &[
            "pgdelta",
            "wal-fetch",
            "000000010000000000000002",
            target.path().join("RECOVERYXLOG").to_str().unwrap(),
            "--storage",
            storage_path,
        ],
        |e| matches!(e, Error::ObjectNotFound(_)),
    );
}

#[test]
fn listing_empty_storage_succeeds() -> pgdelta::Result<()> {
    let storage = tempdir()?;
    pgdelta::run(["pgdelta", "backup-list", "--storage", storage.path().to_str().unwrap()])?;
    pgdelta::run(["pgdelta"])?;
    Ok(())
}

use log::{error, info};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use backup_lib::{
    restore_backup, Backup, BackupConfig, BackupResult, DirectorySink, OutputFormat, Store,
    DEFAULT_BLOCK_BUFFER_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_DB_FILE,
};

fn usage() -> String {
    format!(
        "usage: backup-tool backup <device> --output-dir <dir> [--block-size <bytes>]\n\
         \t[--buffer <n>] [--db <path>] [--format file|stream] [--stream-file <path>]\n\
         backup-tool restore <backup-id> <output-file> --output-dir <dir> [--db <path>]\n\
         backup-tool sweep --output-dir <dir> [--db <path>]\n\
         defaults:\n\
         --block-size {}\n\
         --buffer {}\n\
         --db {}",
        DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_BUFFER_SIZE, DEFAULT_DB_FILE
    )
}

struct RestoreArgs {
    backup_id: i64,
    output_file: PathBuf,
    output_dir: PathBuf,
    db_path: PathBuf,
}

struct SweepArgs {
    output_dir: PathBuf,
    db_path: PathBuf,
}

enum Command {
    Backup(BackupConfig),
    Restore(RestoreArgs),
    Sweep(SweepArgs),
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("missing value for {}", flag))
}

fn parse_backup(args: &[String]) -> Result<Command, String> {
    let device = args
        .first()
        .ok_or_else(|| format!("missing device path\n{}", usage()))?;
    let mut config = BackupConfig::new(device);

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" => {
                config.output_directory = Some(PathBuf::from(take_value(args, &mut i, "--output-dir")?));
            }
            "--block-size" => {
                let value = take_value(args, &mut i, "--block-size")?;
                config.block_size = value
                    .parse()
                    .map_err(|_| format!("invalid block size: {}", value))?;
            }
            "--buffer" => {
                let value = take_value(args, &mut i, "--buffer")?;
                config.block_buffer_size = value
                    .parse()
                    .map_err(|_| format!("invalid buffer size: {}", value))?;
            }
            "--db" => {
                config.db_path = PathBuf::from(take_value(args, &mut i, "--db")?);
            }
            "--format" => {
                let value = take_value(args, &mut i, "--format")?;
                config.output_format = match value.as_str() {
                    "file" => OutputFormat::File,
                    "stream" => OutputFormat::Stream,
                    other => return Err(format!("unknown output format: {}", other)),
                };
            }
            "--stream-file" => {
                config.stream_path = Some(PathBuf::from(take_value(args, &mut i, "--stream-file")?));
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }

    Ok(Command::Backup(config))
}

fn parse_restore(args: &[String]) -> Result<Command, String> {
    let backup_id = args
        .first()
        .ok_or_else(|| format!("missing backup id\n{}", usage()))?
        .parse::<i64>()
        .map_err(|_| format!("invalid backup id\n{}", usage()))?;
    let output_file = PathBuf::from(
        args.get(1)
            .ok_or_else(|| format!("missing output file\n{}", usage()))?,
    );
    let mut output_dir: Option<PathBuf> = None;
    let mut db_path = PathBuf::from(DEFAULT_DB_FILE);

    let mut i = 2usize;
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" => {
                output_dir = Some(PathBuf::from(take_value(args, &mut i, "--output-dir")?));
            }
            "--db" => {
                db_path = PathBuf::from(take_value(args, &mut i, "--db")?);
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }

    let output_dir = output_dir.ok_or_else(|| format!("--output-dir is required\n{}", usage()))?;
    Ok(Command::Restore(RestoreArgs {
        backup_id,
        output_file,
        output_dir,
        db_path,
    }))
}

fn parse_sweep(args: &[String]) -> Result<Command, String> {
    let mut output_dir: Option<PathBuf> = None;
    let mut db_path = PathBuf::from(DEFAULT_DB_FILE);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" => {
                output_dir = Some(PathBuf::from(take_value(args, &mut i, "--output-dir")?));
            }
            "--db" => {
                db_path = PathBuf::from(take_value(args, &mut i, "--db")?);
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }

    let output_dir = output_dir.ok_or_else(|| format!("--output-dir is required\n{}", usage()))?;
    Ok(Command::Sweep(SweepArgs { output_dir, db_path }))
}

fn parse_args() -> Result<Command, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    match args[0].as_str() {
        "backup" => parse_backup(&args[1..]),
        "restore" => parse_restore(&args[1..]),
        "sweep" => parse_sweep(&args[1..]),
        other => Err(format!("unknown command: {}\n{}", other, usage())),
    }
}

async fn run(command: Command) -> BackupResult<()> {
    match command {
        Command::Backup(config) => {
            let store = Arc::new(Store::new(&config.db_path)?);
            let mut backup = Backup::new(store, config)?;
            backup.run().await?;
            let record = backup.record();
            let stats = backup.stats();
            info!(
                "backup {} done: type={} blocks={} bytes={} new={} deduplicated={}",
                record.id,
                record.backup_type.to_str(),
                record.total_blocks,
                record.size_in_bytes,
                stats.blocks_written,
                stats.blocks_deduped
            );
            Ok(())
        }
        Command::Restore(args) => {
            let store = Store::new(&args.db_path)?;
            let sink = DirectorySink::new(&args.output_dir).await?;
            restore_backup(&store, &sink, args.backup_id, &args.output_file).await
        }
        Command::Sweep(args) => {
            let store = Store::new(&args.db_path)?;
            let sink = DirectorySink::new(&args.output_dir).await?;
            let removed = sink.sweep_orphans(&store).await?;
            info!("sweep done: removed {} orphan files", removed);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let command = match parse_args() {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(command).await {
        error!("backup-tool failed: {}", err);
        std::process::exit(1);
    }
}

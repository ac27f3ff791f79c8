//! rclone transfer command construction / rclone 传输命令构建

use crate::task::{Task, TaskKind, TaskOptions};

/// Build the argument vector for a one-shot transfer / 构建传输参数
///
/// No shell is involved, so paths with spaces or quotes are passed verbatim.
/// Flags come first and `--` ends them, so a path can never be read as a flag.
pub fn transfer_args(
    kind: TaskKind,
    source: &str,
    destination: &str,
    options: &TaskOptions,
    stats_interval: &str,
) -> Vec<String> {
    let mut args = vec![
        kind.as_str().to_string(),
        "--progress".to_string(),
        "--stats-one-line".to_string(),
        "--stats".to_string(),
        stats_interval.to_string(),
    ];

    if options.dry_run {
        args.push("--dry-run".to_string());
    }
    if let Some(checkers) = options.checkers {
        args.push("--checkers".to_string());
        args.push(checkers.to_string());
    }
    if let Some(transfers) = options.transfers {
        args.push("--transfers".to_string());
        args.push(transfers.to_string());
    }
    for pattern in &options.include {
        args.push("--include".to_string());
        args.push(pattern.clone());
    }
    for pattern in &options.exclude {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    if let Some(limit) = options.bwlimit.as_deref().filter(|l| !l.trim().is_empty()) {
        args.push("--bwlimit".to_string());
        args.push(limit.trim().to_string());
    }

    args.push("--".to_string());
    args.push(source.to_string());
    args.push(destination.to_string());
    args
}

/// 任务对应的参数
pub fn task_args(task: &Task, stats_interval: &str) -> Vec<String> {
    transfer_args(task.kind, &task.source, &task.destination, &task.options, stats_interval)
}

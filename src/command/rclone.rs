use super::{BuiltCommand, CommandMode, TransferRequest};
use crate::models::{OperationType, RcloneOptions};

pub fn build(
    binary: &str,
    request: &TransferRequest<'_>,
    operation: OperationType,
    options: &RcloneOptions,
    mode: CommandMode,
) -> BuiltCommand {
    let preview = mode == CommandMode::Preview;
    let mut argv = vec![binary.to_string(), operation.as_str().to_string()];

    let push_flag = |argv: &mut Vec<String>, on: bool, name: &str| {
        if on {
            argv.push(name.to_string());
        }
    };
    let push_value = |argv: &mut Vec<String>, name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            argv.push(name.to_string());
            argv.push(value.trim().to_string());
        }
    };

    push_flag(&mut argv, options.verbose || preview, "-v");
    push_flag(&mut argv, options.progress && !preview, "--progress");
    push_flag(&mut argv, options.dry_run || preview, "--dry-run");

    if operation == OperationType::Sync {
        push_flag(&mut argv, options.delete, "--delete-during");
        push_flag(&mut argv, options.create_empty_src_dirs, "--create-empty-src-dirs");
    }
    if operation == OperationType::Move {
        push_flag(&mut argv, options.delete_empty_src_dirs, "--delete-empty-src-dirs");
    }
    if operation != OperationType::Check {
        push_flag(&mut argv, options.checksum, "--checksum");
        push_flag(&mut argv, options.ignore_times, "--ignore-times");
    }

    push_value(&mut argv, "--transfers", options.transfers.map(|n| n.to_string()));
    push_value(&mut argv, "--checkers", options.checkers.map(|n| n.to_string()));
    push_value(&mut argv, "--bwlimit", options.bwlimit.clone());

    push_flag(&mut argv, options.update, "--update");
    push_flag(&mut argv, options.ignore_existing, "--ignore-existing");
    push_flag(&mut argv, options.size_only, "--size-only");

    push_value(&mut argv, "--retries", options.retries.map(|n| n.to_string()));
    push_value(
        &mut argv,
        "--low-level-retries",
        options.low_level_retries.map(|n| n.to_string()),
    );
    push_value(&mut argv, "--timeout", options.timeout.clone());
    push_value(&mut argv, "--contimeout", options.contimeout.clone());
    push_value(&mut argv, "--stats", options.stats_interval.clone());

    push_flag(&mut argv, options.fast_list, "--fast-list");
    push_flag(&mut argv, options.track_renames, "--track-renames");

    push_value(&mut argv, "--max-delete", options.max_delete.map(|n| n.to_string()));
    push_value(&mut argv, "--min-size", options.min_size.clone());
    push_value(&mut argv, "--max-size", options.max_size.clone());
    push_value(&mut argv, "--min-age", options.min_age.clone());
    push_value(&mut argv, "--max-age", options.max_age.clone());

    for pattern in request.excludes {
        argv.push("--exclude".to_string());
        argv.push(pattern.clone());
    }
    for pattern in &options.includes {
        argv.push("--include".to_string());
        argv.push(pattern.clone());
    }
    argv.push(request.source.to_string());
    argv.push(request.destination.to_string());

    BuiltCommand {
        argv,
        warnings: warnings(operation, options),
    }
}

fn warnings(operation: OperationType, options: &RcloneOptions) -> Vec<String> {
    let mut warnings = Vec::new();
    if operation == OperationType::Sync && options.delete && !options.dry_run {
        warnings.push(
            "sync with delete will remove destination files that do not exist in the source"
                .to_string(),
        );
    }
    if operation == OperationType::Move && !options.dry_run {
        warnings.push("move deletes source files once they are transferred".to_string());
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferSpec;

    fn run(
        operation: OperationType,
        options: RcloneOptions,
        excludes: &[String],
        mode: CommandMode,
    ) -> BuiltCommand {
        let transfer = TransferSpec::Rclone {
            operation,
            options: options.clone(),
        };
        let request = TransferRequest {
            source: "/photos",
            destination: "gdrive:photos",
            excludes,
            transfer: &transfer,
        };
        build("rclone", &request, operation, &options, mode)
    }

    #[test]
    fn test_default_copy() {
        let cmd = run(
            OperationType::Copy,
            RcloneOptions::default(),
            &[],
            CommandMode::Run,
        );
        assert_eq!(
            cmd.argv,
            [
                "rclone",
                "copy",
                "-v",
                "--progress",
                "--transfers",
                "4",
                "--checkers",
                "8",
                "--retries",
                "3",
                "--low-level-retries",
                "10",
                "--stats",
                "1s",
                "/photos",
                "gdrive:photos",
            ]
        );
        assert!(cmd.warnings.is_empty());
    }

    #[test]
    fn test_sync_specific_flags() {
        let options = RcloneOptions {
            delete: true,
            create_empty_src_dirs: true,
            delete_empty_src_dirs: true,
            ..RcloneOptions::default()
        };
        let cmd = run(OperationType::Sync, options.clone(), &[], CommandMode::Run);
        assert!(cmd.argv.contains(&"--delete-during".to_string()));
        assert!(cmd.argv.contains(&"--create-empty-src-dirs".to_string()));
        assert!(!cmd.argv.contains(&"--delete-empty-src-dirs".to_string()));
        assert_eq!(cmd.warnings.len(), 1);

        // Sync-only flags are ignored for copy.
        let cmd = run(OperationType::Copy, options, &[], CommandMode::Run);
        assert!(!cmd.argv.contains(&"--delete-during".to_string()));
        assert!(cmd.warnings.is_empty());
    }

    #[test]
    fn test_move_flags_and_warning() {
        let options = RcloneOptions {
            delete_empty_src_dirs: true,
            ..RcloneOptions::default()
        };
        let cmd = run(OperationType::Move, options, &[], CommandMode::Run);
        assert!(cmd.argv.contains(&"--delete-empty-src-dirs".to_string()));
        assert_eq!(cmd.warnings.len(), 1);
        assert!(cmd.warnings[0].contains("move"));
    }

    #[test]
    fn test_check_skips_comparison_flags() {
        let options = RcloneOptions {
            checksum: true,
            ignore_times: true,
            ..RcloneOptions::default()
        };
        let cmd = run(OperationType::Check, options, &[], CommandMode::Run);
        assert!(!cmd.argv.contains(&"--checksum".to_string()));
        assert!(!cmd.argv.contains(&"--ignore-times".to_string()));
    }

    #[test]
    fn test_filters_and_limits() {
        let options = RcloneOptions {
            bwlimit: Some("10M".to_string()),
            max_delete: Some(50),
            min_size: Some("1k".to_string()),
            max_age: Some(" ".to_string()),
            includes: vec!["*.jpg".to_string()],
            ..RcloneOptions::default()
        };
        let excludes = vec!["*.raw".to_string()];
        let cmd = run(OperationType::Copy, options, &excludes, CommandMode::Run);
        let joined = cmd.argv.join(" ");
        assert!(joined.contains("--bwlimit 10M"));
        assert!(joined.contains("--max-delete 50"));
        assert!(joined.contains("--min-size 1k"));
        assert!(!joined.contains("--max-age"));
        assert!(joined.ends_with("--exclude *.raw --include *.jpg /photos gdrive:photos"));
    }

    #[test]
    fn test_preview_mode() {
        let options = RcloneOptions {
            verbose: false,
            ..RcloneOptions::default()
        };
        let cmd = run(OperationType::Sync, options, &[], CommandMode::Preview);
        assert!(cmd.argv.contains(&"--dry-run".to_string()));
        assert!(cmd.argv.contains(&"-v".to_string()));
        assert!(!cmd.argv.contains(&"--progress".to_string()));
    }

    #[test]
    fn test_resume_matches_run() {
        // rclone skips unchanged files on its own.
        let run_cmd = run(
            OperationType::Copy,
            RcloneOptions::default(),
            &[],
            CommandMode::Run,
        );
        let resume_cmd = run(
            OperationType::Copy,
            RcloneOptions::default(),
            &[],
            CommandMode::Resume,
        );
        assert_eq!(run_cmd, resume_cmd);
    }
}

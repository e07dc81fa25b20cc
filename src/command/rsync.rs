use super::{BuiltCommand, CommandMode, TransferRequest};
use crate::models::RsyncOptions;

pub fn build(
    binary: &str,
    request: &TransferRequest<'_>,
    options: &RsyncOptions,
    mode: CommandMode,
) -> BuiltCommand {
    let preview = mode == CommandMode::Preview;
    let mut argv = vec![binary.to_string()];
    let mut flag = |on: bool, name: &str| {
        if on {
            argv.push(name.to_string());
        }
    };

    flag(options.archive, "-a");
    flag(options.verbose, "-v");
    // Preview output is parsed, so keep sizes as plain byte counts.
    flag(options.human_readable && !preview, "-h");
    flag(options.progress && !preview, "-P");
    flag(options.compress, "--compress");
    flag(options.delete, "--delete");
    flag(options.dry_run || preview, "--dry-run");
    flag(options.remove_source_files, "--remove-source-files");
    flag(options.checksum, "--checksum");
    flag(options.stats || preview, "--stats");
    flag(options.itemize_changes, "--itemize-changes");
    flag(options.inplace, "--inplace");
    flag(options.sparse, "--sparse");
    flag(options.whole_file, "--whole-file");
    flag(options.update, "--update");
    flag(options.ignore_existing, "--ignore-existing");

    if mode == CommandMode::Resume {
        flag(options.partial_dir.is_none(), "--partial");
        flag(!options.whole_file, "--append-verify");
    }

    if let Some(limit) = non_blank(&options.bwlimit) {
        argv.push(format!("--bwlimit={}", limit));
    }
    if let Some(dir) = non_blank(&options.partial_dir) {
        argv.push(format!("--partial-dir={}", dir));
    }
    for pattern in request.excludes {
        argv.push("--exclude".to_string());
        argv.push(pattern.clone());
    }
    argv.push(request.source.to_string());
    argv.push(request.destination.to_string());

    BuiltCommand {
        argv,
        warnings: warnings(options),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn warnings(options: &RsyncOptions) -> Vec<String> {
    let mut warnings = Vec::new();
    if options.delete && !options.dry_run {
        warnings.push(
            "--delete will permanently remove destination files that are not in the source"
                .to_string(),
        );
    }
    if options.remove_source_files {
        if !options.dry_run {
            warnings.push(
                "--remove-source-files will permanently delete source files after transfer"
                    .to_string(),
            );
        }
        if !options.checksum {
            warnings.push(
                "Consider --checksum with --remove-source-files for data safety".to_string(),
            );
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransferSpec;

    fn run(options: RsyncOptions, excludes: &[String], mode: CommandMode) -> BuiltCommand {
        let transfer = TransferSpec::Rsync {
            options: options.clone(),
        };
        let request = TransferRequest {
            source: "/src/",
            destination: "/dst",
            excludes,
            transfer: &transfer,
        };
        build("rsync", &request, &options, mode)
    }

    #[test]
    fn test_default_options() {
        let cmd = run(RsyncOptions::default(), &[], CommandMode::Run);
        assert_eq!(
            cmd.argv,
            ["rsync", "-a", "-v", "-h", "-P", "--stats", "/src/", "/dst"]
        );
        assert!(cmd.warnings.is_empty());
    }

    #[test]
    fn test_all_flags_in_order() {
        let options = RsyncOptions {
            archive: true,
            verbose: false,
            human_readable: false,
            progress: false,
            compress: true,
            delete: true,
            dry_run: true,
            remove_source_files: false,
            checksum: true,
            stats: false,
            itemize_changes: true,
            inplace: true,
            sparse: true,
            whole_file: true,
            update: true,
            ignore_existing: true,
            bwlimit: Some("1000".to_string()),
            partial_dir: Some(".rsync-partial".to_string()),
        };
        let excludes = vec!["*.tmp".to_string(), "node_modules".to_string()];
        let cmd = run(options, &excludes, CommandMode::Run);
        assert_eq!(
            cmd.argv,
            [
                "rsync",
                "-a",
                "--compress",
                "--delete",
                "--dry-run",
                "--checksum",
                "--itemize-changes",
                "--inplace",
                "--sparse",
                "--whole-file",
                "--update",
                "--ignore-existing",
                "--bwlimit=1000",
                "--partial-dir=.rsync-partial",
                "--exclude",
                "*.tmp",
                "--exclude",
                "node_modules",
                "/src/",
                "/dst",
            ]
        );
    }

    #[test]
    fn test_blank_values_skipped() {
        let options = RsyncOptions {
            bwlimit: Some("  ".to_string()),
            partial_dir: Some(String::new()),
            ..RsyncOptions::default()
        };
        let cmd = run(options, &[], CommandMode::Run);
        assert!(!cmd.argv.iter().any(|a| a.starts_with("--bwlimit")));
        assert!(!cmd.argv.iter().any(|a| a.starts_with("--partial-dir")));
    }

    #[test]
    fn test_resume_keeps_partial_data() {
        let cmd = run(RsyncOptions::default(), &[], CommandMode::Resume);
        assert!(cmd.argv.contains(&"--partial".to_string()));
        assert!(cmd.argv.contains(&"--append-verify".to_string()));

        let options = RsyncOptions {
            partial_dir: Some(".partial".to_string()),
            ..RsyncOptions::default()
        };
        let cmd = run(options, &[], CommandMode::Resume);
        assert!(!cmd.argv.contains(&"--partial".to_string()));
    }

    #[test]
    fn test_preview_forces_dry_run_with_plain_stats() {
        let cmd = run(RsyncOptions::default(), &[], CommandMode::Preview);
        assert!(cmd.argv.contains(&"--dry-run".to_string()));
        assert!(cmd.argv.contains(&"--stats".to_string()));
        assert!(!cmd.argv.contains(&"-h".to_string()));
        assert!(!cmd.argv.contains(&"-P".to_string()));
    }

    #[test]
    fn test_delete_warns_unless_dry_run() {
        let options = RsyncOptions {
            delete: true,
            ..RsyncOptions::default()
        };
        let cmd = run(options.clone(), &[], CommandMode::Run);
        assert_eq!(cmd.warnings.len(), 1);
        assert!(cmd.warnings[0].contains("--delete"));
        // Warnings never block construction.
        assert!(cmd.argv.contains(&"--delete".to_string()));

        let cmd = run(
            RsyncOptions {
                dry_run: true,
                ..options
            },
            &[],
            CommandMode::Run,
        );
        assert!(cmd.warnings.is_empty());
    }

    #[test]
    fn test_remove_source_files_warnings() {
        let options = RsyncOptions {
            remove_source_files: true,
            ..RsyncOptions::default()
        };
        let cmd = run(options.clone(), &[], CommandMode::Run);
        assert_eq!(cmd.warnings.len(), 2);
        assert!(cmd.warnings[0].contains("delete source files"));
        assert!(cmd.warnings[1].contains("--checksum"));

        let cmd = run(
            RsyncOptions {
                checksum: true,
                ..options
            },
            &[],
            CommandMode::Run,
        );
        assert_eq!(cmd.warnings.len(), 1);
    }
}

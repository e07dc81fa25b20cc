// CLI job commands: add, list, show, lifecycle actions, logs, progress

use std::collections::HashMap;

use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use uuid::Uuid;

use super::{AddArgs, ApiClient, JobAction, Tool};
use crate::models::{
    Job, NewJob, OperationType, PendingPreview, Progress, RcloneOptions, RsyncOptions,
    TransferSpec,
};

/// Turn `trm add` flags into a creation request.
pub fn new_job_from_args(args: &AddArgs) -> anyhow::Result<NewJob> {
    let transfer = match args.tool {
        Tool::Rsync => {
            if args.operation.is_some() {
                anyhow::bail!("--operation only applies to rclone jobs");
            }
            TransferSpec::Rsync {
                options: RsyncOptions {
                    delete: args.delete,
                    dry_run: args.dry_run,
                    bwlimit: args.bwlimit.clone(),
                    ..RsyncOptions::default()
                },
            }
        }
        Tool::Rclone => {
            let operation = match args.operation.as_deref() {
                Some(op) => op.parse::<OperationType>().map_err(|e| anyhow::anyhow!(e))?,
                None => OperationType::Copy,
            };
            TransferSpec::Rclone {
                operation,
                options: RcloneOptions {
                    delete: args.delete,
                    dry_run: args.dry_run,
                    bwlimit: args.bwlimit.clone(),
                    ..RcloneOptions::default()
                },
            }
        }
    };
    Ok(NewJob {
        name: args.name.clone(),
        source: args.source.clone(),
        destination: args.destination.clone(),
        excludes: args.excludes.clone(),
        transfer,
        max_retries: args.max_retries,
    })
}

/// trm add
pub async fn cmd_add(api: &ApiClient, args: &AddArgs) -> anyhow::Result<()> {
    let new_job = new_job_from_args(args)?;
    let path = if args.preview {
        "/api/jobs/preview"
    } else {
        "/api/jobs"
    };
    let job: Job = api.send(api.post(path).json(&new_job)).await?.json().await?;

    println!("Job '{}' created ({}).", job.name, job.status);
    println!("  ID:          {}", job.id);
    println!("  Tool:        {}", tool_label(&job.transfer));
    println!("  Source:      {}", job.source);
    println!("  Destination: {}", job.destination);
    println!("  Max retries: {}", job.max_retries);
    if let Some(preview) = &job.preview {
        print_preview(preview);
        println!(
            "Approve with 'trm approve {}' or discard with 'trm cancel {}'.",
            job.name, job.name
        );
    }
    Ok(())
}

fn print_preview(preview: &PendingPreview) {
    println!("Preview:");
    println!("  Command:     {}", preview.command.join(" "));
    match &preview.error {
        Some(error) => println!("  Dry run failed: {}", error),
        None => {
            println!("  Files:       {}", opt_count(preview.files));
            println!(
                "  Size:        {}",
                preview.bytes.map(format_bytes).unwrap_or_else(|| "-".into())
            );
            if let Some(secs) = preview.estimated_seconds {
                println!("  Estimate:    ~{}s at the configured bandwidth limit", secs);
            }
        }
    }
    for warning in &preview.warnings {
        println!("  Warning:     {}", warning);
    }
}

/// trm list
pub async fn cmd_list(api: &ApiClient, failed: bool, json: bool) -> anyhow::Result<()> {
    let path = if failed { "/api/jobs/failed" } else { "/api/jobs" };
    let jobs: Vec<Job> = api.send(api.get(path)).await?.json().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<16}  {:<12}  {:>8}  {:>7}",
        "ID", "NAME", "STATUS", "TOOL", "PROGRESS", "RETRIES"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<20}  {:<16}  {:<12}  {:>8}  {:>7}",
            job.id,
            truncate(&job.name, 20),
            job.status.as_str(),
            tool_label(&job.transfer),
            job.progress
                .as_ref()
                .map(|p| format!("{}%", p.percent))
                .unwrap_or_else(|| "-".to_string()),
            format!("{}/{}", job.retry_count, job.max_retries),
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// trm show
pub async fn cmd_show(api: &ApiClient, reference: &str) -> anyhow::Result<()> {
    let request = api.job_request(Method::GET, reference, None)?;
    let body = api.send_json(request).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// trm run | pause | resume | halt | restart | approve | cancel
pub async fn cmd_action(api: &ApiClient, action: JobAction, reference: &str) -> anyhow::Result<()> {
    let request = api.job_request(Method::POST, reference, Some(action.endpoint()))?;
    let response = api.send(request).await?;
    if response.status() == StatusCode::NO_CONTENT {
        println!("Job '{}' {}.", reference, action.past_tense());
        return Ok(());
    }
    let job: Job = response.json().await?;
    println!(
        "Job '{}' {} (status: {}).",
        job.name,
        action.past_tense(),
        job.status
    );
    Ok(())
}

/// trm remove
pub async fn cmd_remove(api: &ApiClient, reference: &str) -> anyhow::Result<()> {
    let request = api.job_request(Method::DELETE, reference, None)?;
    api.send(request).await?;
    println!("Job '{}' removed.", reference);
    Ok(())
}

/// trm restart-failed
pub async fn cmd_restart_failed(api: &ApiClient) -> anyhow::Result<()> {
    let body = api.send_json(api.post("/api/jobs/restart-failed")).await?;
    let results = body["results"].as_array().cloned().unwrap_or_default();
    if results.is_empty() {
        println!("No failed jobs to restart.");
        return Ok(());
    }
    for result in &results {
        let name = result["name"].as_str().unwrap_or("unknown");
        if result["ok"].as_bool().unwrap_or(false) {
            println!("  restarted  {}", name);
        } else {
            let error = result["error"].as_str().unwrap_or("unknown error");
            println!("  skipped    {} ({})", name, error);
        }
    }
    println!(
        "Restarted {} of {} failed job(s).",
        body["restarted"].as_u64().unwrap_or(0),
        results.len()
    );
    Ok(())
}

/// trm cleanup-interrupted
pub async fn cmd_cleanup_interrupted(api: &ApiClient) -> anyhow::Result<()> {
    let body = api
        .send_json(api.post("/api/jobs/cleanup-interrupted"))
        .await?;
    let count = body["recovered"].as_array().map_or(0, Vec::len);
    println!("Marked {} interrupted job(s) as failed.", count);
    Ok(())
}

/// trm logs
pub async fn cmd_logs(api: &ApiClient, reference: &str, tail: Option<usize>) -> anyhow::Result<()> {
    let mut request = api.job_request(Method::GET, reference, Some("logs"))?;
    if let Some(n) = tail {
        request = request.query(&[("tail", n)]);
    }
    let content = api.send(request).await?.text().await?;
    if content.is_empty() {
        println!("(no log output yet)");
    } else {
        print!("{}", content);
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

/// trm progress
pub async fn cmd_progress(api: &ApiClient, follow: bool) -> anyhow::Result<()> {
    let names: HashMap<Uuid, String> = api
        .send(api.get("/api/jobs"))
        .await?
        .json::<Vec<Job>>()
        .await?
        .into_iter()
        .map(|job| (job.id, job.name))
        .collect();

    if !follow {
        let snapshot: HashMap<Uuid, Progress> =
            api.send(api.get("/api/progress")).await?.json().await?;
        if snapshot.is_empty() {
            println!("No active transfers.");
        }
        print_progress(&snapshot, &names);
        return Ok(());
    }

    let response = api.send(api.get("/api/progress/stream")).await?;
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("Progress stream failed: {}", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            for data in frame.lines().filter_map(|l| l.strip_prefix("data:")) {
                let Ok(feed) = serde_json::from_str::<Value>(data.trim()) else {
                    continue;
                };
                let jobs: HashMap<Uuid, Progress> =
                    serde_json::from_value(feed["jobs"].clone()).unwrap_or_default();
                println!("--- {}", feed["emitted_at"].as_str().unwrap_or(""));
                print_progress(&jobs, &names);
            }
        }
    }
    Ok(())
}

fn print_progress(jobs: &HashMap<Uuid, Progress>, names: &HashMap<Uuid, String>) {
    let mut rows: Vec<_> = jobs.iter().collect();
    rows.sort_by_key(|(id, _)| **id);
    for (id, progress) in rows {
        let name = names.get(id).map(String::as_str).unwrap_or("?");
        let total = progress
            .total_bytes
            .map(|t| format!(" / {}", format_bytes(t)))
            .unwrap_or_default();
        println!(
            "{:<20}  {:>3}%  {:<12}  {}{}  {}  eta {}",
            truncate(name, 20),
            progress.percent,
            progress.phase,
            format_bytes(progress.bytes_transferred),
            total,
            progress.rate.as_deref().unwrap_or("-"),
            progress.eta.as_deref().unwrap_or("-"),
        );
    }
}

fn tool_label(transfer: &TransferSpec) -> String {
    match transfer.operation() {
        Some(op) => format!("{} {}", transfer.tool_name(), op),
        None => transfer.tool_name().to_string(),
    }
}

fn opt_count(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tool: Tool) -> AddArgs {
        AddArgs {
            name: "photos".to_string(),
            source: "/data/photos".to_string(),
            destination: "/mnt/backup".to_string(),
            tool,
            operation: None,
            excludes: vec!["*.tmp".to_string()],
            max_retries: Some(2),
            delete: true,
            dry_run: false,
            bwlimit: Some("5M".to_string()),
            preview: false,
        }
    }

    #[test]
    fn test_rsync_args_become_new_job() {
        let job = new_job_from_args(&args(Tool::Rsync)).expect("new job");
        match job.transfer {
            TransferSpec::Rsync { options } => {
                assert!(options.delete);
                assert!(options.archive);
                assert_eq!(options.bwlimit.as_deref(), Some("5M"));
            }
            other => panic!("Expected rsync, got {:?}", other),
        }
        assert_eq!(job.excludes, vec!["*.tmp"]);
        assert_eq!(job.max_retries, Some(2));
    }

    #[test]
    fn test_rclone_operation_parsing() {
        let mut a = args(Tool::Rclone);
        let job = new_job_from_args(&a).expect("default operation");
        assert_eq!(job.transfer.operation(), Some(OperationType::Copy));

        a.operation = Some("move".to_string());
        let job = new_job_from_args(&a).expect("move");
        assert_eq!(job.transfer.operation(), Some(OperationType::Move));

        a.operation = Some("mirror".to_string());
        assert!(new_job_from_args(&a).is_err());
    }

    #[test]
    fn test_operation_rejected_for_rsync() {
        let mut a = args(Tool::Rsync);
        a.operation = Some("sync".to_string());
        let err = new_job_from_args(&a).unwrap_err();
        assert!(err.to_string().contains("only applies to rclone"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("a-very-long-job-name-indeed", 10), "a-very-...");
        assert_eq!(opt_count(None), "-");
    }
}

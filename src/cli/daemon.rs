// CLI daemon commands: start, stop, status

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;

use super::ApiClient;
use crate::daemon::StartOptions;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8377;
const STARTUP_WAIT: Duration = Duration::from_secs(10);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(60);

/// trm start
pub async fn cmd_start(
    api: &ApiClient,
    foreground: bool,
    config: Option<&str>,
    data_dir: Option<&str>,
    port: u16,
) -> anyhow::Result<()> {
    // Global --host/--port only override the config file when set explicitly.
    let options = StartOptions {
        config_path: config.map(PathBuf::from),
        data_dir: data_dir.map(PathBuf::from),
        host: (api.host() != DEFAULT_HOST).then(|| api.host().to_string()),
        port: (port != DEFAULT_PORT).then_some(port),
    };

    if foreground {
        return crate::daemon::start_daemon(options).await;
    }

    if is_running(api).await {
        println!("Daemon is already running at {}", api.url(""));
        return Ok(());
    }

    let exe_path = std::env::current_exe().context("Failed to determine executable path")?;
    let mut command = std::process::Command::new(exe_path);
    command
        .args(["--host", api.host(), "--port", &port.to_string()])
        .args(["start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(config) = config {
        command.args(["--config", config]);
    }
    if let Some(data_dir) = data_dir {
        command.args(["--data-dir", data_dir]);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: Ctrl+C in this terminal must not reach the daemon.
        command.process_group(0);
    }
    let child = command.spawn().context("Failed to launch daemon process")?;

    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    while tokio::time::Instant::now() < deadline {
        if is_running(api).await {
            println!("Daemon started (PID {}).", child.id());
            println!("Use 'trm status' to check daemon status.");
            println!("Use 'trm stop' to stop the daemon.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    anyhow::bail!(
        "Daemon did not become ready within {}s. Try 'trm start --foreground' to see its output.",
        STARTUP_WAIT.as_secs()
    )
}

async fn is_running(api: &ApiClient) -> bool {
    api.get("/health")
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .is_ok_and(|r| r.status().is_success())
}

/// trm stop
pub async fn cmd_stop(api: &ApiClient) -> anyhow::Result<()> {
    api.send(api.post("/api/shutdown")).await?;
    println!("Shutdown requested, waiting for active transfers to stop...");

    let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
    while tokio::time::Instant::now() < deadline {
        if !is_running(api).await {
            println!("Daemon stopped.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    anyhow::bail!(
        "Daemon is still responding after {}s",
        SHUTDOWN_WAIT.as_secs()
    )
}

/// trm status
pub async fn cmd_status(api: &ApiClient, verbose: bool) -> anyhow::Result<()> {
    let body = api.send_json(api.get("/health")).await?;

    let daemon_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
    let active_jobs = body["active_jobs"].as_u64().unwrap_or(0);
    let total_jobs = body["total_jobs"].as_u64().unwrap_or(0);
    let data_dir = body["data_dir"].as_str().unwrap_or("unknown");

    println!("Daemon Status: {}", daemon_status);
    println!("  API:         {}", api.url(""));
    println!("  Data Dir:    {}", data_dir);
    println!(
        "  Jobs:        {} active / {} total",
        active_jobs, total_jobs
    );
    println!("  Uptime:      {}", format_uptime(uptime));
    println!("  Version:     {}", version);
    if let Some(error) = body["store_error"].as_str() {
        println!("  Store:       failed to load ({})", error);
    }

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(61), "1m 1s");
        assert_eq!(format_uptime(3661), "1h 1m 1s");
        assert_eq!(format_uptime(90061), "1d 1h 1m 1s");
    }

    #[tokio::test]
    async fn test_status_reports_unreachable_daemon() {
        // Port 1 is privileged and never serves the API.
        let api = ApiClient::new("127.0.0.1", 1);
        let err = cmd_status(&api, false).await.unwrap_err();
        assert!(err.to_string().contains("Could not connect"), "{}", err);
        assert!(!is_running(&api).await);
    }
}

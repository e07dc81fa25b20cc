pub mod daemon;
pub mod jobs;

use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde_json::Value;

/// Transfer Restart Manager - supervises rsync and rclone transfers
#[derive(Parser, Debug)]
#[command(
    name = "trm",
    version,
    about = "Transfer Restart Manager - supervises rsync and rclone transfers"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8377, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tool {
    Rsync,
    Rclone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Run,
    Pause,
    Resume,
    Halt,
    Restart,
    Approve,
    Cancel,
}

impl JobAction {
    /// Path segment of the matching API route.
    pub fn endpoint(&self) -> &'static str {
        match self {
            JobAction::Run => "start",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Halt => "stop",
            JobAction::Restart => "restart",
            JobAction::Approve => "approve",
            JobAction::Cancel => "cancel",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            JobAction::Run => "started",
            JobAction::Pause => "paused",
            JobAction::Resume => "resumed",
            JobAction::Halt => "stopped",
            JobAction::Restart => "restarted",
            JobAction::Approve => "approved",
            JobAction::Cancel => "cancelled",
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct AddArgs {
    /// Job name (must be unique)
    #[arg(short = 'n', long)]
    pub name: String,

    /// Source path or remote:path
    #[arg(short = 's', long)]
    pub source: String,

    /// Destination path or remote:path
    #[arg(short = 'd', long = "dest")]
    pub destination: String,

    /// Transfer tool
    #[arg(long, value_enum, default_value_t = Tool::Rsync)]
    pub tool: Tool,

    /// rclone operation: copy, sync, move or check
    #[arg(long)]
    pub operation: Option<String>,

    /// Exclude pattern (repeatable)
    #[arg(short = 'e', long = "exclude")]
    pub excludes: Vec<String>,

    /// Retries after the first failed attempt
    #[arg(long = "max-retries")]
    pub max_retries: Option<i64>,

    /// Delete extraneous files at the destination
    #[arg(long)]
    pub delete: bool,

    /// Pass the tool's own dry-run flag on every run
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Bandwidth limit passed to the tool (e.g. 10M)
    #[arg(long)]
    pub bwlimit: Option<String>,

    /// Create the job pending approval with a dry-run estimate
    #[arg(long)]
    pub preview: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't detach)
        #[arg(short = 'f', long)]
        foreground: bool,

        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status,

    /// Add a transfer job
    Add(AddArgs),

    /// List jobs
    List {
        /// Show only failed jobs
        #[arg(long)]
        failed: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one job in full
    Show {
        /// Job name or UUID
        job: String,
    },

    /// Start a created or stopped job
    Run { job: String },

    /// Pause a running job
    Pause { job: String },

    /// Resume a paused job
    Resume { job: String },

    /// Stop a running or paused job
    Halt { job: String },

    /// Restart a failed job
    Restart { job: String },

    /// Approve a job waiting on its preview
    Approve { job: String },

    /// Discard a job waiting on its preview
    Cancel { job: String },

    /// Remove a job and its log
    Remove {
        /// Job name or UUID
        job: String,
    },

    /// Restart every failed job
    RestartFailed,

    /// Mark jobs left running by a previous daemon as failed
    CleanupInterrupted,

    /// Show a job's log
    Logs {
        /// Job name or UUID
        job: String,

        /// Show last N lines
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Show live progress of active jobs
    Progress {
        /// Keep streaming updates
        #[arg(long)]
        follow: bool,
    },
}

/// Build the base URL for the daemon HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: trm start)",
        host, port
    )
}

/// Thin HTTP client that turns transport and API errors into messages.
pub struct ApiClient {
    client: Client,
    host: String,
    port: u16,
}

impl ApiClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: Client::new(),
            host: host.to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", base_url(&self.host, self.port), path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path))
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.client.delete(self.url(path))
    }

    /// Request against `/api/jobs/<reference>[/<action>]`; the reference is
    /// percent-encoded since names may contain spaces or slashes.
    pub fn job_request(
        &self,
        method: Method,
        reference: &str,
        action: Option<&str>,
    ) -> anyhow::Result<RequestBuilder> {
        let mut url = Url::parse(&self.url("/api/jobs"))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Invalid daemon URL"))?;
            segments.push(reference);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(self.client.request(method, url))
    }

    /// Send and fail on any non-2xx status, using the API's `message`.
    pub async fn send(&self, request: RequestBuilder) -> anyhow::Result<Response> {
        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({ "message": status.to_string() }));
        let message = body["message"].as_str().unwrap_or("Unknown error");
        Err(anyhow::anyhow!("{}", message))
    }

    pub async fn send_json(&self, request: RequestBuilder) -> anyhow::Result<Value> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))
    }

    fn request_error(&self, err: reqwest::Error) -> anyhow::Error {
        if err.is_connect() || err.is_timeout() {
            anyhow::anyhow!("{}", connection_error_message(&self.host, self.port))
        } else {
            anyhow::anyhow!("Request failed: {}", err)
        }
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let api = ApiClient::new(&cli.host, cli.port);
    match &cli.command {
        Some(Commands::Start {
            foreground,
            config,
            data_dir,
        }) => {
            daemon::cmd_start(
                &api,
                *foreground,
                config.as_deref(),
                data_dir.as_deref(),
                cli.port,
            )
            .await
        }
        Some(Commands::Stop) => daemon::cmd_stop(&api).await,
        Some(Commands::Status) => daemon::cmd_status(&api, cli.verbose).await,
        Some(Commands::Add(args)) => jobs::cmd_add(&api, args).await,
        Some(Commands::List { failed, json }) => jobs::cmd_list(&api, *failed, *json).await,
        Some(Commands::Show { job }) => jobs::cmd_show(&api, job).await,
        Some(Commands::Run { job }) => jobs::cmd_action(&api, JobAction::Run, job).await,
        Some(Commands::Pause { job }) => jobs::cmd_action(&api, JobAction::Pause, job).await,
        Some(Commands::Resume { job }) => jobs::cmd_action(&api, JobAction::Resume, job).await,
        Some(Commands::Halt { job }) => jobs::cmd_action(&api, JobAction::Halt, job).await,
        Some(Commands::Restart { job }) => jobs::cmd_action(&api, JobAction::Restart, job).await,
        Some(Commands::Approve { job }) => jobs::cmd_action(&api, JobAction::Approve, job).await,
        Some(Commands::Cancel { job }) => jobs::cmd_action(&api, JobAction::Cancel, job).await,
        Some(Commands::Remove { job }) => jobs::cmd_remove(&api, job).await,
        Some(Commands::RestartFailed) => jobs::cmd_restart_failed(&api).await,
        Some(Commands::CleanupInterrupted) => jobs::cmd_cleanup_interrupted(&api).await,
        Some(Commands::Logs { job, tail }) => jobs::cmd_logs(&api, job, *tail).await,
        Some(Commands::Progress { follow }) => jobs::cmd_progress(&api, *follow).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_version_flag() {
        let err = Cli::try_parse_from(["trm", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_cli_add_parses_rclone_job() {
        let cli = Cli::try_parse_from([
            "trm",
            "add",
            "-n",
            "photos",
            "-s",
            "/data/photos",
            "--dest",
            "b2:bucket/photos",
            "--tool",
            "rclone",
            "--operation",
            "sync",
            "-e",
            "*.tmp",
            "-e",
            ".cache",
            "--max-retries",
            "4",
            "--preview",
        ])
        .expect("Should parse add command");

        match cli.command {
            Some(Commands::Add(args)) => {
                assert_eq!(args.name, "photos");
                assert_eq!(args.destination, "b2:bucket/photos");
                assert_eq!(args.tool, Tool::Rclone);
                assert_eq!(args.operation.as_deref(), Some("sync"));
                assert_eq!(args.excludes, vec!["*.tmp", ".cache"]);
                assert_eq!(args.max_retries, Some(4));
                assert!(args.preview);
                assert!(!args.delete);
            }
            other => panic!("Expected Add command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_add_requires_paths() {
        assert!(Cli::try_parse_from(["trm", "add", "-n", "x", "-s", "/a"]).is_err());
    }

    #[test]
    fn test_cli_lifecycle_commands() {
        let cli = Cli::try_parse_from(["trm", "halt", "photos"]).expect("halt");
        assert!(matches!(cli.command, Some(Commands::Halt { ref job }) if job == "photos"));

        let cli = Cli::try_parse_from(["trm", "approve", "photos"]).expect("approve");
        assert!(matches!(cli.command, Some(Commands::Approve { .. })));
        assert_eq!(JobAction::Approve.endpoint(), "approve");
        assert_eq!(JobAction::Halt.endpoint(), "stop");
        assert_eq!(JobAction::Run.endpoint(), "start");
    }

    #[test]
    fn test_cli_list_and_logs_flags() {
        let cli = Cli::try_parse_from(["trm", "list", "--failed", "--json"]).expect("list");
        assert!(matches!(
            cli.command,
            Some(Commands::List {
                failed: true,
                json: true
            })
        ));

        let cli = Cli::try_parse_from(["trm", "logs", "photos", "--tail", "50"]).expect("logs");
        assert!(matches!(
            cli.command,
            Some(Commands::Logs { tail: Some(50), .. })
        ));
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["trm", "status", "--port", "9999", "--host", "0.0.0.0"])
            .expect("status");
        assert_eq!(cli.port, 9999);
        assert_eq!(cli.host, "0.0.0.0");
        assert!(matches!(cli.command, Some(Commands::Status)));
    }

    #[test]
    fn test_job_request_encodes_reference() {
        let api = ApiClient::new("127.0.0.1", 8377);
        let request = api
            .job_request(Method::POST, "my photos/2024", Some("pause"))
            .expect("request")
            .build()
            .expect("build");
        assert_eq!(
            request.url().as_str(),
            "http://127.0.0.1:8377/api/jobs/my%20photos%2F2024/pause"
        );
    }

    #[test]
    fn test_base_url_and_connection_message() {
        assert_eq!(base_url("127.0.0.1", 8377), "http://127.0.0.1:8377");
        let msg = connection_error_message("localhost", 8377);
        assert!(msg.contains("localhost:8377"));
        assert!(msg.contains("trm start"));
    }
}

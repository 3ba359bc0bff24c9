//! The kiln command-line client

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tonic::transport::Channel;
use tonic::Request;
use tracing_subscriber::EnvFilter;

use kiln_proto::{
    GetJobRequest, JobMetadata, JobTrigger, KilnServiceClient, ListJobsRequest, ListenRequest,
    ListenRequestLogs, LogSliceType, LoginRequest, StartLocalJobRequest, StopJobRequest,
};

#[derive(Parser, Debug)]
#[command(name = "kiln", about = "kiln is a Kubernetes-powered CI system")]
struct Cli {
    /// kiln server to talk to
    #[arg(long, global = true, default_value = "localhost:7777")]
    host: String,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the API token
    Login {
        /// User to log in as
        username: String,
    },
    /// Work with jobs
    #[command(subcommand)]
    Job(JobCommand),
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    /// Start a job from the local workspace
    Run {
        /// Job spec file
        #[arg(long, short, default_value = ".kiln/job.yaml")]
        file: PathBuf,
        /// Workspace directory shipped to the checkout step
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Stream the job's logs after starting it
        #[arg(long)]
        follow: bool,
    },
    /// List jobs
    List {
        #[arg(long, default_value_t = 50)]
        limit: i32,
    },
    /// Show a single job
    Get { name: String },
    /// Stream a job's logs
    Logs { name: String },
    /// Stop a running job
    Stop { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut client = connect(&cli.host).await?;

    match cli.command {
        Command::Login { username } => {
            let response = client
                .login(LoginRequest { username })
                .await
                .context("login failed")?;
            save_token(&response.into_inner().token)?;
            println!("logged in, token stored in {}", token_path()?.display());
        }
        Command::Job(job) => run_job_command(&mut client, job).await?,
    }

    Ok(())
}

async fn run_job_command(
    client: &mut KilnServiceClient<Channel>,
    command: JobCommand,
) -> anyhow::Result<()> {
    let token = load_token()?;

    match command {
        JobCommand::Run {
            file,
            workspace,
            follow,
        } => {
            let job_yaml = std::fs::read(&file)
                .with_context(|| format!("cannot read job spec {}", file.display()))?;
            let workspace_tar = tar_workspace(&workspace).await?;
            let metadata = JobMetadata {
                owner: whoami(),
                trigger: JobTrigger::TriggerManual as i32,
                ..Default::default()
            };

            let response = client
                .start_local_job(authed(
                    StartLocalJobRequest {
                        metadata: Some(metadata),
                        job_yaml,
                        workspace_tar,
                    },
                    &token,
                )?)
                .await
                .context("cannot start job")?;
            let status = response.into_inner().status.unwrap_or_default();
            println!("{}", status.name);

            if follow {
                stream_logs(client, &status.name, &token).await?;
            }
        }
        JobCommand::List { limit } => {
            let response = client
                .list_jobs(authed(
                    ListJobsRequest {
                        limit,
                        ..Default::default()
                    },
                    &token,
                )?)
                .await
                .context("cannot list jobs")?;
            let list = response.into_inner();
            println!("{:<40} {:<12} {:<10} {}", "NAME", "OWNER", "PHASE", "SUCCESS");
            for job in list.result {
                let phase = job.phase().as_str_name().trim_start_matches("PHASE_");
                let (owner, success) = job
                    .metadata
                    .map(|md| md.owner)
                    .map(|owner| {
                        (
                            owner,
                            job.conditions
                                .as_ref()
                                .map(|c| c.success.to_string())
                                .unwrap_or_default(),
                        )
                    })
                    .unwrap_or_default();
                println!("{:<40} {:<12} {:<10} {}", job.name, owner, phase, success);
            }
        }
        JobCommand::Get { name } => {
            let response = client
                .get_job(authed(GetJobRequest { name }, &token)?)
                .await
                .context("cannot get job")?;
            if let Some(job) = response.into_inner().result {
                println!("{job:#?}");
            }
        }
        JobCommand::Logs { name } => {
            stream_logs(client, &name, &token).await?;
        }
        JobCommand::Stop { name } => {
            client
                .stop_job(authed(StopJobRequest { name }, &token)?)
                .await
                .context("cannot stop job")?;
        }
    }

    Ok(())
}

async fn stream_logs(
    client: &mut KilnServiceClient<Channel>,
    name: &str,
    token: &str,
) -> anyhow::Result<()> {
    let response = client
        .listen(authed(
            ListenRequest {
                name: name.to_string(),
                updates: false,
                logs: ListenRequestLogs::LogsRaw as i32,
            },
            token,
        )?)
        .await
        .context("cannot listen to job")?;

    let mut stream = response.into_inner();
    while let Some(message) = stream.message().await? {
        let Some(kiln_proto::ListenContent::Slice(slice)) = message.content else {
            continue;
        };
        match slice.r#type() {
            LogSliceType::SlicePhase => println!("=== {} {}", slice.name, slice.payload),
            _ => println!("{}", slice.payload),
        }
    }
    Ok(())
}

/// Packs the workspace the way the checkout init step expects it.
async fn tar_workspace(dir: &PathBuf) -> anyhow::Result<Vec<u8>> {
    let output = tokio::process::Command::new("tar")
        .arg("-czf")
        .arg("-")
        .arg("-C")
        .arg(dir)
        .arg(".")
        .output()
        .await
        .context("cannot run tar")?;
    if !output.status.success() {
        anyhow::bail!(
            "tar failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

async fn connect(host: &str) -> anyhow::Result<KilnServiceClient<Channel>> {
    KilnServiceClient::connect(format!("http://{host}"))
        .await
        .with_context(|| format!("cannot connect to {host}"))
}

fn authed<T>(message: T, token: &str) -> anyhow::Result<Request<T>> {
    let mut request = Request::new(message);
    request.metadata_mut().insert(
        "authorization",
        token.parse().context("token contains invalid characters")?,
    );
    Ok(request)
}

fn token_path() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".kiln").join("token"))
}

fn save_token(token: &str) -> anyhow::Result<()> {
    let path = token_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, token)?;
    Ok(())
}

fn load_token() -> anyhow::Result<String> {
    let path = token_path()?;
    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("not logged in, run `kiln login` first ({})", path.display()))?;
    Ok(token.trim().to_string())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

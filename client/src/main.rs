use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{Artifact, Credentials, Job, JobRequest, ScheduleResponse, Task};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

/// - In a cluster: COORDINATOR_URL=http://coordinator:4750
/// - Locally: defaults to http://localhost:4750
fn coordinator_base_url() -> String {
    env::var("COORDINATOR_URL").unwrap_or_else(|_| "http://localhost:4750".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Command line client for the MapReduce coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Uploads an executable so jobs can reference it by name
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Artifact name, defaults to the file name
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "type")]
        artifact_type: Option<String>,
    },
    /// Lists uploaded artifacts
    Artifacts,
    /// Submits a job
    Submit {
        /// http(s)://<endpoint>/<bucket>/<object>
        #[arg(long)]
        input: String,
        /// Output location: [http(s)://]<endpoint>[/<bucket>]
        #[arg(long)]
        output: String,
        #[arg(long)]
        mapper: String,
        #[arg(long)]
        reducer: String,
        #[arg(long, default_value_t = 1)]
        reducers: u32,
        #[arg(long, default_value = "file/txt")]
        input_type: String,
        /// Split size in bytes, overrides the coordinator's default
        #[arg(long)]
        split_size: Option<u64>,
        #[arg(long)]
        ssl: bool,
        #[arg(long, env = "MR_STORAGE_USER")]
        user: String,
        #[arg(long, env = "MR_STORAGE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Polls the job until it finishes
        #[arg(long)]
        wait: bool,
    },
    /// Lists jobs
    Jobs,
    /// Shows one job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Shows the tasks of a job
    Tasks {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Asks the coordinator to stop a job
    Stop {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

async fn expect_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("coordinator answered {status}: {body}");
    }
    Ok(resp.json().await?)
}

fn print_job(job: &Job) {
    println!("Job {}", job.id);
    println!("  input:    {} ({})", job.input_data.path, job.input_data.input_type);
    println!("  output:   {}", job.output_location.location);
    println!("  reducers: {}", job.n_reducers);
    println!("  started:  {}", job.start_time);
    match job.end_time {
        Some(end) => println!("  finished: {end}"),
        None => println!("  finished: -"),
    }
}

fn print_tasks(tasks: &[Task]) {
    for t in tasks {
        println!("{:<60} {:<8} {:<12} {}", t.id, t.task_type, t.status.as_str(), t.pod_name);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = coordinator_base_url();

    match cli.command {
        Commands::Upload {
            file,
            name,
            artifact_type,
        } => {
            let name = match name {
                Some(n) => n,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("can't derive an artifact name from the file path")?,
            };
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;

            let mut req = client.put(format!("{}/api/v1/artifacts/{}", base_url, name)).body(content);
            if let Some(t) = artifact_type {
                req = req.query(&[("type", t)]);
            }
            let artifact: Artifact = expect_json(req.send().await?).await?;
            println!("Uploaded {} ({}, {} bytes, sha256 {})", artifact.name, artifact.artifact_type, artifact.size, artifact.hash);
        }
        Commands::Artifacts => {
            let resp = client.get(format!("{}/api/v1/artifacts", base_url)).send().await?;
            let artifacts: Vec<Artifact> = expect_json(resp).await?;
            for a in artifacts {
                println!("{:<30} {:<12} {:>10}  {}", a.name, a.artifact_type, a.size, a.hash);
            }
        }
        Commands::Submit {
            input,
            output,
            mapper,
            reducer,
            reducers,
            input_type,
            split_size,
            ssl,
            user,
            password,
            wait,
        } => {
            let creds = Credentials {
                username: user,
                password,
            };
            let request = JobRequest {
                n_reducers: reducers,
                input_path: input,
                input_type,
                output_path: output,
                use_ssl: ssl,
                mapper_name: mapper,
                reducer_name: reducer,
                input_storage_credentials: creds.clone(),
                output_storage_credentials: creds,
                split_size,
            };
            let resp = client.post(format!("{}/api/v1/jobs", base_url)).json(&request).send().await?;
            let created: ScheduleResponse = expect_json(resp).await?;
            print_job(&created.job);

            if wait {
                let url = format!("{}/api/v1/jobs/{}", base_url, created.job.id);
                // 1) consultar hasta que el job tenga hora de fin
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let job: Job = expect_json(client.get(&url).send().await?).await?;
                    if job.is_finished() {
                        print_job(&job);
                        break;
                    }
                    // 2) una tarea fallida significa que el job nunca termina
                    let tasks: Vec<Task> = expect_json(client.get(format!("{url}/tasks")).send().await?).await?;
                    if let Some(failed) = tasks.iter().find(|t| t.status == common::TaskStatus::Failed) {
                        print_tasks(&tasks);
                        bail!("task {} failed", failed.id);
                    }
                }
            }
        }
        Commands::Jobs => {
            let jobs: Vec<Job> = expect_json(client.get(format!("{}/api/v1/jobs", base_url)).send().await?).await?;
            for job in &jobs {
                let state = if job.is_finished() { "finished" } else { "running" };
                println!("{:<40} {:<9} {}", job.id, state, job.input_data.path);
            }
        }
        Commands::Status { id } => {
            let resp = client.get(format!("{}/api/v1/jobs/{id}", base_url)).send().await?;
            let job: Job = expect_json(resp).await?;
            print_job(&job);
        }
        Commands::Tasks { id } => {
            let resp = client.get(format!("{}/api/v1/jobs/{id}/tasks", base_url)).send().await?;
            let tasks: Vec<Task> = expect_json(resp).await?;
            print_tasks(&tasks);
        }
        Commands::Stop { id } => {
            let resp = client.delete(format!("{}/api/v1/jobs/{id}", base_url)).send().await?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                bail!("coordinator answered {status}: {body}");
            }
            println!("Job {id} stopped");
        }
    }

    Ok(())
}

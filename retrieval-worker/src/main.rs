use clap::{Parser, Subcommand};
use retrieval_worker::adaptor::AdaptorRegistry;
use retrieval_worker::config::{WorkerConfig, env_lookup};
use retrieval_worker::logging::{LogFormat, init_logging};
use retrieval_worker::scheduler::{EnvScheduler, Scheduler};
use retrieval_worker::volume::parse_data_volumes_config;
use retrieval_worker::worker::Worker;

#[derive(Debug, Parser)]
#[command(name = "retrieval-worker", version, about = "Run cached data-retrieval jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the job this process was dispatched for.
    Run {
        /// Job to run. Defaults to `JOB_ID`.
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Print the configured cache volumes, one per line.
    Volumes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(LogFormat::from_env_or(LogFormat::Json))?;

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    match cli.command {
        Command::Run { job_id } => {
            let scheduler = match job_id {
                Some(id) => EnvScheduler::new(Some(id)),
                None => EnvScheduler::from_env(),
            };
            let worker = Worker::connect(
                config,
                AdaptorRegistry::with_builtins(),
                scheduler.worker_identity(),
            )
            .await?;

            let outcome = worker.run_current(&scheduler).await?;
            println!("{}", outcome.cache_entry.result.urlpath);
        }
        Command::Volumes => {
            let volumes =
                parse_data_volumes_config(config.data_volumes_config.as_deref(), &env_lookup)?;
            for volume in volumes {
                println!("{volume}\t{}", volume.protocol().name());
            }
        }
    }

    Ok(())
}

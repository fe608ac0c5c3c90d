//! ailab CLI
//!
//! Runs the coordinator daemon and talks to it through its request queue and
//! exported status file.

use std::{collections::HashMap, path::Path, time::Duration};

use ailab_harness::{
    EntrySource,
    aggregator::{StatusEntry, StatusView},
    config,
    intake::{Intake, Request},
    job::{JobId, JobSpec},
    lab::Lab,
    watcher::Watcher,
};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ailab", about = "GPU job coordinator and experiment status service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator daemon
    Serve {
        /// Path to the config file (TOML, or JSON for the legacy layout)
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,
    },

    /// Queue a job
    Submit {
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,

        #[arg(short, long)]
        project: String,

        /// Working directory relative to the project root
        #[arg(short, long, default_value = ".")]
        workdir: String,

        #[arg(short, long, default_value_t = 0)]
        gpus: usize,

        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Experiment directory relative to the project's experiment tree
        #[arg(long)]
        experiment: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Seconds to wait for the daemon's reply
        #[arg(long, default_value_t = 10)]
        wait: u64,

        /// Command line to run
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Cancel a job
    Cancel {
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,

        /// Job id (`job-7` or `7`)
        job: JobId,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        password: Option<String>,

        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Show jobs, GPUs and experiments
    Status {
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,

        /// Print the raw status view as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow experiment progress with progress bars
    Watch {
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,
    },

    /// Scan experiment directories once, without a daemon
    Scan {
        #[arg(short, long, default_value = "ailab.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = config::load(&config)?;
            serve(config).await?;
        }

        Commands::Submit {
            config,
            project,
            workdir,
            gpus,
            priority,
            experiment,
            user,
            password,
            wait,
            command,
        } => {
            let config = config::load(&config)?;
            let mut spec = JobSpec::new(project, command.join(" "))
                .with_working_dir(workdir)
                .with_gpus(gpus)
                .with_priority(priority);
            if let Some(experiment) = experiment {
                spec = spec.with_experiment(experiment);
            }

            let request = Request {
                user,
                password,
                submit: Some(spec),
                ..Request::default()
            };
            send(&Intake::new(config.queue_dir()), &request, wait).await?;
        }

        Commands::Cancel {
            config,
            job,
            user,
            password,
            wait,
        } => {
            let config = config::load(&config)?;
            let request = Request {
                user,
                password,
                cancel: Some(job),
                ..Request::default()
            };
            send(&Intake::new(config.queue_dir()), &request, wait).await?;
        }

        Commands::Status { config, json } => {
            let config = config::load(&config)?;
            let view = read_status(&config.status_file())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }
            print_status(&view);
        }

        Commands::Watch { config } => {
            let config = config::load(&config)?;
            watch(&config.status_file(), config.scan_interval()).await?;
        }

        Commands::Scan { config } => {
            let config = config::load(&config)?;
            let mut watcher = Watcher::new(&config);
            watcher.scan(chrono::Local::now());

            let records = watcher.records();
            if records.is_empty() {
                println!("No experiments found.");
            }
            for record in records.values() {
                let entry = StatusEntry {
                    key: record.key(),
                    project: record.project.clone(),
                    source: EntrySource::Logs,
                    job: None,
                    record: Some(record.clone()),
                };
                println!("{}", describe(&entry));
            }
        }
    }

    Ok(())
}

async fn serve(config: ailab_config::LabConfig) -> Result<(), Box<dyn std::error::Error>> {
    let status_file = config.status_file();
    let intake = Intake::new(config.queue_dir());
    let poll_interval = config.scan_interval();
    println!("Serving {} projects on {} GPUs", config.projects.len(), config.gpus.len());

    let lab = Lab::start(config).await?;
    let mut updates = lab.subscribe();
    let mut tick = tokio::time::interval(poll_interval);
    write_status(&status_file, &lab.query())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            _ = tick.tick() => {
                if let Err(e) = intake.poll(&lab) {
                    tracing::error!("request queue: {e}");
                }
            }
            alive = updates.changed() => {
                if !alive {
                    break;
                }
                if let Err(e) = write_status(&status_file, &lab.query()) {
                    tracing::error!("failed to export status: {e}");
                }
            }
        }
    }

    lab.shutdown().await?;
    Ok(())
}

async fn send(intake: &Intake, request: &Request, wait: u64) -> Result<(), Box<dyn std::error::Error>> {
    let archived = intake.send(request)?;
    match Intake::wait_reply(&archived, Duration::from_secs(wait)).await {
        Some(reply) => println!("{reply}"),
        None => println!("Request queued; no reply yet (is `ailab serve` running?)"),
    }
    Ok(())
}

fn write_status(path: &Path, view: &StatusView) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(view)?)?;
    std::fs::rename(&tmp, path)
}

fn read_status(path: &Path) -> Result<StatusView, Box<dyn std::error::Error>> {
    let body = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {} (is `ailab serve` running?): {e}", path.display()))?;
    Ok(serde_json::from_str(&body)?)
}

/// One-line summary of an entry.
fn describe(entry: &StatusEntry) -> String {
    let mut line = format!("{:40}", entry.key);

    if let Some(job) = &entry.job {
        line.push_str(&format!(" [{} {}]", job.id, job.state));
    }
    if let Some(record) = &entry.record {
        if let Some(progress) = record.progress {
            line.push_str(&format!(" {:5.1}%", progress * 100.0));
        }
        if let Some(eta) = record.eta_secs {
            line.push_str(&format!(" eta {eta}s"));
        }
        if let (Some(name), Some(value)) = (&record.primary, record.primary_value()) {
            line.push_str(&format!(" {name}={value:.4}"));
        }
        for (name, scalar) in record.secondary() {
            line.push_str(&format!(" {name}={:.4}", scalar.value));
        }
        if record.stale {
            line.push_str(" (stale)");
        }
    }
    line
}

fn print_status(view: &StatusView) {
    println!("=== ailab status ({}) ===", view.generated_at);
    println!();
    println!("GPUs: {}/{} free", view.gpus.free.len(), view.gpus.total);
    for (gpu, job) in &view.gpus.assigned {
        println!("  gpu {gpu}: {job}");
    }
    if let Some(load) = &view.load {
        println!("CPU {:.1}%  RAM {:.1}%", load.cpu_percent, load.memory_percent);
        for gpu in &load.gpus {
            println!(
                "  gpu {}: load {:.0}%  mem {:.1}% ({}/{} MiB)",
                gpu.gpu,
                gpu.utilization,
                gpu.memory_percent(),
                gpu.memory_used_mib,
                gpu.memory_total_mib
            );
        }
    }

    println!();
    if view.jobs.is_empty() {
        println!("No jobs.");
    }
    for job in &view.jobs {
        print!("{}: {} [{}]", job.id, job.state, job.spec.project);
        if !job.gpus.is_empty() {
            print!(" gpus={:?}", job.gpus);
        }
        if let Some(pid) = job.pid {
            print!(" (PID: {pid})");
        }
        println!(" {}", job.spec.command);
        if let Some(error) = &job.error {
            for line in error.lines() {
                println!("  Error: {line}");
            }
        }
    }

    println!();
    for entry in &view.entries {
        println!("{}", describe(entry));
    }
}

async fn watch(status_file: &Path, interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg:60} [{wide_bar:.cyan/blue}] {percent:>3}%")?
        .progress_chars("#*-");
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    loop {
        match read_status(status_file) {
            Ok(view) => {
                for entry in &view.entries {
                    let bar = bars.entry(entry.key.clone()).or_insert_with(|| {
                        let pb = multi.add(ProgressBar::new(1000));
                        pb.set_style(style.clone());
                        pb
                    });
                    let progress = entry.record.as_ref().and_then(|r| r.progress).unwrap_or(0.0);
                    bar.set_position((progress * 1000.0).round() as u64);
                    bar.set_message(describe(entry));
                }
            }
            Err(e) => tracing::warn!("{e}"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    for bar in bars.values() {
        bar.abandon();
    }
    Ok(())
}

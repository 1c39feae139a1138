/// Command line interface for houdini
use crate::container::Container;
use crate::process::ProcessLauncher;
use crate::types::{BindMount, ContainerSpec, ProcessSpec, TtySpec, WindowSize};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "houdini")]
#[command(about = "Run host processes behind a container-style lifecycle, without isolation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a container, run one program in it and destroy it again
    Run {
        /// Directory that holds container work dirs
        #[arg(long)]
        depot: PathBuf,

        /// Container spec (JSON)
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Container handle (defaults to the spec's, or a fresh UUID)
        #[arg(long)]
        handle: Option<String>,

        /// Bind mount, can be repeated: --bind SOURCE:DEST[:ro|:rw]
        #[arg(long = "bind", value_name = "BINDING")]
        binds: Vec<String>,

        /// Environment variable, can be repeated: --env VAR=VALUE
        #[arg(short = 'E', long = "env", value_name = "VAR=VALUE")]
        env_vars: Vec<String>,

        /// Working directory, relative to the container work dir
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Attach a pseudo-terminal of the given size, e.g. 80x24
        #[arg(long, value_name = "COLSxROWS")]
        tty: Option<WindowSize>,

        /// Keep the work dir after the container is destroyed
        #[arg(long)]
        keep: bool,

        /// Program to run
        program: String,

        /// Arguments for the program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Apply and remove a container's bind mounts, printing the teardown report
    Mounts {
        /// Directory that holds container work dirs
        #[arg(long)]
        depot: PathBuf,

        /// Container spec (JSON)
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Bind mount, can be repeated: --bind SOURCE:DEST[:ro|:rw]
        #[arg(long = "bind", value_name = "BINDING")]
        binds: Vec<String>,
    },
}

fn load_container_spec(spec: Option<&Path>, binds: &[String]) -> anyhow::Result<ContainerSpec> {
    let mut container_spec = match spec {
        Some(path) => ContainerSpec::from_file(path)?,
        None => ContainerSpec::default(),
    };
    for binding in binds {
        container_spec.bind_mounts.push(BindMount::parse(binding)?);
    }
    Ok(container_spec)
}

/// Parse arguments, run the command and return the exit code for the caller
pub fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            depot,
            spec,
            handle,
            binds,
            env_vars,
            dir,
            tty,
            keep,
            program,
            args,
        } => {
            let mut container_spec = load_container_spec(spec.as_deref(), &binds)?;
            if let Some(handle) = handle {
                container_spec.handle = handle;
            }

            let mut process = ProcessSpec::new(program).args(args);
            process.dir = dir;
            for var in &env_vars {
                let (key, value) = var
                    .split_once('=')
                    .with_context(|| format!("Invalid environment variable '{}', expected VAR=VALUE", var))?;
                process = process.env(key, value);
            }
            if let Some(size) = tty {
                process = process.tty(TtySpec {
                    window_size: Some(size),
                });
            }

            let launcher = Arc::new(ProcessLauncher::new()?);
            let mut container = Container::create(&depot, container_spec, launcher)
                .context("Failed to create container")?;
            container.set_keep_work_dir(keep);
            log::info!("Container {} ready at {}", container.handle(), container.work_dir().display());

            let outcome = run_in_container(&container, process);
            let report = container.destroy()?;
            if !report.is_clean() {
                eprintln!("Warning: {} bind mount(s) could not be removed", report.warnings.len());
            }

            let code = outcome?;
            Ok(code)
        }

        Commands::Mounts { depot, spec, binds } => {
            let container_spec = load_container_spec(spec.as_deref(), &binds)?;
            let launcher = Arc::new(ProcessLauncher::new()?);
            let container = Container::create(&depot, container_spec, launcher)
                .context("Failed to apply bind mounts")?;
            let report = container.destroy()?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.is_clean() { 0 } else { 1 })
        }
    }
}

fn run_in_container(container: &Container, process: ProcessSpec) -> anyhow::Result<i32> {
    let (handle, mut stdin) = container.run(process, Box::new(io::stdout()), Box::new(io::stderr()))?;

    // Detached: a read on our stdin may block past the child's exit
    std::thread::Builder::new()
        .name("houdini-stdin".to_string())
        .spawn(move || {
            if let Err(e) = io::copy(&mut io::stdin().lock(), &mut stdin).and_then(|_| stdin.flush()) {
                log::debug!("Stopped forwarding stdin: {}", e);
            }
        })
        .context("Failed to start stdin relay")?;

    let (status, totals) = handle.wait_with_output()?;
    log::info!(
        "Process {} exited with code {} ({} bytes stdout, {} bytes stderr)",
        handle.id(),
        status.code,
        totals.stdout,
        totals.stderr
    );
    if let Some(usage) = &status.usage {
        log::debug!("Resource usage: {:?}", usage);
    }
    Ok(status.code)
}

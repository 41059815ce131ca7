use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::AppContext;
use crate::core::{ArgumentItem, ArgumentSource, Job, JobDescriptor, JobId, JobState, Metadata};

const HELP: &str = "\
Commands:
  add <input> <output|-> [preset:<id> | <output args...>]
  list                      show every job
  show <id>                 details of one job
  start|pause|stop <id|all>
  reset <id>                fresh idle copy of a stopped, finished or errored job
  remove <id|all>
  limit <n>                 change how many jobs may run at once
  probe <path>              media metadata of a file
  presets                   configured presets
  fail <id> <reason>        make the simulated worker fail a job
  help
  quit";

/// Which jobs a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Full id, unique prefix or short id
    One(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Add {
        input: PathBuf,
        /// `None` discards the output
        output: Option<PathBuf>,
        source: ArgumentSource,
    },
    List,
    Show(String),
    Start(Target),
    Pause(Target),
    Stop(Target),
    Reset(String),
    Remove(Target),
    Limit(usize),
    Probe(PathBuf),
    Presets,
    Fail { id: String, reason: String },
    Help,
    Quit,
}

/// What the console prints after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

/// Parse one console line. Blank lines give `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let target = |rest: &[&str]| -> Result<Target> {
        match rest {
            ["all"] => Ok(Target::All),
            [id] => Ok(Target::One(id.to_string())),
            _ => bail!("usage: {verb} <id|all>"),
        }
    };
    let single = |rest: &[&str], usage: &str| -> Result<String> {
        match rest {
            [value] => Ok(value.to_string()),
            _ => bail!("usage: {verb} {usage}"),
        }
    };

    let command = match verb {
        "add" => {
            let [input, output, args @ ..] = rest.as_slice() else {
                bail!("usage: add <input> <output|-> [preset:<id> | <output args...>]");
            };
            let source = match args {
                [] => ArgumentSource::Auto,
                [arg] if arg.starts_with("preset:") => {
                    ArgumentSource::FromPreset(arg.trim_start_matches("preset:").to_string())
                }
                args => ArgumentSource::Custom(args.join(" ")),
            };
            ConsoleCommand::Add {
                input: PathBuf::from(input),
                output: (*output != "-").then(|| PathBuf::from(output)),
                source,
            }
        }
        "list" | "ls" => ConsoleCommand::List,
        "show" => ConsoleCommand::Show(single(&rest, "<id>")?),
        "start" => ConsoleCommand::Start(target(&rest)?),
        "pause" => ConsoleCommand::Pause(target(&rest)?),
        "stop" => ConsoleCommand::Stop(target(&rest)?),
        "reset" => ConsoleCommand::Reset(single(&rest, "<id>")?),
        "remove" | "rm" => ConsoleCommand::Remove(target(&rest)?),
        "limit" => {
            let value = single(&rest, "<n>")?;
            let limit: usize = value
                .parse()
                .with_context(|| format!("'{value}' is not a number"))?;
            if limit == 0 {
                bail!("limit must be at least 1");
            }
            ConsoleCommand::Limit(limit)
        }
        "probe" => ConsoleCommand::Probe(PathBuf::from(single(&rest, "<path>")?)),
        "presets" => ConsoleCommand::Presets,
        "fail" => {
            let [id, reason @ ..] = rest.as_slice() else {
                bail!("usage: fail <id> <reason>");
            };
            let reason = if reason.is_empty() {
                "simulated failure".to_string()
            } else {
                reason.join(" ")
            };
            ConsoleCommand::Fail {
                id: id.to_string(),
                reason,
            }
        }
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command '{other}', try 'help'"),
    };

    Ok(Some(command))
}

pub struct Console {
    ctx: AppContext,
}

impl Console {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Read commands from stdin until `quit`, end of input, or `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("transq ready, type 'help' for commands");

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read stdin")?,
                _ = shutdown.cancelled() => break,
            };
            let Some(line) = line else {
                debug!("stdin closed");
                break;
            };

            let command = match parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    println!("error: {e}");
                    continue;
                }
            };

            match self.execute(command).await {
                Ok(Reply::Text(text)) => println!("{text}"),
                Ok(Reply::Quit) => break,
                Err(e) => println!("error: {e:#}"),
            }
        }

        Ok(())
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Reply> {
        let registry = &self.ctx.registry;

        let text = match command {
            ConsoleCommand::Add {
                input,
                output,
                source,
            } => {
                if let ArgumentSource::FromPreset(id) = &source {
                    let presets = registry.presets().await;
                    match presets.iter().find(|p| &p.id == id) {
                        Some(preset) if !preset.fits_output() => {
                            bail!("preset '{id}' is for inputs only")
                        }
                        Some(_) => {}
                        None => bail!("no preset '{id}', see 'presets'"),
                    }
                }
                let output = match output {
                    Some(path) => ArgumentItem::new(path, source),
                    None => ArgumentItem::null_output(source),
                };
                let job = registry
                    .add_job(JobDescriptor::simple(ArgumentItem::auto(input), output))
                    .await;
                format!("added {}", job.short_id())
            }
            ConsoleCommand::List => {
                let jobs = registry.list().await;
                if jobs.is_empty() {
                    "no jobs".to_string()
                } else {
                    let running = registry.running_count().await;
                    let limit = registry.concurrency_limit().await;
                    let mut out = format!("{running}/{limit} running");
                    for job in &jobs {
                        write!(out, "\n{}", summary(job))?;
                    }
                    out
                }
            }
            ConsoleCommand::Show(id) => {
                let id = self.resolve(&id).await?;
                let job = registry
                    .get(id)
                    .await
                    .ok_or_else(|| anyhow!("job {id} not found"))?;
                details(&job)?
            }
            ConsoleCommand::Start(target) => self.command(target, Verb::Start).await?,
            ConsoleCommand::Pause(target) => self.command(target, Verb::Pause).await?,
            ConsoleCommand::Stop(target) => self.command(target, Verb::Stop).await?,
            ConsoleCommand::Reset(id) => {
                let id = self.resolve(&id).await?;
                match registry.reset_job(id).await {
                    Some(job) => format!("reset, new id {}", job.short_id()),
                    None => "only stopped, finished or errored jobs can be reset".to_string(),
                }
            }
            ConsoleCommand::Remove(Target::All) => {
                format!("removed {} jobs", registry.remove_all_jobs().await)
            }
            ConsoleCommand::Remove(Target::One(id)) => {
                let id = self.resolve(&id).await?;
                match registry.remove_job(id).await {
                    Some(job) => format!("removed {}", job.short_id()),
                    None => format!("job {id} not found"),
                }
            }
            ConsoleCommand::Limit(limit) => {
                registry.set_concurrency_limit(limit).await;
                format!("limit set to {limit}")
            }
            ConsoleCommand::Probe(path) => {
                let metadata = registry
                    .probe_metadata(&path)
                    .await
                    .with_context(|| format!("Failed to probe {}", path.display()))?;
                render_metadata(&metadata)?
            }
            ConsoleCommand::Presets => {
                let presets = registry.presets().await;
                if presets.is_empty() {
                    "no presets configured".to_string()
                } else {
                    presets
                        .iter()
                        .map(|p| {
                            format!(
                                "{:<12} {:<24} {:<9} {}",
                                p.id,
                                p.name,
                                format!("{:?}", p.preset_type).to_lowercase(),
                                p.args.join(" ")
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ConsoleCommand::Fail { id, reason } => {
                let simulator = self
                    .ctx
                    .simulator
                    .as_ref()
                    .ok_or_else(|| anyhow!("fail is only available with --simulation"))?;
                let id = self.resolve(&id).await?;
                simulator.fail(id, &reason).await?;
                format!("failure injected for {id}")
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return Ok(Reply::Quit),
        };

        Ok(Reply::Text(text))
    }

    async fn command(&self, target: Target, verb: Verb) -> Result<String> {
        let registry = &self.ctx.registry;

        let id = match target {
            Target::All => {
                let count = match verb {
                    Verb::Start => registry.start_all_jobs().await,
                    Verb::Pause => registry.pause_all_jobs().await,
                    Verb::Stop => registry.stop_all_jobs().await,
                };
                return Ok(format!("{} {count} jobs", verb.as_str()));
            }
            Target::One(id) => self.resolve(&id).await?,
        };

        let state = match verb {
            Verb::Start => registry.start_job(id).await,
            Verb::Pause => registry.pause_job(id).await,
            Verb::Stop => registry.stop_job(id).await,
        }?;
        Ok(format!("{id}: {state}"))
    }

    /// Find the job meant by a full id, an id prefix or a short id.
    async fn resolve(&self, needle: &str) -> Result<JobId> {
        let needle = needle.to_lowercase();
        let matches: Vec<JobId> = self
            .ctx
            .registry
            .list()
            .await
            .iter()
            .filter(|job| {
                job.id.to_string().starts_with(&needle)
                    || job.id.simple().to_string().starts_with(&needle)
                    || job.short_id() == needle
            })
            .map(|job| job.id)
            .collect();

        match matches.as_slice() {
            [id] => Ok(*id),
            [] => bail!("no job matches '{needle}'"),
            _ => bail!("'{needle}' matches {} jobs, use more digits", matches.len()),
        }
    }
}

#[derive(Clone, Copy)]
enum Verb {
    Start,
    Pause,
    Stop,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "started",
            Verb::Pause => "paused",
            Verb::Stop => "stopped",
        }
    }
}

fn item_label(item: &ArgumentItem) -> String {
    item.path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(null)".to_string())
}

fn summary(job: &Job) -> String {
    let inputs: Vec<String> = job.descriptor.inputs.iter().map(item_label).collect();
    let outputs: Vec<String> = job.descriptor.outputs.iter().map(item_label).collect();
    let busy = if job.is_commanding() { "*" } else { " " };
    format!(
        "{}{} {:<28} {} -> {}",
        job.short_id(),
        busy,
        job.state.to_string(),
        inputs.join(", "),
        outputs.join(", ")
    )
}

fn details(job: &Job) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "id:       {}", job.id)?;
    writeln!(out, "state:    {}", job.state)?;
    writeln!(out, "created:  {}", job.created_at.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "elapsed:  {}s", job.elapsed(Utc::now()).num_seconds())?;

    for (label, items) in [("input", &job.descriptor.inputs), ("output", &job.descriptor.outputs)] {
        for item in items {
            let args = match &item.source {
                ArgumentSource::Auto => "auto".to_string(),
                ArgumentSource::Custom(args) => format!("custom: {args}"),
                ArgumentSource::FromPreset(id) => format!("preset: {id}"),
            };
            writeln!(out, "{label:<9} {} ({args})", item_label(item))?;
        }
    }

    if let Some(message) = job.state.last_message() {
        write!(
            out,
            "progress: frame {} fps {} speed {}",
            display(message.frame),
            display(message.fps),
            display(message.speed.map(|s| format!("{s}x")))
        )?;
    }
    if let JobState::Errored { reason } = &job.state {
        write!(out, "reason:   {reason}")?;
    }

    Ok(out.trim_end().to_string())
}

fn display<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn render_metadata(metadata: &Metadata) -> Result<String> {
    let format = &metadata.format;
    let mut out = String::new();
    writeln!(
        out,
        "{} ({})",
        format.filename.as_deref().unwrap_or("-"),
        format
            .format_long_name
            .as_deref()
            .or(format.format_name.as_deref())
            .unwrap_or("unknown format")
    )?;
    writeln!(
        out,
        "duration {}s, size {} bytes, bitrate {}",
        display(format.duration),
        display(format.size),
        display(format.bit_rate)
    )?;

    for stream in &metadata.streams {
        write!(
            out,
            "  #{} {} {}",
            stream.index,
            stream.codec_type.as_deref().unwrap_or("?"),
            stream.codec_name.as_deref().unwrap_or("?")
        )?;
        if let (Some(w), Some(h)) = (stream.width, stream.height) {
            write!(out, " {w}x{h}")?;
        }
        if let Some(rate) = stream.sample_rate {
            write!(out, " {rate} Hz")?;
        }
        if let Some(channels) = stream.channels {
            write!(out, " {channels} ch")?;
        }
        writeln!(out)?;
    }

    Ok(out.trim_end().to_string())
}

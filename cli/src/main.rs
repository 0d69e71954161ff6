use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier::jobs::{JobOpts, JobStore};
use courier::mail::{LogMailer, SmtpMailer};
use courier::templates::{EmailTemplate, Renderer, TemplateId, TemplateSource};
use courier::{CourierConfig, EmailData, EmailService, JobState, Mailer, Priority};
use log::LevelFilter;
use serde_json::{json, Value};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "courier", about = "Preview and send transactional email")]
struct Cli {
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in templates.
    Templates,

    /// Render a template to stdout without sending it.
    Render {
        #[arg(value_name = "template")]
        template: String,

        /// JSON file with the template variables, or `-` for stdin.
        #[arg(long)]
        vars: Option<PathBuf>,

        /// Also print the HTML body.
        #[arg(long, default_value_t = false)]
        html: bool,
    },

    /// Queue one email and wait for its outcome.
    Send {
        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long)]
        template: String,

        #[arg(long)]
        vars: Option<PathBuf>,

        #[arg(long)]
        cc: Vec<String>,

        /// low, normal, high or critical.
        #[arg(long)]
        priority: Option<String>,

        /// Log the message instead of handing it to SMTP.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("initializing logger")?;

    match cli.command {
        Commands::Templates => {
            let renderer = Renderer::new("");
            let compiled = renderer.precompile_all()?;
            for id in renderer.templates() {
                println!("{:<22} {}", id.as_str(), TemplateSource::builtin(id).subject);
            }
            log::info!("{compiled} templates compiled");
        }
        Commands::Render {
            template,
            vars,
            html,
        } => {
            let config = CourierConfig::load()?;
            let id: TemplateId = template.parse()?;
            let vars = read_vars(vars)?;
            let rendered = Renderer::new(config.app_name).render_value(id, &vars)?;
            println!("Subject: {}\n", rendered.subject);
            println!("{}", rendered.text);
            if html {
                println!("\n{}", rendered.html);
            }
        }
        Commands::Send {
            to,
            template,
            vars,
            cc,
            priority,
            dry_run,
            timeout,
        } => {
            let config = CourierConfig::load()?;
            let template = parse_template(&template, vars)?;
            let mut data = EmailData::new(to, template);
            data.cc = cc;

            let mut opts = JobOpts::default();
            if let Some(priority) = priority {
                opts = opts.priority(parse_priority(&priority)?);
            }

            let timeout = Duration::from_secs(timeout);
            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            if dry_run {
                runtime.block_on(send(config, LogMailer, data, opts, timeout))?;
            } else {
                let mailer = SmtpMailer::from_env(config.max_connections)?;
                runtime.block_on(send(config, mailer, data, opts, timeout))?;
            }
        }
    }
    Ok(())
}

fn read_vars(path: Option<PathBuf>) -> Result<Value> {
    let raw = match path {
        None => return Ok(json!({})),
        Some(path) if path.as_os_str() == "-" => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("reading variables from stdin")?;
            raw
        }
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading variables from {}", path.display()))?,
    };
    serde_json::from_str(&raw).context("parsing template variables")
}

fn parse_template(name: &str, vars: Option<PathBuf>) -> Result<EmailTemplate> {
    let id: TemplateId = name.parse()?;
    let vars = read_vars(vars)?;
    log::debug!("{id} variables: {vars}");
    serde_json::from_value(json!({ "template": id, "variables": vars }))
        .with_context(|| format!("variables do not match the {id} template"))
}

fn parse_priority(raw: &str) -> Result<Priority> {
    serde_json::from_value(json!(raw.to_lowercase()))
        .with_context(|| format!("unknown priority {raw:?}"))
}

/// Uses the Redis queue when `COURIER_REDIS_URL` is set and the `redis`
/// feature is on, otherwise an in-process queue.
async fn send<M: Mailer>(
    config: CourierConfig,
    mailer: M,
    data: EmailData,
    opts: JobOpts,
    timeout: Duration,
) -> Result<()> {
    #[cfg(feature = "redis")]
    if let Some(store) = config.redis_store()? {
        log::info!("queueing through redis");
        let service = EmailService::new(config, store, mailer);
        return send_and_wait(service, data, opts, timeout).await;
    }

    let service = EmailService::in_memory(config, mailer);
    send_and_wait(service, data, opts, timeout).await
}

async fn send_and_wait<S: JobStore, M: Mailer>(
    service: EmailService<S, M>,
    data: EmailData,
    opts: JobOpts,
    timeout: Duration,
) -> Result<()> {
    let id = service.send_email(data, opts).await?;
    log::info!("queued job {id}");

    let waited = tokio::time::timeout(timeout, async {
        loop {
            let job = service.get_job_status(id).await?;
            if job.state.is_terminal() {
                return Ok::<_, courier::Error>(job);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    service.close().await;

    let job = match waited {
        Ok(job) => job?,
        Err(_) => bail!("job {id} did not finish within {}s", timeout.as_secs()),
    };
    println!("{}", serde_json::to_string_pretty(&job)?);
    if job.state == JobState::Failed {
        bail!(
            "delivery failed: {}",
            job.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

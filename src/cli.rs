//! Command line surface. Every command prints one JSON document on stdout;
//! progress and logs go to stderr.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

use crate::batch::{run_batch, BatchOptions};
use crate::client::{Attachment, MailGoatClient, SendRequest};
use crate::config::{self, Profile, DEFAULT_CONFIG_PATH};
use crate::db::{self, DEFAULT_DB_PATH};
use crate::model::BatchRecord;
use crate::payload::{BatchTemplate, TemplatePayloadBuilder};
use crate::progress::{NoProgress, ProgressReporter, TerminalProgress};
use crate::recipients::{load_recipients, RecipientSource};
use crate::templates::{self, DEFAULT_TEMPLATE_DIR};

#[derive(Debug, Parser)]
#[command(name = "mailgoat", author, version, about)]
pub struct Cli {
    /// Batch ledger database
    #[arg(long, global = true, env = "MAILGOAT_DB", default_value = DEFAULT_DB_PATH)]
    pub db_path: String,

    /// Profile file
    #[arg(long, global = true, env = "MAILGOAT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Directory holding `.hbs` templates
    #[arg(long, global = true, env = "MAILGOAT_TEMPLATES", default_value = DEFAULT_TEMPLATE_DIR)]
    pub templates_dir: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one message per recipient row
    SendBatch(SendBatchArgs),
    /// Inspect recorded batches
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Send a single message
    Send(SendArgs),
    /// Fetch a message by id
    Read {
        message_id: String,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Manage local templates
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Manage server profiles
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[arg(long, env = "MAILGOAT_SERVER")]
    pub server: Option<String>,
    #[arg(long, env = "MAILGOAT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// Profile to use instead of the default one
    #[arg(long)]
    pub profile: Option<String>,
}

#[derive(Debug, Args)]
pub struct SendBatchArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long = "csv")]
    pub csv_path: Option<PathBuf>,
    #[arg(long = "json")]
    pub json_path: Option<PathBuf>,
    /// Read a JSON array of recipients from stdin
    #[arg(long = "stdin")]
    pub use_stdin: bool,
    /// JSON file with `subject`, `body` and `from`
    #[arg(long = "template", conflicts_with = "template_name")]
    pub template_path: Option<PathBuf>,
    /// Name of a stored `.hbs` template
    #[arg(long)]
    pub template_name: Option<String>,
    #[arg(long)]
    pub continue_on_error: bool,
    /// Messages per second
    #[arg(long)]
    pub rate_limit: Option<f64>,
    #[arg(long)]
    pub error_log: Option<PathBuf>,
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Debug, Subcommand)]
pub enum BatchCommand {
    Status { batch_id: String },
    Errors { batch_id: String },
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Args)]
pub struct SendArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long, required = true)]
    pub to: Vec<String>,
    #[arg(long)]
    pub subject: Option<String>,
    #[arg(long)]
    pub body: Option<String>,
    #[arg(long)]
    pub from: Option<String>,
    #[arg(long)]
    pub template: Option<String>,
    #[arg(long = "var")]
    pub vars: Vec<String>,
    #[arg(long)]
    pub vars_file: Option<PathBuf>,
    #[arg(long = "attach")]
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum TemplateCommand {
    List,
    Show {
        name: String,
    },
    Render {
        name: String,
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long)]
        vars_file: Option<PathBuf>,
    },
    Validate {
        name: String,
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long)]
        vars_file: Option<PathBuf>,
    },
    Create {
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "")]
        from: String,
        #[arg(long)]
        body: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Add or replace a profile; missing fields are prompted for
    Add {
        name: String,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        from_address: Option<String>,
        #[arg(long)]
        from_name: Option<String>,
        #[arg(long)]
        default: bool,
    },
    List,
    Use {
        name: String,
    },
}

/// Connection details after merging flags with the selected profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server: String,
    pub api_key: String,
    pub from_address: Option<String>,
}

/// Execute a parsed command and return the process exit code.
pub async fn run(
    cli: Cli,
    cancel: Option<watch::Receiver<bool>>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<i32> {
    let config_path = config::config_path(Some(&cli.config));
    let template_dir = templates::template_dir(Some(&cli.templates_dir));
    let db_path = PathBuf::from(&cli.db_path);

    match cli.command {
        Command::SendBatch(args) => {
            send_batch(args, &config_path, &template_dir, &db_path, cancel, input, out).await
        }
        Command::Batch(cmd) => batch_command(cmd, &db_path, out).await,
        Command::Send(args) => send_one(args, &config_path, &template_dir, out).await,
        Command::Read { message_id, server } => {
            let creds = resolve_credentials(&server, &config_path)?;
            let client = MailGoatClient::new(&creds.server, &creds.api_key)?;
            let message = client
                .read(&message_id)
                .await
                .with_context(|| format!("failed to read message {message_id}"))?;
            print_json(out, &serde_json::to_value(&message)?)?;
            Ok(0)
        }
        Command::Template(cmd) => template_command(cmd, &template_dir, out),
        Command::Profile(cmd) => profile_command(cmd, &config_path, input, out),
    }
}

/// Flags win over the profile; a profile is only loaded when a flag is missing.
pub fn resolve_credentials(args: &ServerArgs, config_path: &Path) -> Result<Credentials> {
    if let (Some(server), Some(api_key), None) = (&args.server, &args.api_key, &args.profile) {
        return Ok(Credentials {
            server: server.clone(),
            api_key: api_key.clone(),
            from_address: None,
        });
    }

    let cfg = config::load(config_path)
        .with_context(|| format!("failed to load profiles from {}", config_path.display()))?;
    let name = args
        .profile
        .as_deref()
        .or_else(|| cfg.default_profile_name())
        .ok_or_else(|| {
            anyhow!("no server configured; pass --server and --api-key or add a profile")
        })?;
    let profile = cfg.get_profile(name)?;
    Ok(Credentials {
        server: args.server.clone().unwrap_or_else(|| profile.server.clone()),
        api_key: args.api_key.clone().unwrap_or_else(|| profile.api_key.clone()),
        from_address: profile.from_address.clone(),
    })
}

async fn send_batch(
    args: SendBatchArgs,
    config_path: &Path,
    template_dir: &Path,
    db_path: &Path,
    cancel: Option<watch::Receiver<bool>>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<i32> {
    let stdin_data = if args.use_stdin {
        let mut data = String::new();
        input
            .read_to_string(&mut data)
            .context("failed to read recipients from stdin")?;
        Some(data)
    } else {
        None
    };
    let recipients = load_recipients(&RecipientSource {
        csv_path: args.csv_path.clone(),
        json_path: args.json_path.clone(),
        stdin_data,
    })?;

    let template = match (&args.template_path, &args.template_name) {
        (Some(path), _) => Some(
            BatchTemplate::load(path)
                .with_context(|| format!("failed to load template {}", path.display()))?,
        ),
        (None, Some(name)) => Some(BatchTemplate::from_template(&templates::load_template(
            name,
            template_dir,
        )?)),
        (None, None) => None,
    };

    let creds = resolve_credentials(&args.server, config_path)?;
    let client = MailGoatClient::new(&creds.server, &creds.api_key)?;
    let pool = db::open(db_path)
        .await
        .with_context(|| format!("failed to open batch database {}", db_path.display()))?;

    let builder = TemplatePayloadBuilder::new(template);
    let progress: Box<dyn ProgressReporter> = if args.no_progress {
        Box::new(NoProgress)
    } else {
        Box::new(TerminalProgress)
    };
    let options = BatchOptions {
        continue_on_error: args.continue_on_error,
        rate_limit: args.rate_limit,
        error_log_path: args.error_log.clone(),
        default_from_address: creds.from_address.clone(),
        cancel,
    };

    let result = run_batch(
        &pool,
        &client,
        &recipients,
        &builder,
        &options,
        progress.as_ref(),
    )
    .await;

    match result {
        Ok(summary) => {
            print_json(out, &serde_json::to_value(&summary)?)?;
            Ok(0)
        }
        Err(err) => {
            let Some(batch_id) = err.batch_id().map(str::to_string) else {
                return Err(err.into());
            };
            let record = db::get_batch(&pool, &batch_id).await?;
            let mut doc = json!({ "error": err.to_string(), "batch_id": batch_id });
            if let Some(record) = record {
                doc["status"] = json!(record.status);
                doc["total"] = json!(record.total_count);
                doc["sent"] = json!(record.sent_count);
                doc["failed"] = json!(record.failed_count);
            }
            print_json(out, &doc)?;
            Ok(1)
        }
    }
}

async fn batch_command(cmd: BatchCommand, db_path: &Path, out: &mut dyn Write) -> Result<i32> {
    let pool = db::open(db_path)
        .await
        .with_context(|| format!("failed to open batch database {}", db_path.display()))?;

    match cmd {
        BatchCommand::Status { batch_id } => match db::get_batch(&pool, &batch_id).await? {
            Some(record) => {
                print_json(out, &record_json(&record))?;
                Ok(0)
            }
            None => not_found(out, &batch_id),
        },
        BatchCommand::Errors { batch_id } => {
            if db::get_batch(&pool, &batch_id).await?.is_none() {
                return not_found(out, &batch_id);
            }
            let entries = db::list_errors(&pool, &batch_id).await?;
            print_json(out, &serde_json::to_value(&entries)?)?;
            Ok(0)
        }
        BatchCommand::List { limit } => {
            let records = db::list_batches(&pool, limit).await?;
            let docs: Vec<Value> = records.iter().map(record_json).collect();
            print_json(out, &Value::Array(docs))?;
            Ok(0)
        }
    }
}

fn record_json(record: &BatchRecord) -> Value {
    json!({
        "batch_id": record.batch_id,
        "status": record.status,
        "total": record.total_count,
        "sent": record.sent_count,
        "failed": record.failed_count,
        "continue_on_error": record.continue_on_error,
        "rate_limit": record.rate_limit,
        "started_at": record.started_at,
        "finished_at": record.finished_at,
    })
}

fn not_found(out: &mut dyn Write, batch_id: &str) -> Result<i32> {
    print_json(out, &json!({ "error": "batch not found", "batch_id": batch_id }))?;
    Ok(1)
}

async fn send_one(
    args: SendArgs,
    config_path: &Path,
    template_dir: &Path,
    out: &mut dyn Write,
) -> Result<i32> {
    let creds = resolve_credentials(&args.server, config_path)?;

    let (subject, body, template_from) = match &args.template {
        Some(name) => {
            let template = templates::load_template(name, template_dir)?;
            let vars = templates::parse_vars(&args.vars, args.vars_file.as_deref())?;
            let (body, warnings) = templates::render_template(&template, &vars);
            for warning in warnings {
                tracing::warn!(template = %name, "{warning}");
            }
            let subject = match &args.subject {
                Some(subject) => subject.clone(),
                None => templates::render_text(
                    &template.metadata_text("subject").unwrap_or_default(),
                    &vars,
                ),
            };
            (subject, body, template.metadata_text("from"))
        }
        None => {
            let subject = args
                .subject
                .clone()
                .ok_or_else(|| anyhow!("--subject is required without --template"))?;
            let body = args
                .body
                .clone()
                .ok_or_else(|| anyhow!("--body is required without --template"))?;
            (subject, body, None)
        }
    };

    let mut attachments = Vec::with_capacity(args.attachments.len());
    for path in &args.attachments {
        attachments.push(Attachment::from_path(path).await?);
    }

    let request = SendRequest {
        to: args.to.clone(),
        subject,
        body,
        from_address: args
            .from
            .clone()
            .or(template_from)
            .or(creds.from_address.clone())
            .filter(|f| !f.is_empty()),
        attachments,
    };
    let client = MailGoatClient::new(&creds.server, &creds.api_key)?;
    let message_id = client
        .send_message(&request)
        .await
        .context("failed to send message")?;
    print_json(out, &json!({ "message_id": message_id, "to": request.to }))?;
    Ok(0)
}

fn template_command(cmd: TemplateCommand, dir: &Path, out: &mut dyn Write) -> Result<i32> {
    match cmd {
        TemplateCommand::List => {
            let names = templates::list_templates(dir)?;
            print_json(out, &json!(names))?;
            Ok(0)
        }
        TemplateCommand::Show { name } => {
            let template = templates::load_template(&name, dir)?;
            print_json(
                out,
                &json!({
                    "name": template.name,
                    "path": template.path,
                    "metadata": template.metadata,
                    "body": template.body,
                }),
            )?;
            Ok(0)
        }
        TemplateCommand::Render {
            name,
            vars,
            vars_file,
        } => {
            let template = templates::load_template(&name, dir)?;
            let vars = templates::parse_vars(&vars, vars_file.as_deref())?;
            let subject = templates::render_text(
                &template.metadata_text("subject").unwrap_or_default(),
                &vars,
            );
            let (body, warnings) = templates::render_template(&template, &vars);
            print_json(
                out,
                &json!({ "subject": subject, "body": body, "warnings": warnings }),
            )?;
            Ok(0)
        }
        TemplateCommand::Validate {
            name,
            vars,
            vars_file,
        } => {
            let template = templates::load_template(&name, dir)?;
            let vars = templates::parse_vars(&vars, vars_file.as_deref())?;
            let errors = templates::validate_template(&template, &vars);
            let valid = errors.is_empty();
            print_json(out, &json!({ "name": name, "valid": valid, "errors": errors }))?;
            Ok(if valid { 0 } else { 1 })
        }
        TemplateCommand::Create {
            name,
            subject,
            from,
            body,
        } => {
            let path = templates::create_template(&name, &subject, &from, &body, dir)?;
            print_json(out, &json!({ "name": name, "path": path }))?;
            Ok(0)
        }
    }
}

fn profile_command(
    cmd: ProfileCommand,
    config_path: &Path,
    mut input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<i32> {
    let mut cfg = config::load(config_path)
        .with_context(|| format!("failed to load profiles from {}", config_path.display()))?;

    match cmd {
        ProfileCommand::Add {
            name,
            server,
            api_key,
            from_address,
            from_name,
            default,
        } => {
            if name.trim().is_empty() {
                bail!("profile name must be non-empty");
            }
            let profile = match (server, api_key) {
                (Some(server), Some(api_key)) => Profile {
                    server,
                    api_key,
                    from_address,
                    from_name,
                },
                _ => config::prompt_for_profile(&mut input, &mut std::io::stderr())?,
            };
            cfg.add_profile(&name, profile, default);
            config::save(&cfg, config_path)?;
            let is_default = cfg.default_profile_name() == Some(name.as_str());
            print_json(out, &json!({ "profile": name, "default": is_default }))?;
            Ok(0)
        }
        ProfileCommand::List => {
            let default = cfg.default_profile_name();
            let docs: Vec<Value> = cfg
                .list_profiles()
                .into_iter()
                .map(|(name, profile)| {
                    json!({
                        "name": name,
                        "server": profile.server,
                        "from_address": profile.from_address,
                        "from_name": profile.from_name,
                        "default": default == Some(name),
                    })
                })
                .collect();
            print_json(out, &Value::Array(docs))?;
            Ok(0)
        }
        ProfileCommand::Use { name } => {
            cfg.set_default(&name)?;
            config::save(&cfg, config_path)?;
            print_json(out, &json!({ "default_profile": name }))?;
            Ok(0)
        }
    }
}

fn print_json(out: &mut dyn Write, value: &Value) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

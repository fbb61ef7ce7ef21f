use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use photoquest_contracts::events::{EventSink, JsonlEventWriter, NullEventSink};
use photoquest_contracts::photos::JsonlPhotoLog;
use photoquest_contracts::progress::{JsonProgressLedger, ProgressLedger};
use photoquest_engine::{
    CancelFlag, ChallengeUpload, PhotoQuestEngine, UploadError, UploadOutcome,
    VerificationRequest, VerifierConfig,
};
use serde_json::{json, Value};
use uuid::Uuid;

const EXIT_VALID: i32 = 0;
const EXIT_REJECTED: i32 = 2;
const EXIT_CONFLICT: i32 = 3;
const EXIT_RATE_LIMITED: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "photoquest", version, about = "Wedding photo challenge verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Verify(VerifyArgs),
    Analyze(AnalyzeArgs),
    Progress(ProgressArgs),
    ResetProgress(ProgressArgs),
}

#[derive(Debug, Parser)]
struct VerifyArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long, requires = "participant", requires = "ledger")]
    challenge: Option<String>,
    #[arg(long, requires = "challenge")]
    participant: Option<String>,
    #[arg(long, requires = "challenge")]
    ledger: Option<PathBuf>,
    /// Photo log; defaults to photos.jsonl next to the ledger.
    #[arg(long, requires = "challenge")]
    photos: Option<PathBuf>,
    #[arg(long, requires = "challenge")]
    persist_rejected: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ProgressArgs {
    #[arg(long)]
    ledger: PathBuf,
    #[arg(long)]
    challenge: String,
    #[arg(long)]
    participant: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("photoquest error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Verify(args) => run_verify(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Progress(args) => run_progress(args),
        Command::ResetProgress(args) => run_reset_progress(args),
    }
}

fn run_verify(args: VerifyArgs) -> Result<i32> {
    let engine = PhotoQuestEngine::new(
        VerifierConfig::from_env(),
        event_sink(args.events.as_deref()),
    );
    let request = VerificationRequest::new(&args.image, &args.title, &args.description);

    let (Some(challenge_id), Some(participant), Some(ledger)) =
        (args.challenge, args.participant, args.ledger)
    else {
        let outcome = engine.challenge_policy().verify(&request, &CancelFlag::new());
        print_json(&outcome.verdict.to_value())?;
        return Ok(if outcome.verdict.is_valid() {
            EXIT_VALID
        } else {
            EXIT_REJECTED
        });
    };

    let photos = args.photos.unwrap_or_else(|| default_photo_log(&ledger));
    let service = engine
        .upload_service(
            Arc::new(JsonProgressLedger::new(ledger)),
            Arc::new(JsonlPhotoLog::new(photos)),
        )
        .persist_rejected(args.persist_rejected);
    let upload = ChallengeUpload {
        challenge_id,
        participant,
        request,
    };
    let (report, code) = upload_report(service.handle(&upload, &CancelFlag::new()))?;
    print_json(&report)?;
    Ok(code)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let engine = PhotoQuestEngine::new(
        VerifierConfig::from_env(),
        event_sink(args.events.as_deref()),
    );
    println!("{}", engine.gallery_policy().analyze_photo_content(&args.image));
    Ok(0)
}

fn run_progress(args: ProgressArgs) -> Result<i32> {
    let ledger = JsonProgressLedger::new(&args.ledger);
    let Some(progress) = ledger.get(&args.challenge, &args.participant)? else {
        bail!(
            "no progress for challenge '{}' and participant '{}'",
            args.challenge,
            args.participant
        );
    };
    print_json(&serde_json::to_value(progress)?)?;
    Ok(0)
}

fn run_reset_progress(args: ProgressArgs) -> Result<i32> {
    let ledger = JsonProgressLedger::new(&args.ledger);
    let Some(progress) = ledger.get(&args.challenge, &args.participant)? else {
        bail!(
            "no progress for challenge '{}' and participant '{}'",
            args.challenge,
            args.participant
        );
    };
    let progress = ledger
        .reset(&progress.id)
        .with_context(|| format!("failed resetting progress {}", progress.id))?;
    print_json(&serde_json::to_value(progress)?)?;
    Ok(0)
}

fn event_sink(path: Option<&Path>) -> Arc<dyn EventSink> {
    match path {
        Some(path) => Arc::new(JsonlEventWriter::new(path, session_id())),
        None => Arc::new(NullEventSink),
    }
}

fn session_id() -> String {
    format!("session-{}", Uuid::new_v4().simple())
}

fn default_photo_log(ledger: &Path) -> PathBuf {
    ledger
        .parent()
        .map(|dir| dir.join("photos.jsonl"))
        .unwrap_or_else(|| PathBuf::from("photos.jsonl"))
}

/// JSON report and exit code for one upload. Storage failures surface as errors.
fn upload_report(result: Result<UploadOutcome, UploadError>) -> Result<(Value, i32)> {
    match result {
        Ok(UploadOutcome::Completed {
            verdict,
            progress,
            photo,
        }) => Ok((
            json!({
                "status": "completed",
                "verdict": verdict.to_value(),
                "progress": serde_json::to_value(progress)?,
                "photo": serde_json::to_value(photo)?,
            }),
            EXIT_VALID,
        )),
        Ok(UploadOutcome::Rejected {
            verdict,
            progress,
            photo,
        }) => Ok((
            json!({
                "status": "rejected",
                "verdict": verdict.to_value(),
                "progress": serde_json::to_value(progress)?,
                "photo": serde_json::to_value(photo)?,
            }),
            EXIT_REJECTED,
        )),
        Err(err) => {
            let message = err.to_string();
            match err {
                UploadError::AlreadyCompleted { progress } => Ok((
                    json!({
                        "status": "conflict",
                        "message": message,
                        "progress": serde_json::to_value(progress)?,
                    }),
                    EXIT_CONFLICT,
                )),
                UploadError::RateLimited { .. } => Ok((
                    json!({
                        "status": "rate_limited",
                        "message": message,
                    }),
                    EXIT_RATE_LIMITED,
                )),
                UploadError::Storage(err) => Err(err.context("upload failed")),
            }
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

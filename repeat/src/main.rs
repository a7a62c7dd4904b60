use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local};
use clap::{Args, Parser, Subcommand};
use repeat::core::{NextState, RepeatChoice, Repetition};
use repeat::projectors::review_queue_projector;
use repeat::storage::FsNoteStore;
use repeat::summary::fully_summarize_due_at;
use repeat::parser::is_repeat_disabled;
use repeat::{
    NoteSchedule, Settings, apply_choice, due_repetition, get_choices, parse_repeat, read_note,
    schedule_note, strip_frontmatter,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "repeat",
    about = "Spaced-repetition and periodic review for Markdown notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings JSON file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Treat this RFC 3339 timestamp as the current time.
    #[arg(long, global = true)]
    now: Option<DateTime<FixedOffset>>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the repetition read from one or more notes.
    Parse(ParseArgs),

    /// List due notes under a directory, in review order.
    Due(DueArgs),

    /// Show the review choices for a note.
    Choices(NoteArgs),

    /// Apply a review choice to a note.
    Review(ReviewArgs),

    /// Give a note a new repeat directive, due one period from now, or turn it off with `never`.
    Set(SetArgs),

    /// Print a note without its metadata header.
    Body(NoteArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown notes to read.
    #[arg(required = true)]
    notes: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DueArgs {
    /// Directory of Markdown notes.
    root: PathBuf,
    /// Only print the number of due notes.
    #[arg(long)]
    count: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NoteArgs {
    note: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ReviewArgs {
    note: PathBuf,
    /// 1-based index into the list printed by `choices`.
    #[arg(long)]
    choice: usize,
    /// Overwrite the note instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct SetArgs {
    note: PathBuf,
    /// Repeat directive, e.g. "every mon, wed, fri" or "spaced every 2 days".
    directive: String,
    /// Overwrite the note instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

/// Shared inputs of every command.
struct Session {
    settings: Settings,
    now: DateTime<FixedOffset>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let now = cli.now.unwrap_or_else(|| Local::now().fixed_offset());
    debug!(%now, ?settings, "starting");
    let ctx = Session { settings, now };

    match cli.command {
        Commands::Parse(args) => handle_parse(args, &ctx),
        Commands::Due(args) => handle_due(args, &ctx),
        Commands::Choices(args) => handle_choices(args, &ctx),
        Commands::Review(args) => handle_review(args, &ctx),
        Commands::Set(args) => handle_set(args, &ctx),
        Commands::Body(args) => handle_body(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn handle_parse(args: ParseArgs, ctx: &Session) -> Result<()> {
    let ParseArgs { notes, json } = args;

    let mut parsed = Vec::new();
    for path in notes {
        let content = load_note(&path)?;
        let schedule = read_note(&content, &ctx.settings, *ctx.now.offset());
        parsed.push((path, schedule));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            status: &'static str,
            repetition: Option<&'a Repetition>,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, schedule)| JsonOutput {
                path: path.display().to_string(),
                status: status_name(schedule),
                repetition: schedule.repetition(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, schedule) in &parsed {
            println!("{}: {}", path.display(), describe_schedule(schedule, ctx.now));
        }
    }
    Ok(())
}

fn status_name(schedule: &NoteSchedule) -> &'static str {
    match schedule {
        NoteSchedule::Scheduled(r) if r.is_virtual => "virtual",
        NoteSchedule::Scheduled(_) => "scheduled",
        NoteSchedule::Disabled => "disabled",
        NoteSchedule::Unscheduled => "unscheduled",
    }
}

fn describe_schedule(schedule: &NoteSchedule, now: DateTime<FixedOffset>) -> String {
    let Some(repetition) = schedule.repetition() else {
        return status_name(schedule).to_string();
    };
    let due = match repetition.due_at {
        Some(due_at) => fully_summarize_due_at(due_at, now),
        None => "never scheduled".to_string(),
    };
    let mut line = format!("{} ({due})", repetition.schedule);
    if repetition.is_virtual {
        line.push_str(" [virtual]");
    }
    if repetition.hidden {
        line.push_str(" [hidden]");
    }
    line
}

fn handle_due(args: DueArgs, ctx: &Session) -> Result<()> {
    let DueArgs { root, count, json } = args;
    let store = FsNoteStore::new(&root)?;
    let items = review_queue_projector::project_due_notes(&store, &ctx.settings, ctx.now)
        .with_context(|| format!("building review queue for {:?}", root))?;

    if count {
        println!("{}", items.len());
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        eprintln!("No notes are due.");
        return Ok(());
    }
    for item in items {
        println!(
            "{:<28} {:<32} {}",
            item.summary,
            item.repetition.schedule.to_string(),
            item.path.display()
        );
    }
    Ok(())
}

fn note_choices(path: &Path, ctx: &Session) -> Result<(String, Vec<RepeatChoice>)> {
    let content = load_note(path)?;
    let repetition = due_repetition(&content, &ctx.settings, ctx.now);
    let choices = get_choices(repetition.as_ref(), &ctx.settings, ctx.now);
    Ok((content, choices))
}

fn handle_choices(args: NoteArgs, ctx: &Session) -> Result<()> {
    let (_, choices) = note_choices(&args.note, ctx)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&choices)?);
    } else {
        for (idx, choice) in choices.iter().enumerate() {
            println!("{}. {}", idx + 1, choice.label);
        }
    }
    Ok(())
}

fn handle_review(args: ReviewArgs, ctx: &Session) -> Result<()> {
    let ReviewArgs {
        note,
        choice,
        in_place,
    } = args;
    let (content, choices) = note_choices(&note, ctx)?;
    let selected = resolve_choice(&choices, choice)?;
    debug!(label = %selected.label, "applying review choice");
    let updated = apply_choice(&content, &selected.next)
        .with_context(|| format!("updating {:?}", note))?;
    emit_note(&note, &updated, in_place)
}

fn handle_set(args: SetArgs, ctx: &Session) -> Result<()> {
    let SetArgs {
        note,
        directive,
        in_place,
    } = args;
    let content = load_note(&note)?;
    let result = if is_repeat_disabled(&directive) {
        debug!(%directive, "turning repetition off");
        apply_choice(&content, &NextState::Never)
    } else {
        let schedule = parse_repeat(&directive, &ctx.settings.default_repeat);
        debug!(%directive, %schedule, "setting repetition");
        schedule_note(&content, schedule, &ctx.settings, ctx.now)
    };
    let updated = result.with_context(|| format!("updating {:?}", note))?;
    emit_note(&note, &updated, in_place)
}

fn handle_body(args: NoteArgs) -> Result<()> {
    let content = load_note(&args.note)?;
    let body = strip_frontmatter(&content);
    if args.json {
        println!("{}", serde_json::to_string_pretty(body)?);
    } else {
        print!("{body}");
    }
    Ok(())
}

fn load_note(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn resolve_choice(choices: &[RepeatChoice], index: usize) -> Result<&RepeatChoice> {
    if index == 0 || index > choices.len() {
        anyhow::bail!(
            "choice {index} is out of range; pick 1 to {}",
            choices.len()
        );
    }
    Ok(&choices[index - 1])
}

fn emit_note(path: &Path, content: &str, in_place: bool) -> Result<()> {
    if in_place {
        fs::write(path, content.as_bytes()).with_context(|| format!("writing {:?}", path))?;
        eprintln!("Updated {:?}", path);
    } else {
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Session {
        Session {
            settings: Settings::default(),
            now: DateTime::parse_from_rfc3339("2024-01-05T10:00:00+00:00").expect("now"),
        }
    }

    #[test]
    fn resolve_choice_is_one_based() {
        let choices = vec![
            RepeatChoice::new("Skip", NextState::Dismiss),
            RepeatChoice::new("Never", NextState::Never),
        ];
        assert_eq!(resolve_choice(&choices, 2).expect("choice").label, "Never");
        assert!(resolve_choice(&choices, 0).is_err());
        assert!(resolve_choice(&choices, 3).is_err());
    }

    #[test]
    fn review_in_place_rewrites_the_note() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("card.md");
        fs::write(
            &path,
            "---\nrepeat: daily\ndue_at: 2024-01-05T06:00:00+00:00\n---\nQ?\n",
        )
        .expect("write note");

        let (_, choices) = note_choices(&path, &ctx()).expect("choices");
        assert_eq!(choices.len(), 2);

        handle_review(
            ReviewArgs {
                note: path.clone(),
                choice: 2,
                in_place: true,
            },
            &ctx(),
        )
        .expect("review");

        assert_eq!(
            fs::read_to_string(&path).expect("read note"),
            "---\nrepeat: daily\ndue_at: 2024-01-06T06:00:00+00:00\nhidden: false\n---\nQ?\n"
        );
    }

    #[test]
    fn set_in_place_adds_a_header() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("note.md");
        fs::write(&path, "# Note\n").expect("write note");

        handle_set(
            SetArgs {
                note: path.clone(),
                directive: "every week in the evening".into(),
                in_place: true,
            },
            &ctx(),
        )
        .expect("set");

        assert_eq!(
            fs::read_to_string(&path).expect("read note"),
            "---\nrepeat: every week in the evening\ndue_at: 2024-01-12T18:00:00+00:00\nhidden: false\n---\n# Note\n"
        );
    }

    #[test]
    fn set_disabled_value_turns_repetition_off() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("note.md");
        fs::write(&path, "---\nrepeat: daily\ndue_at: 2024-01-05T06:00:00+00:00\n---\nbody\n")
            .expect("write note");

        handle_set(
            SetArgs {
                note: path.clone(),
                directive: "Never".into(),
                in_place: true,
            },
            &ctx(),
        )
        .expect("set");

        let content = fs::read_to_string(&path).expect("read note");
        assert_eq!(
            content,
            "---\nrepeat: never\ndue_at: 2024-01-05T06:00:00+00:00\n---\nbody\n"
        );
        assert_eq!(
            read_note(&content, &ctx().settings, *ctx().now.offset()),
            NoteSchedule::Disabled
        );
    }

    #[test]
    fn listed_notes_without_due_date_can_be_reviewed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fresh = tmp.path().join("fresh.md");
        let plain = tmp.path().join("plain.md");
        fs::write(&fresh, "---\nrepeat: daily\n---\n").expect("write fresh");
        fs::write(&plain, "just text\n").expect("write plain");

        let session = Session {
            settings: Settings {
                enqueue_non_repeating_notes: true,
                ..Settings::default()
            },
            ..ctx()
        };

        let store = FsNoteStore::new(tmp.path()).expect("store");
        let due = review_queue_projector::project_due_notes(&store, &session.settings, session.now)
            .expect("queue");
        assert_eq!(due.len(), 2);

        let (_, choices) = note_choices(&fresh, &session).expect("choices");
        let labels: Vec<&str> = choices.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Skip 5 minutes", "20 hours"]);

        let (_, choices) = note_choices(&plain, &session).expect("choices");
        assert_eq!(choices.len(), 6);
        assert_eq!(choices[5].label, "Never");

        handle_review(
            ReviewArgs {
                note: plain.clone(),
                choice: 6,
                in_place: true,
            },
            &session,
        )
        .expect("review");
        assert_eq!(
            fs::read_to_string(&plain).expect("read plain"),
            "---\nrepeat: never\n---\njust text\n"
        );
    }

    #[test]
    fn describe_schedule_reports_state() {
        let now = ctx().now;
        let settings = Settings::default();
        let scheduled = read_note(
            "---\nrepeat: weekly\ndue_at: 2024-01-05T08:00:00+00:00\nhidden: true\n---\n",
            &settings,
            *now.offset(),
        );
        assert_eq!(
            describe_schedule(&scheduled, now),
            "weekly (Overdue by 2 hours) [hidden]"
        );
        assert_eq!(describe_schedule(&NoteSchedule::Disabled, now), "disabled");
    }
}

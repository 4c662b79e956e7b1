use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use dashpatch::config::{LogFormat, Settings};
use dashpatch::display::sanitize;
use dashpatch::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Settings file (default: $DASHPATCH_CONFIG, then ./dashpatch.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log output format (overrides [log].format)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply one or more patches to a dashboard and write it back atomically
    Apply {
        /// Dashboard JSON file
        #[arg(long)]
        dashboard: PathBuf,
        /// Patch file (.json/.toml), a directory of patches, or '-' for JSON on stdin
        #[arg(long, required = true)]
        patch: Vec<PathBuf>,
        /// Print the structural diff instead of writing
        #[arg(long)]
        dry_run: bool,
        /// Write the result here instead of replacing the dashboard
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate patches; with a dashboard, also verify they apply cleanly and idempotently
    Check {
        #[arg(long, required = true)]
        patch: Vec<PathBuf>,
        #[arg(long)]
        dashboard: Option<PathBuf>,
    },
    /// List panels: id, type, grid position and title
    Panels {
        #[arg(long)]
        dashboard: PathBuf,
    },
    /// Rewrite a dashboard in canonical form
    Fmt {
        #[arg(long)]
        dashboard: PathBuf,
        /// Exit non-zero instead of writing when the file is not canonical
        #[arg(long)]
        check: bool,
    },
}

const FMT_CHECK_FAILED: u8 = 8;

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let args = Args::parse();

    let settings = match dashpatch::config::discover(args.config.as_deref()) {
        Ok(s) => s,
        Err(e) => return report(&e),
    };
    if let Err(e) = dashpatch::logging::init(&settings.log, args.log_format) {
        eprintln!("error: {e}");
    }

    let res = match args.cmd {
        Command::Apply {
            dashboard,
            patch,
            dry_run,
            output,
        } => cmd_apply(&settings, &dashboard, &patch, dry_run, output.as_deref()),
        Command::Check { patch, dashboard } => cmd_check(&patch, dashboard.as_deref()),
        Command::Panels { dashboard } => cmd_panels(&dashboard),
        Command::Fmt { dashboard, check } => cmd_fmt(&settings, &dashboard, check),
    };
    match res {
        Ok(code) => code,
        Err(e) => report(&e),
    }
}

fn report(e: &Error) -> ExitCode {
    eprintln!("error [{}]: {e}", e.kind());
    ExitCode::from(e.exit_code())
}

fn cmd_apply(
    settings: &Settings,
    dashboard: &Path,
    patch_args: &[PathBuf],
    dry_run: bool,
    output: Option<&Path>,
) -> Result<ExitCode> {
    // Everything is read and applied before anything is written.
    let doc = dashpatch::load(dashboard)?;
    let patches = dashpatch::patch::load_all(patch_args)?;
    let (next, reports) = dashpatch::apply_all(&doc, &patches)?;

    for r in &reports {
        println!(
            "{:<28} mutated={:<3} created={:<3} removed={:<3} skipped={:<3} {}",
            sanitize(&r.patch, 28),
            r.mutated.len(),
            r.created.len(),
            r.removed.len(),
            r.skipped.len(),
            if r.changed { "changed" } else { "unchanged" }
        );
    }

    if dry_run {
        let changes = dashpatch::diff::diff(&doc.value, &next.value);
        if changes.is_empty() {
            println!("no changes");
        } else {
            print!("{}", dashpatch::diff::render_changes(&changes));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let target = output.unwrap_or(dashboard);
    let body = next.to_json_string(&settings.output)?;
    if settings.apply.skip_unchanged
        && fs::read(target).is_ok_and(|existing| existing == body.as_bytes())
    {
        tracing::info!(path = %target.display(), "dashboard already up to date");
        return Ok(ExitCode::SUCCESS);
    }
    dashpatch::dashboard::atomic_write_text(target, &body)?;
    tracing::info!(
        path = %target.display(),
        before = %doc.digest(&settings.output)?,
        after = %dashpatch::dashboard::sha256_hex(body.as_bytes()),
        "wrote dashboard"
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_check(patch_args: &[PathBuf], dashboard: Option<&Path>) -> Result<ExitCode> {
    let patches = dashpatch::patch::load_all(patch_args)?;
    for p in &patches {
        println!(
            "{:<28} panels={:<3} remove={:<3} dashboard={}",
            sanitize(&p.name, 28),
            p.panels.len(),
            p.remove.len(),
            if p.dashboard.is_some() { "yes" } else { "no" }
        );
        if let Some(description) = &p.description {
            println!("    {}", sanitize(description, 100));
        }
    }

    let Some(dashboard) = dashboard else {
        return Ok(ExitCode::SUCCESS);
    };
    let doc = dashpatch::load(dashboard)?;
    let (once, _) = dashpatch::apply_all(&doc, &patches)?;
    let (twice, _) = dashpatch::apply_all(&once, &patches)?;
    if let Some(change) = dashpatch::diff::diff(&once.value, &twice.value).into_iter().next() {
        return Err(Error::NonIdempotentPatch {
            patch: "<sequence>".to_string(),
            path: change.path,
        });
    }
    println!(
        "ok: {} change(s) against {}",
        dashpatch::diff::diff(&doc.value, &once.value).len(),
        dashboard.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_panels(dashboard: &Path) -> Result<ExitCode> {
    let doc = dashpatch::load(dashboard)?;
    for s in doc.summaries() {
        let id = s.id.map_or_else(|| "-".to_string(), |id| id.to_string());
        let grid = s.grid.map_or_else(String::new, |g| {
            format!("{}x{}@{},{}", g.w, g.h, g.x, g.y)
        });
        let indent = if s.row.is_some() { "  " } else { "" };
        println!(
            "{indent}{:>4}  {:<12} {:<12} {}",
            id,
            sanitize(&s.kind, 12),
            grid,
            sanitize(&s.title, 80)
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_fmt(settings: &Settings, dashboard: &Path, check: bool) -> Result<ExitCode> {
    let raw = dashpatch::dashboard::read_text(dashboard)?;
    let doc = dashpatch::Dashboard::parse(dashboard, &raw)?;
    let body = doc.to_json_string(&settings.output)?;
    if body == raw {
        return Ok(ExitCode::SUCCESS);
    }
    if check {
        println!("{} is not in canonical form", dashboard.display());
        return Ok(ExitCode::from(FMT_CHECK_FAILED));
    }
    dashpatch::dashboard::atomic_write_text(dashboard, &body)?;
    tracing::info!(path = %dashboard.display(), "formatted dashboard");
    Ok(ExitCode::SUCCESS)
}

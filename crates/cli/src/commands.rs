//! Page subcommands.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::debug;

use ledger_core::commit::Commit;
use ledger_core::config::LedgerConfig;
use ledger_core::conflict::{
    ConflictResolverFactory, FixedPolicyFactory, PolicyFuture, ResolverRequest,
};
use ledger_core::models::{
    CommitId, ConflictResolutionWaitStatus, DiffMode, EntryChange, MergePolicy, PageId, Token,
};
use ledger_core::{Ledger, Page};

use super::style;
use super::Commands;

/// Keeps conflicts open while the tool inspects a page: every conflict is
/// handed to a resolver that never answers.
#[derive(Default)]
struct HoldingFactory {
    resolvers: Mutex<Vec<ResolverRequest>>,
}

impl ConflictResolverFactory for HoldingFactory {
    fn get_policy(&self, _page_id: &PageId) -> PolicyFuture {
        Box::pin(async { MergePolicy::Custom })
    }

    fn new_conflict_resolver(&self, page_id: &PageId, request: ResolverRequest) {
        debug!(page = %page_id, "holding conflicts open");
        if let Ok(mut resolvers) = self.resolvers.lock() {
            resolvers.push(request);
        }
    }
}

pub async fn run(config: &LedgerConfig, command: Commands) -> Result<()> {
    let ledger = Ledger::open(config).context("failed to open ledger")?;
    debug!(in_memory = config.storage.in_memory, "ledger opened");

    if !matches!(command, Commands::Resolve { .. }) {
        ledger.set_conflict_resolver_factory(Some(Arc::new(HoldingFactory::default())));
    }

    match command {
        Commands::Resolve { page, policy } => cmd_resolve(&ledger, &page, policy).await,
        Commands::Pages => cmd_pages(&ledger),
        Commands::Get { page, key } => {
            let page = open(&ledger, &page).await?;
            let snapshot = page.get_snapshot().await?;
            match snapshot.get(key.as_bytes()) {
                Some(value) => println!("{}", String::from_utf8_lossy(value)),
                None => anyhow::bail!("key '{}' not found", key),
            }
            Ok(())
        }
        Commands::Put {
            page,
            key,
            value,
            parent,
        } => {
            let page = open(&ledger, &page).await?;
            match parent {
                Some(parent) => {
                    let parent = find_commit(&page, &parent).await?;
                    let change = EntryChange::put(key.into_bytes(), value.into_bytes());
                    let id = page
                        .add_remote_commit(parent.id(), vec![change], Utc::now())
                        .await
                        .context("failed to add commit")?;
                    println!("{}", style::success(&format!("committed {}", short(&id))));
                }
                None => {
                    page.put(key.into_bytes(), value.into_bytes())
                        .await
                        .context("failed to put")?;
                    println!("{}", style::success("committed"));
                }
            }
            Ok(())
        }
        Commands::Delete { page, key } => {
            let page = open(&ledger, &page).await?;
            page.delete(key.into_bytes())
                .await
                .context("failed to delete")?;
            println!("{}", style::success("committed"));
            Ok(())
        }
        Commands::Entries { page, commit } => {
            let page = open(&ledger, &page).await?;
            cmd_entries(&page, commit.as_deref()).await
        }
        Commands::Heads { page } => {
            let page = open(&ledger, &page).await?;
            cmd_heads(&page).await
        }
        Commands::Log { page, limit } => {
            let page = open(&ledger, &page).await?;
            cmd_log(&page, limit).await
        }
        Commands::Diff {
            page,
            left,
            right,
            conflicting,
        } => {
            let page = open(&ledger, &page).await?;
            cmd_diff(&page, left.as_deref(), right.as_deref(), conflicting).await
        }
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_pages(ledger: &Ledger) -> Result<()> {
    let pages = ledger.list_pages().context("failed to list pages")?;
    if pages.is_empty() {
        println!("No pages found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Name"]);
    for id in &pages {
        table.add_row(vec![
            Cell::new(format!("hex:{id}")),
            Cell::new(String::from_utf8_lossy(id.as_bytes())),
        ]);
    }
    println!("{}", table);
    println!("{} page(s)", pages.len());
    Ok(())
}

async fn cmd_entries(page: &Page, commit: Option<&str>) -> Result<()> {
    let id = match commit {
        Some(prefix) => find_commit(page, prefix).await?.id().clone(),
        None => page.get_snapshot().await?.commit_id().clone(),
    };

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Key", "Value"]);

    let mut count = 0;
    let mut token: Option<Token> = None;
    loop {
        let (_, entries, next) = page
            .get_entries(&id, token.as_ref())
            .await
            .context("failed to read entries")?
            .into_parts();
        for entry in entries {
            table.add_row(vec![
                String::from_utf8_lossy(&entry.key).into_owned(),
                style::value(Some(entry.value.as_slice())),
            ]);
            count += 1;
        }
        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    println!("{}", style::header(&format!("Entries at {}", short(&id))));
    if count == 0 {
        println!("{}", style::dim("(empty)"));
    } else {
        println!("{}", table);
    }
    Ok(())
}

async fn cmd_heads(page: &Page) -> Result<()> {
    let status = page.status().await?;
    let heads = by_recency(page, &status.heads).await?;

    for head in &heads {
        println!(
            "{}  gen {:<4} {}",
            head.id(),
            head.generation(),
            head.timestamp().format("%Y-%m-%d %H:%M:%S%.3f")
        );
    }
    if heads.len() > 1 {
        println!();
        println!(
            "{}",
            style::warn(&format!(
                "{} divergent heads; run `ledger resolve` to merge them",
                heads.len()
            ))
        );
    }
    Ok(())
}

async fn cmd_log(page: &Page, limit: usize) -> Result<()> {
    let log = page.log().await.context("failed to read log")?;
    let heads = page.heads().await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Commit", "Gen", "Parents", "Changes", "Timestamp"]);
    for commit in log.iter().rev().take(limit) {
        let mut id = short(commit.id()).to_string();
        if heads.contains(commit.id()) {
            id.push_str(" (head)");
        }
        let parents: Vec<&str> = commit.parents().iter().map(short).collect();
        table.add_row(vec![
            Cell::new(id),
            Cell::new(commit.generation()),
            Cell::new(parents.join(" ")),
            Cell::new(commit.changes().len()),
            Cell::new(commit.timestamp().format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{}", table);
    println!("{} of {} commit(s) shown", limit.min(log.len()), log.len());
    Ok(())
}

async fn cmd_diff(
    page: &Page,
    left: Option<&str>,
    right: Option<&str>,
    conflicting: bool,
) -> Result<()> {
    let (left, right) = match (left, right) {
        (Some(left), Some(right)) => (
            find_commit(page, left).await?,
            find_commit(page, right).await?,
        ),
        (None, None) => {
            let heads = by_recency(page, &page.heads().await?).await?;
            match heads.as_slice() {
                [left, right, ..] => (left.clone(), right.clone()),
                _ => {
                    println!("Page has a single head; nothing to diff.");
                    return Ok(());
                }
            }
        }
        _ => anyhow::bail!("--left and --right must be given together"),
    };
    let base = page.merge_base(left.id(), right.id()).await?;
    let mode = if conflicting {
        DiffMode::ConflictingOnly
    } else {
        DiffMode::Full
    };

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Key", "Base", "Left", "Right"]);

    let mut count = 0;
    let mut token: Option<Token> = None;
    loop {
        let (_, entries, next) = page
            .diff(left.id(), right.id(), mode, token.as_ref())
            .await
            .context("failed to compute diff")?
            .into_parts();
        for entry in entries {
            table.add_row(vec![
                String::from_utf8_lossy(&entry.key).into_owned(),
                style::value(entry.base.as_deref()),
                style::value(entry.left.as_deref()),
                style::value(entry.right.as_deref()),
            ]);
            count += 1;
        }
        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    println!(
        "{}",
        style::header(&format!(
            "left {}  right {}  base {}",
            short(left.id()),
            short(right.id()),
            short(&base)
        ))
    );
    if count == 0 {
        println!("{}", style::dim("(no differences)"));
    } else {
        println!("{}", table);
        println!("{} key(s)", count);
    }
    Ok(())
}

async fn cmd_resolve(ledger: &Ledger, page: &str, policy: MergePolicy) -> Result<()> {
    if policy == MergePolicy::Custom {
        anyhow::bail!("the custom policy needs an external resolver; use last_one_wins or automatic");
    }
    ledger.set_conflict_resolver_factory(Some(Arc::new(FixedPolicyFactory::new(policy))));

    let page = open(ledger, page).await?;
    let outcome = page
        .wait_for_conflict_resolution()
        .await
        .context("failed while waiting for resolution")?;
    let heads = page.heads().await?;

    match outcome {
        ConflictResolutionWaitStatus::NoConflicts => {
            println!("{}", style::success("no conflicts to resolve"));
        }
        ConflictResolutionWaitStatus::ConflictsResolved => {
            println!(
                "{}",
                style::success(&format!("conflicts resolved with {policy}"))
            );
        }
    }
    for head in &heads {
        println!("  head {}", head);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// `hex:<id>` names a page by its hex id; anything else is the page name.
fn parse_page_id(arg: &str) -> Result<PageId> {
    match arg.strip_prefix("hex:") {
        Some(hex) => PageId::from_hex(hex).with_context(|| format!("invalid page id '{}'", arg)),
        None if arg.is_empty() => anyhow::bail!("page name must not be empty"),
        None => Ok(PageId::new(arg.as_bytes().to_vec())),
    }
}

async fn open(ledger: &Ledger, arg: &str) -> Result<Page> {
    let id = parse_page_id(arg)?;
    ledger
        .get_page(id)
        .await
        .with_context(|| format!("failed to open page '{}'", arg))
}

/// The commit whose id starts with `prefix`.
async fn find_commit(page: &Page, prefix: &str) -> Result<Arc<Commit>> {
    if let Some(id) = CommitId::parse(prefix) {
        return page
            .get_commit(&id)
            .await
            .with_context(|| format!("commit '{}' not found", prefix));
    }
    let log = page.log().await?;
    let mut matches = log.iter().filter(|c| c.id().as_str().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(commit), None) => Ok(commit.clone()),
        (None, _) => anyhow::bail!("commit '{}' not found", prefix),
        (Some(_), Some(_)) => anyhow::bail!("commit prefix '{}' is ambiguous", prefix),
    }
}

/// `ids` as commits, most recent first.
async fn by_recency(page: &Page, ids: &[CommitId]) -> Result<Vec<Arc<Commit>>> {
    let mut commits = Vec::with_capacity(ids.len());
    for id in ids {
        commits.push(page.get_commit(id).await?);
    }
    commits.sort_by(|a, b| {
        b.generation()
            .cmp(&a.generation())
            .then_with(|| b.timestamp().cmp(&a.timestamp()))
            .then_with(|| b.id().cmp(a.id()))
    });
    Ok(commits)
}

fn short(id: &CommitId) -> &str {
    id.short()
}

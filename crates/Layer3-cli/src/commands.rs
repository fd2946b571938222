//! Subcommand handlers

use anyhow::{bail, Context};
use deepctx_core::{
    BranchId, CheckpointId, CompressionResult, CompressionStrategy, ContextEngine, SelectOptions,
};
use deepctx_foundation::{ContextItem, ContextType, ItemFilter, PriorityUpdate, WorkspaceId};
use serde::Serialize;
use std::io::Read;

/// 세션 미지정 시 사용
pub const DEFAULT_SESSION: &str = "default";

/// 출력 형식
pub struct Output {
    pub json: bool,
}

impl Output {
    fn print<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

pub struct AddInput {
    pub content: String,
    pub item_type: ContextType,
    pub priority: u8,
    pub agent: Option<String>,
    pub thread: Option<String>,
    pub id: Option<String>,
}

pub struct CompressInput {
    pub target: usize,
    pub strategy: Option<String>,
    pub session: String,
    pub commit: bool,
}

/// `ID=PRIORITY` 파싱
pub fn parse_priority_update(s: &str) -> Result<PriorityUpdate, String> {
    let (id, priority) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected ID=PRIORITY, got '{}'", s))?;
    let priority = priority
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("invalid priority '{}': {}", priority, e))?;
    Ok(PriorityUpdate::new(id.trim(), priority))
}

fn filter_for(types: Vec<ContextType>) -> Option<ItemFilter> {
    if types.is_empty() {
        None
    } else {
        Some(ItemFilter::new().with_types(types))
    }
}

pub async fn add(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    input: AddInput,
) -> anyhow::Result<()> {
    let content = if input.content == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read content from stdin")?;
        buf
    } else {
        input.content
    };

    let mut item = ContextItem::new(input.item_type, content).with_priority(input.priority);
    if let Some(id) = input.id {
        item = item.with_id(id);
    }
    if let Some(agent) = input.agent {
        item = item.with_source_agent(agent);
    }
    if let Some(thread) = input.thread {
        item = item.with_thread(thread);
    }

    let item = engine.write(ws, item).await?;
    if out.json {
        return out.print(&item);
    }

    println!("Added {} ({} tokens, priority {})", item.id, item.tokens, item.priority);
    if let Some(from) = item.metadata.get(deepctx_core::TRUNCATED_FROM_KEY) {
        println!("  truncated from {} tokens", from);
    }
    Ok(())
}

pub async fn list(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    types: Vec<ContextType>,
) -> anyhow::Result<()> {
    let items = engine.list(ws, filter_for(types).as_ref()).await?;
    if out.json {
        return out.print(&items);
    }
    print_items(&items);
    Ok(())
}

pub async fn show(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    id: &str,
) -> anyhow::Result<()> {
    let item = engine.read(ws, id).await?;
    if out.json {
        return out.print(&item);
    }

    println!("ID:        {}", item.id);
    println!("Type:      {}", item.item_type);
    println!("Priority:  {}", item.priority);
    println!("Tokens:    {}", item.tokens);
    println!("Created:   {}", item.timestamp.format("%Y-%m-%d %H:%M:%S"));
    if let Some(agent) = &item.source_agent_id {
        println!("Agent:     {}", agent);
    }
    if let Some(thread) = &item.thread_id {
        println!("Thread:    {}", thread);
    }
    for (key, value) in &item.metadata {
        println!("Meta:      {} = {}", key, value);
    }
    println!("\n{}", item.content);
    Ok(())
}

pub async fn remove(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    id: &str,
) -> anyhow::Result<()> {
    let removed = engine.remove(ws, id).await?;
    if out.json {
        return out.print(&removed);
    }
    if removed {
        println!("Removed {}", id);
    } else {
        println!("No item '{}' in {}", id, ws);
    }
    Ok(())
}

pub async fn reorder(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    updates: &[PriorityUpdate],
) -> anyhow::Result<()> {
    engine.update_priorities(ws, updates).await?;
    if out.json {
        return out.print(&updates);
    }
    println!("Updated {} priorities", updates.len());
    Ok(())
}

pub async fn select(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    query: &str,
    budget: usize,
    options: &SelectOptions,
) -> anyhow::Result<()> {
    let selection = engine.select_scored(ws, query, budget, options).await?;
    if out.json {
        return out.print(&selection);
    }

    println!(
        "\nSelected {} of {} items ({} / {} tokens, {} skipped)\n",
        selection.items.len(),
        selection.considered,
        selection.total_tokens,
        selection.budget,
        selection.skipped
    );
    println!(
        "{:<38} {:<8} {:>4} {:>7} {:>6}",
        "ID", "Type", "Pri", "Tokens", "Score"
    );
    println!("{}", "-".repeat(67));
    for scored in &selection.items {
        println!(
            "{:<38} {:<8} {:>4} {:>7} {:>6.3}",
            scored.item.id,
            scored.item.item_type,
            scored.item.priority,
            scored.item.tokens,
            scored.score.total
        );
    }
    println!();
    Ok(())
}

pub async fn compress(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    input: CompressInput,
) -> anyhow::Result<()> {
    let strategy = match input.strategy.as_deref() {
        Some(name) => CompressionStrategy::from_name(name)?,
        None => engine.default_strategy().clone(),
    };

    let result = engine
        .preview_compression(ws, &strategy, input.target)
        .await?;

    if !input.commit {
        if out.json {
            return out.print(&result);
        }
        print_compression(&result);
        println!("Preview only. Re-run with --commit to apply.");
        return Ok(());
    }

    let outcome = engine
        .commit_compression(ws, &input.session, &result)
        .await?;
    if out.json {
        return out.print(&serde_json::json!({ "result": result, "outcome": outcome }));
    }

    print_compression(&result);
    match outcome.checkpoint_id {
        Some(id) => println!("Committed. Checkpoint {} holds the previous state.", id),
        None => println!("Nothing to commit."),
    }
    Ok(())
}

pub async fn checkpoint(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
    label: &str,
) -> anyhow::Result<()> {
    let id = engine.create_checkpoint(ws, session, label, None).await?;
    if out.json {
        return out.print(&id);
    }
    println!("Created checkpoint {}", id);
    Ok(())
}

pub async fn checkpoints(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
) -> anyhow::Result<()> {
    let checkpoints = engine.list_checkpoints(ws, session).await?;
    if out.json {
        return out.print(&checkpoints);
    }
    if checkpoints.is_empty() {
        println!("No checkpoints in session '{}'.", session);
        return Ok(());
    }

    println!("\n📋 Checkpoints ({} / {})\n", ws, session);
    println!(
        "{:<38} {:<20} {:>6} {:>8}  {}",
        "ID", "Created", "Items", "Tokens", "Label"
    );
    println!("{}", "-".repeat(90));
    for cp in checkpoints {
        println!(
            "{:<38} {:<20} {:>6} {:>8}  {}",
            cp.id,
            cp.timestamp.format("%Y-%m-%d %H:%M:%S"),
            cp.item_count,
            cp.total_tokens,
            cp.label
        );
    }
    println!("\nUse 'deepctx restore <WORKSPACE> <ID>' to branch from a checkpoint.\n");
    Ok(())
}

pub async fn restore(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
    checkpoint: &str,
) -> anyhow::Result<()> {
    let outcome = engine
        .restore_checkpoint(ws, session, &CheckpointId::from_string(checkpoint))
        .await?;
    if out.json {
        return out.print(&outcome);
    }
    if !outcome.success {
        bail!(outcome.message);
    }
    println!("{}", outcome.message);
    if let Some(branch) = outcome.new_branch_id {
        println!("Use 'deepctx checkout {} {}' to switch to it.", ws, branch);
    }
    Ok(())
}

pub async fn branches(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
) -> anyhow::Result<()> {
    let branches = engine.branches(ws, session).await?;
    if out.json {
        return out.print(&branches);
    }
    if branches.is_empty() {
        println!("No branches in session '{}'.", session);
        return Ok(());
    }
    println!(
        "{:<38} {:<38} {:<20} {:>6}",
        "Branch", "Checkpoint", "Created", "Items"
    );
    println!("{}", "-".repeat(105));
    for branch in branches {
        println!(
            "{:<38} {:<38} {:<20} {:>6}",
            branch.id,
            branch.checkpoint_id,
            branch.created_at.format("%Y-%m-%d %H:%M:%S"),
            branch.items.len()
        );
    }
    Ok(())
}

pub async fn checkout(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
    branch: &str,
) -> anyhow::Result<()> {
    let outcome = engine
        .checkout_branch(ws, session, &BranchId::from_string(branch))
        .await?;
    if out.json {
        return out.print(&outcome);
    }
    println!(
        "Checked out {} ({} items).",
        branch,
        outcome.items.len()
    );
    if let Some(id) = outcome.checkpoint_id {
        println!("Previous state saved as checkpoint {}", id);
    }
    Ok(())
}

pub async fn cleanup(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
    session: &str,
    keep: usize,
) -> anyhow::Result<()> {
    let deleted = engine.cleanup_checkpoints(ws, session, keep).await?;
    if out.json {
        return out.print(&deleted);
    }
    println!("Deleted {} checkpoints", deleted);
    Ok(())
}

pub async fn stats(engine: &ContextEngine, out: &Output, ws: &WorkspaceId) -> anyhow::Result<()> {
    let stats = engine.stats(ws).await?;
    if out.json {
        return out.print(&stats);
    }

    println!("\n📊 {}\n", ws);
    println!("Items:      {}", stats.total_items);
    println!("Tokens:     {}", stats.total_tokens);
    println!("Relevance:  {:.3}", stats.average_relevance);
    if !stats.items_by_type.is_empty() {
        println!("\nBy type:");
        for (ty, count) in &stats.items_by_type {
            let tokens = stats.tokens_by_type.get(ty).copied().unwrap_or(0);
            println!("  {:<10} {:>5} items {:>8} tokens", ty, count, tokens);
        }
    }
    if !stats.items_by_agent.is_empty() {
        println!("\nBy agent:");
        for (agent, count) in &stats.items_by_agent {
            println!("  {:<20} {:>5}", agent, count);
        }
    }
    println!();
    Ok(())
}

pub async fn delete_workspace(
    engine: &ContextEngine,
    out: &Output,
    ws: &WorkspaceId,
) -> anyhow::Result<()> {
    engine.delete_workspace(ws).await?;
    if out.json {
        return out.print(&serde_json::Value::Null);
    }
    println!("Deleted workspace {}", ws);
    Ok(())
}

pub async fn workspaces(engine: &ContextEngine, out: &Output) -> anyhow::Result<()> {
    let workspaces = engine.workspaces().await?;
    if out.json {
        return out.print(&workspaces);
    }
    if workspaces.is_empty() {
        println!("No workspaces found.");
    }
    for ws in workspaces {
        println!("{}", ws);
    }
    Ok(())
}

pub async fn synthesize(
    engine: &ContextEngine,
    out: &Output,
    sources: &[WorkspaceId],
    target: &WorkspaceId,
    types: Vec<ContextType>,
) -> anyhow::Result<()> {
    let written = engine
        .synthesize(sources, target, filter_for(types).as_ref())
        .await?;
    if out.json {
        return out.print(&written);
    }
    println!("Copied {} items into {}", written.len(), target);
    Ok(())
}

// ============================================================================
// Printing
// ============================================================================

fn print_items(items: &[ContextItem]) {
    if items.is_empty() {
        println!("No items.");
        return;
    }

    println!(
        "{:<38} {:<8} {:>4} {:>7}  {}",
        "ID", "Type", "Pri", "Tokens", "Preview"
    );
    println!("{}", "-".repeat(100));
    for item in items {
        println!(
            "{:<38} {:<8} {:>4} {:>7}  {}",
            item.id,
            item.item_type,
            item.priority,
            item.tokens,
            truncate(&item.content, 40)
        );
    }
    let total: usize = items.iter().map(|i| i.tokens).sum();
    println!("\n{} items, {} tokens", items.len(), total);
}

fn print_compression(result: &CompressionResult) {
    println!(
        "\nStrategy {}: {} -> {} tokens ({:.0}%)",
        result.strategy,
        result.original_tokens,
        result.compressed_tokens,
        result.compression_ratio * 100.0
    );
    for item in &result.preview.removed_items {
        println!("  - removed  {} ({} tokens)", item.id, item.tokens);
    }
    for modified in &result.preview.modified_items {
        println!(
            "  ~ shrunk   {} ({} -> {} tokens)",
            modified.original.id, modified.original.tokens, modified.compressed.tokens
        );
    }
    for degraded in &result.degraded {
        println!("  ! degraded {} ({})", degraded.item_id, degraded.reason);
    }
    println!();
}

/// Truncate a string for display
fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_chars {
        s
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

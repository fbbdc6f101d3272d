use console::{measure_text_width, Style};
use uuid::Uuid;

use crate::backend::FeedScope;
use crate::content::{ContentItem, ContentKind};
use crate::filter::FilterSelection;
use crate::live::ChangeOutcome;
use crate::notice::{Notice, NoticeLevel};

pub const TREE_BRANCH: char = '\u{251C}';
pub const TREE_END: char = '\u{2514}';
pub const TREE_HORIZ: char = '\u{2500}';
pub const TREE_VERT: char = '\u{2502}';

const TREE_PREFIX_WIDTH: usize = 4;
const VALUE_COLUMN: usize = 20;
const PREVIEW_CHARS: usize = 60;

fn tree_branch() -> String {
    dim()
        .apply_to(format!("{}{}{} ", TREE_BRANCH, TREE_HORIZ, TREE_HORIZ))
        .to_string()
}

fn tree_end() -> String {
    dim()
        .apply_to(format!("{}{}{} ", TREE_END, TREE_HORIZ, TREE_HORIZ))
        .to_string()
}

fn tree_indent() -> String {
    dim().apply_to(format!("{}   ", TREE_VERT)).to_string()
}

pub fn dim() -> Style {
    Style::new().dim()
}

fn blue() -> Style {
    Style::new().blue()
}

fn magenta() -> Style {
    Style::new().magenta()
}

fn cyan() -> Style {
    Style::new().cyan()
}

fn green() -> Style {
    Style::new().green()
}

fn red() -> Style {
    Style::new().red()
}

fn yellow() -> Style {
    Style::new().yellow()
}

fn bold() -> Style {
    Style::new().bold()
}

fn init_prefix() -> String {
    blue().apply_to("[INIT]").to_string()
}

fn sync_prefix() -> String {
    magenta().apply_to("[SYNC]").to_string()
}

fn feed_prefix() -> String {
    cyan().apply_to("[FEED]").to_string()
}

fn mutate_prefix() -> String {
    yellow().apply_to("[MUTATE]").to_string()
}

pub fn pad_label(label: &str, depth: usize) -> String {
    let prefix_width = depth * TREE_PREFIX_WIDTH;
    let target_width = VALUE_COLUMN.saturating_sub(prefix_width);
    let current_width = measure_text_width(label);
    if current_width < target_width {
        format!("{}{}", label, " ".repeat(target_width - current_width))
    } else {
        format!("{} ", label)
    }
}

/// Single-line preview of a body, cut at a character boundary.
pub fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > PREVIEW_CHARS {
        format!("{}...", flat.chars().take(PREVIEW_CHARS - 3).collect::<String>())
    } else {
        flat
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn describe_filter(filter: &FilterSelection) -> String {
    if filter.is_empty() {
        return "all".to_string();
    }
    let join = |values: &std::collections::BTreeSet<String>| {
        values.iter().cloned().collect::<Vec<_>>().join("|")
    };
    let mut parts = Vec::new();
    if !filter.categories.is_empty() {
        parts.push(format!("category={}", join(&filter.categories)));
    }
    if !filter.moods.is_empty() {
        parts.push(format!("mood={}", join(&filter.moods)));
    }
    parts.join(" ")
}

pub fn log_init(backend_url: &str, kind: ContentKind, filter: &FilterSelection) {
    println!(
        "{} starting cycle-stories against {}...",
        init_prefix(),
        cyan().apply_to(backend_url),
    );
    println!(
        "{} watching {} ({})",
        init_prefix(),
        bold().apply_to(kind),
        dim().apply_to(describe_filter(filter)),
    );
}

pub fn log_signed_in(user_id: Uuid, email: Option<&str>) {
    println!(
        "{} signed in as {} {}",
        init_prefix(),
        bold().apply_to(email.unwrap_or("unknown")),
        dim().apply_to(short_id(user_id)),
    );
}

pub fn log_realtime_connected(url: &str) {
    println!(
        "{} realtime {} {}",
        feed_prefix(),
        green().apply_to("connected"),
        dim().apply_to(url)
    );
}

pub fn log_realtime_closed(reason: &str) {
    println!(
        "{} realtime {} {}",
        feed_prefix(),
        red().apply_to("closed:"),
        dim().apply_to(reason)
    );
}

pub fn log_realtime_rejected(topic: &str, payload: &str) {
    println!(
        "{} {} {}: {}",
        feed_prefix(),
        red().apply_to("join rejected"),
        cyan().apply_to(topic),
        dim().apply_to(payload)
    );
}

pub fn log_subscribed(scope: &FeedScope) {
    println!(
        "{} {} {}",
        feed_prefix(),
        green().apply_to("subscribed"),
        cyan().apply_to(scope)
    );
}

pub fn log_unsubscribed(scope: &FeedScope) {
    println!(
        "{} {} {}",
        feed_prefix(),
        dim().apply_to("unsubscribed"),
        cyan().apply_to(scope)
    );
}

pub fn log_event_dropped(table: &str, reason: &str) {
    tracing::warn!(table, reason, "change dropped");
    println!(
        "{} {} {}: {}",
        feed_prefix(),
        yellow().apply_to("dropped"),
        cyan().apply_to(table),
        dim().apply_to(reason)
    );
}

pub fn log_change_applied(table: &str, outcome: ChangeOutcome, id: Option<Uuid>) {
    let style = match outcome {
        ChangeOutcome::Inserted => green(),
        ChangeOutcome::Replaced => cyan(),
        ChangeOutcome::Removed => red(),
        _ => return,
    };
    let target = id.map(short_id).unwrap_or_default();
    println!(
        "{} {} {} {}",
        sync_prefix(),
        style.apply_to(outcome),
        cyan().apply_to(table),
        dim().apply_to(target)
    );
}

pub fn log_view_ready(kind: ContentKind, count: usize, replayed: usize, exhausted: bool) {
    println!(
        "{} loaded {} {} items{}",
        sync_prefix(),
        bold().apply_to(count),
        cyan().apply_to(kind),
        if exhausted {
            dim().apply_to(" (end)").to_string()
        } else {
            String::new()
        }
    );
    if replayed > 0 {
        println!(
            "{}replayed {} buffered changes",
            tree_end(),
            bold().apply_to(replayed)
        );
    }
}

pub fn log_page_loaded(kind: ContentKind, appended: usize, exhausted: bool) {
    println!(
        "{} +{} {} items{}",
        sync_prefix(),
        bold().apply_to(appended),
        cyan().apply_to(kind),
        if exhausted {
            dim().apply_to(" (end)").to_string()
        } else {
            String::new()
        }
    );
}

pub fn log_view_error(kind: ContentKind, error: &str) {
    println!(
        "{} {} {}: {}",
        sync_prefix(),
        red().apply_to("failed"),
        cyan().apply_to(kind),
        dim().apply_to(error)
    );
}

pub fn log_view_unmounted(kind: ContentKind) {
    println!(
        "{} {} {} view",
        sync_prefix(),
        dim().apply_to("unmounted"),
        cyan().apply_to(kind)
    );
}

pub fn log_view_summary(kind: ContentKind, visible: usize, total: usize, phase: &str) {
    println!(
        "{} {} {}{} visible ({})",
        sync_prefix(),
        cyan().apply_to(kind),
        bold().apply_to(visible),
        dim().apply_to(format!("/{total}")),
        dim().apply_to(phase)
    );
}

pub fn log_mutation(action: &str, id: Uuid, detail: &str) {
    println!(
        "{} {} {} {}",
        mutate_prefix(),
        green().apply_to(action),
        dim().apply_to(short_id(id)),
        detail
    );
}

pub fn log_mutation_failed(action: &str, error: &str) {
    println!(
        "{} {} {}: {}",
        mutate_prefix(),
        red().apply_to("failed"),
        action,
        dim().apply_to(error)
    );
}

pub fn log_notice(notice: &Notice) {
    let level = match notice.level {
        NoticeLevel::Info => blue().apply_to(notice.level),
        NoticeLevel::Error => red().apply_to(notice.level),
    };
    let action = notice
        .action
        .map(|a| format!(" [{}]", a))
        .unwrap_or_default();
    println!("{} {}{}", level, notice.message, dim().apply_to(action));
}

/// Prints one item as a tree, in the same layout the feed service uses for
/// post assessments.
pub fn print_item(position: usize, item: &ContentItem) {
    let mut lines: Vec<String> = Vec::new();

    let heading = item
        .title
        .as_deref()
        .map(preview)
        .unwrap_or_else(|| preview(&item.content));
    lines.push(format!(
        "{} \"{}\"",
        magenta().apply_to(bold().apply_to(format!("[#{position}]"))),
        dim().apply_to(heading)
    ));

    let mut fields: Vec<(&str, String)> = vec![
        ("id", item.id.to_string()),
        ("author", item.author_name().to_string()),
        ("created", item.created_at.format("%Y-%m-%d %H:%M").to_string()),
    ];
    if let Some(category) = &item.category {
        fields.push(("category", category.clone()));
    }
    if !item.tags.is_empty() {
        fields.push(("moods", item.tags.iter().cloned().collect::<Vec<_>>().join(", ")));
    }
    if item.is_pinned {
        fields.push(("pinned", green().apply_to("yes").to_string()));
    }
    if item.title.is_some() {
        fields.push(("content", preview(&item.content)));
    }

    let count = fields.len();
    for (i, (label, value)) in fields.into_iter().enumerate() {
        let branch = if i == count - 1 {
            tree_end()
        } else {
            tree_branch()
        };
        lines.push(format!("{}{} {}", branch, pad_label(label, 1), value));
    }

    println!("{}\n", lines.join("\n"));
}

pub fn print_empty(kind: ContentKind) {
    println!("{}{}", tree_indent(), dim().apply_to(kind.empty_message()));
}

use cycle_stories::backend::{Backend, RestBackend};
use cycle_stories::filter::FilterSelection;
use cycle_stories::live::{LiveList, ViewScope};
use cycle_stories::notice::Notices;
use cycle_stories::utils::logs::{print_empty, print_item};
use std::env;
use std::process;
use std::sync::Arc;
use uuid::Uuid;

fn print_usage() {
    eprintln!("Usage: inspect-view <stories|posts|comments <story-id>> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --category <a,b>   Only items in one of these categories");
    eprintln!("  --mood <a,b>       Only items tagged with one of these moods");
    eprintln!("  --pages <n>        Number of pages to fetch (default 1)");
}

#[derive(Debug, PartialEq)]
struct Args {
    scope: ViewScope,
    filter: FilterSelection,
    pages: usize,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut rest = args.iter().map(String::as_str);

    let scope = match rest.next() {
        Some("stories") => ViewScope::stories(),
        Some("posts") => ViewScope::community_posts(),
        Some("comments") => {
            let raw = rest.next().ok_or("comments needs a story id")?;
            let story_id = Uuid::parse_str(raw).map_err(|e| format!("bad story id {raw}: {e}"))?;
            ViewScope::comments(story_id)
        }
        Some(other) => return Err(format!("unknown view: {other}")),
        None => return Err("missing view".to_string()),
    };

    let mut category = None;
    let mut mood = None;
    let mut pages = 1;
    while let Some(flag) = rest.next() {
        let value = rest.next().ok_or_else(|| format!("{flag} needs a value"))?;
        match flag {
            "--category" | "-c" => category = Some(value),
            "--mood" | "-m" => mood = Some(value),
            "--pages" | "-p" => {
                pages = value
                    .parse()
                    .map_err(|_| format!("--pages expects a number, got {value}"))?
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }

    Ok(Args {
        scope,
        filter: FilterSelection::from_params(category, mood),
        pages: pages.max(1),
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let backend = match RestBackend::from_settings() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("could not create client: {e}");
            process::exit(1);
        }
    };

    if let Ok(count) = backend.count(&args.scope.query(&args.filter)).await {
        println!("{count} matching rows\n");
    }

    let (notices, _notice_rx) = Notices::channel();
    let list = LiveList::new(backend.clone(), args.scope.clone(), notices);

    let mut items = match list.initialize(args.filter).await {
        Ok(items) => items,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    for _ in 1..args.pages {
        match list.load_more().await {
            Ok(page) if page.is_empty() => break,
            Ok(page) => items.extend(page),
            Err(e) => {
                eprintln!("{e}");
                break;
            }
        }
    }

    if items.is_empty() {
        print_empty(args.scope.kind);
    }
    for (i, item) in items.iter().enumerate() {
        print_item(i + 1, item);
    }

    list.unmount().await;
    if backend.current_user().is_some() {
        let _ = backend.sign_out().await;
    }
}

//! `present` subcommand: the authoritative side, driven from stdin

use std::error::Error;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use slidesync_core::presenter::{self, Mutation, PresenterHandle};
use slidesync_core::{DataUri, SessionId, StateStore, SyncConfig, SLOT_COUNT};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::PresentArgs;

/// A parsed stdin command. Slots are numbered from 1 for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Set { index: usize, path: PathBuf },
    Clear { index: usize },
    Interval(u32),
    Start,
    Stop,
    Status,
    Link,
    Help,
    Quit,
}

/// What the stdin thread hands to the runtime
#[derive(Debug)]
enum Input {
    Apply(Mutation),
    Status,
    Link,
    Quit,
}

fn parse_slot(arg: Option<&str>) -> Result<usize, String> {
    let n: usize = arg
        .ok_or("missing slot number")?
        .parse()
        .map_err(|_| "slot must be a number".to_string())?;
    if n == 0 {
        return Err(format!("slots are numbered 1-{}", SLOT_COUNT));
    }
    Ok(n - 1)
}

fn parse_line(line: &str) -> Result<Option<Line>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = parts.first() else {
        return Ok(None);
    };

    let parsed = match command {
        "set" => {
            let index = parse_slot(parts.get(1).copied())?;
            if parts.len() < 3 {
                return Err("usage: set <slot> <image path>".to_string());
            }
            // Paths may contain spaces
            Line::Set {
                index,
                path: PathBuf::from(parts[2..].join(" ")),
            }
        }
        "clear" => Line::Clear {
            index: parse_slot(parts.get(1).copied())?,
        },
        "interval" => {
            let secs = parts
                .get(1)
                .ok_or("usage: interval <seconds>")?
                .parse()
                .map_err(|_| "interval must be a whole number of seconds".to_string())?;
            Line::Interval(secs)
        }
        "start" => Line::Start,
        "stop" => Line::Stop,
        "status" => Line::Status,
        "link" => Line::Link,
        "help" => Line::Help,
        "quit" | "exit" => Line::Quit,
        other => return Err(format!("unknown command {:?}; try 'help'", other)),
    };
    Ok(Some(parsed))
}

fn load_image(index: usize, path: &Path) -> Result<Mutation, String> {
    let image = DataUri::from_file(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    Ok(Mutation::SetSlot {
        index,
        image: image.encode(),
    })
}

fn into_input(line: Line) -> Result<Option<Input>, String> {
    let input = match line {
        Line::Set { index, path } => Input::Apply(load_image(index, &path)?),
        Line::Clear { index } => Input::Apply(Mutation::ClearSlot { index }),
        Line::Interval(seconds) => Input::Apply(Mutation::SetInterval { seconds }),
        Line::Start => Input::Apply(Mutation::Start),
        Line::Stop => Input::Apply(Mutation::Stop),
        Line::Status => Input::Status,
        Line::Link => Input::Link,
        Line::Quit => Input::Quit,
        Line::Help => {
            print_help();
            return Ok(None);
        }
    };
    Ok(Some(input))
}

fn print_help() {
    println!("\nCommands:");
    println!("  set <slot> <path>   - Load an image into slot 1-{}", SLOT_COUNT);
    println!("  clear <slot>        - Empty a slot");
    println!("  interval <seconds>  - Seconds per slide");
    println!("  start | stop        - Start or stop the slideshow");
    println!("  status              - Show slots and viewers");
    println!("  link                - Show the viewer link");
    println!("  quit                - Exit\n");
}

fn print_status(presenter: &PresenterHandle) {
    let state = presenter.state();
    println!(
        "Session {}: {} ({}s per slide), viewers connected: {}",
        presenter.session(),
        if state.active { "playing" } else { "stopped" },
        state.interval_seconds,
        if presenter.is_anyone_connected() { "yes" } else { "no" }
    );
    for (n, slot) in state.slots.iter().enumerate() {
        match slot {
            Some(image) => println!("  {}: {} bytes", n + 1, image.len()),
            None => println!("  {}: -", n + 1),
        }
    }
}

async fn apply(presenter: &PresenterHandle, mutation: Mutation) {
    if let Err(e) = presenter.apply(mutation).await {
        warn!("Presenter: {}", e);
        println!("Rejected: {}", e);
    }
}

pub async fn run(args: PresentArgs, config: SyncConfig) -> Result<(), Box<dyn Error>> {
    let store = StateStore::from_config(&config.store)?;
    let session = SessionId::generate();
    info!("Slidesync presenter for session {} starting", session);

    let presenter = presenter::start(session, store, &config).await?;
    println!("Viewer link: {}", presenter.link());

    for (index, path) in args.images.iter().enumerate() {
        if index >= SLOT_COUNT {
            warn!("Only {} slots; ignoring {}", SLOT_COUNT, path.display());
            continue;
        }
        match load_image(index, path) {
            Ok(mutation) => apply(&presenter, mutation).await,
            Err(e) => warn!("Presenter: {}", e),
        }
    }
    if let Some(seconds) = args.interval {
        apply(&presenter, Mutation::SetInterval { seconds }).await;
    }

    // Spawn stdin handler
    let (input_tx, mut input_rx) = mpsc::channel::<Input>(16);
    std::thread::spawn(move || {
        print_help();
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(&line).and_then(|parsed| parsed.map(into_input).transpose()) {
                Ok(Some(Some(input))) => {
                    if input_tx.blocking_send(input).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => println!("{}", e),
            }
        }
    });

    let mut liveness = presenter.watch_liveness();

    // Main event loop
    loop {
        tokio::select! {
            Some(input) = input_rx.recv() => {
                match input {
                    Input::Apply(mutation) => apply(&presenter, mutation).await,
                    Input::Status => print_status(&presenter),
                    Input::Link => println!("Viewer link: {}", presenter.link()),
                    Input::Quit => break,
                }
            }

            changed = liveness.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *liveness.borrow_and_update();
                if connected {
                    info!("Viewer connected");
                } else {
                    info!("No viewers connected");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    presenter.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("start"), Ok(Some(Line::Start)));
        assert_eq!(parse_line("clear 2"), Ok(Some(Line::Clear { index: 1 })));
        assert_eq!(parse_line("interval 0"), Ok(Some(Line::Interval(0))));
        assert_eq!(
            parse_line("set 5 my slides/one.png"),
            Ok(Some(Line::Set {
                index: 4,
                path: PathBuf::from("my slides/one.png")
            }))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("set 0 a.png").is_err());
        assert!(parse_line("set 1").is_err());
        assert!(parse_line("clear x").is_err());
        assert!(parse_line("interval").is_err());
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn test_set_reads_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slide.png");
        fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        match into_input(Line::Set { index: 0, path }).unwrap() {
            Some(Input::Apply(Mutation::SetSlot { index, image })) => {
                assert_eq!(index, 0);
                assert_eq!(image, "data:image/png;base64,iVBORw==");
            }
            other => panic!("unexpected input {:?}", other),
        }

        assert!(into_input(Line::Set { index: 0, path: dir.path().join("missing.png") }).is_err());
    }
}

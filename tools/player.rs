/// Player: plays a compiled story in the terminal.
///
/// Usage: player <story.json|story.ron> [--seed <n>] [--config <session.ron>]
///
/// Commands:
///   <n>               click link number n
///   input <n> <text>  type text into input number n
///   back              go back one step
///   restart           start the story again
///   reload            re-read the story file and hot-swap it in
///   get <attr>        print an attribute
///   html              print the output as HTML
///   help              list commands
///   quit              exit

use futures::executor::block_on;
use squiffy_runtime::core::config::SessionConfig;
use squiffy_runtime::schema::output::{ElementId, Fragment, LinkKind, OutputSection};
use squiffy_runtime::{Session, Story};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let story_path = PathBuf::from(&args[1]);
    let mut seed = None;
    let mut config_path = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().ok();
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(PathBuf::from(&args[i]));
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let story = match load_story(&story_path) {
        Ok(story) => story,
        Err(e) => {
            eprintln!("Failed to load {}: {}", story_path.display(), e);
            std::process::exit(1);
        }
    };

    let mut config = match config_path {
        Some(ref path) => match SessionConfig::load_from_ron(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => SessionConfig::default(),
    };
    if let Some(seed) = seed {
        config.seed = seed;
    }

    let mut session = match Session::builder().story(story).config(&config).build() {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to start session: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = block_on(session.begin()) {
        eprintln!("Failed to begin story: {}", e);
        std::process::exit(1);
    }

    println!("Type 'help' for commands.\n");
    show(&session);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        let cmd = parts[0].to_lowercase();

        match cmd.as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "back" | "b" => {
                if !session.can_go_back() {
                    println!("Nothing to go back to.");
                    continue;
                }
                session.go_back();
                show(&session);
            }
            "restart" => match block_on(session.restart()) {
                Ok(()) => show(&session),
                Err(e) => println!("ERROR: {}", e),
            },
            "reload" => match load_story(&story_path) {
                Ok(story) => match block_on(session.update(story)) {
                    Ok(()) => {
                        println!("Reloaded {}", story_path.display());
                        show(&session);
                    }
                    Err(e) => println!("ERROR: {}", e),
                },
                Err(e) => println!("Failed to reload: {}", e),
            },
            "get" => {
                if parts.len() < 2 {
                    println!("Usage: get <attribute>");
                    continue;
                }
                println!("{} = {}", parts[1], session.get(parts[1]));
            }
            "html" => println!("{}", session.to_html()),
            "input" => {
                if parts.len() < 3 {
                    println!("Usage: input <n> <text>");
                    continue;
                }
                let Some(id) = parts[1].parse::<usize>().ok().and_then(|n| nth_input(&session, n)) else {
                    println!("No input numbered {}", parts[1]);
                    continue;
                };
                if !session.set_input_value(id, parts[2]) {
                    println!("That input can no longer be changed.");
                }
            }
            number => {
                let Some(id) = number.parse::<usize>().ok().and_then(|n| nth_link(&session, n)) else {
                    println!("Unknown command: {} (type 'help')", cmd);
                    continue;
                };
                match block_on(session.click_link(id)) {
                    Ok(true) => show(&session),
                    Ok(false) => println!("That link can't be clicked right now."),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
        }
    }
}

fn load_story(path: &Path) -> Result<Story, squiffy_runtime::schema::story::StoryError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Story::load_from_ron(path),
        _ => Story::load_from_json(path),
    }
}

fn current(session: &Session) -> Option<&OutputSection> {
    session.output().current()
}

/// Clickable links of the current section, in display order.
fn links(section: &OutputSection) -> Vec<(ElementId, String, &'static str)> {
    section
        .links()
        .into_iter()
        .filter(|l| !l.disabled)
        .filter_map(|l| {
            let kind = match l.kind {
                LinkKind::Section { .. } => "section",
                LinkKind::Passage { .. } => "passage",
                LinkKind::Handler { .. } => "action",
            };
            l.id.map(|id| (id, l.text.clone(), kind))
        })
        .collect()
}

fn inputs(section: &OutputSection) -> Vec<(ElementId, String, String)> {
    let mut found = Vec::new();
    section.for_each_fragment(&mut |f| {
        if let Fragment::Input(input) = f {
            if let (Some(id), false) = (input.id, input.disabled) {
                found.push((id, input.attribute.clone(), input.value.clone()));
            }
        }
    });
    found
}

fn nth_link(session: &Session, n: usize) -> Option<ElementId> {
    let section = current(session)?;
    links(section).get(n.checked_sub(1)?).map(|(id, _, _)| *id)
}

fn nth_input(session: &Session, n: usize) -> Option<ElementId> {
    let section = current(session)?;
    inputs(section).get(n.checked_sub(1)?).map(|(id, _, _)| *id)
}

fn show(session: &Session) {
    let Some(section) = current(session) else {
        println!("(nothing to show)");
        return;
    };
    println!("\n{}\n", section.text());
    for (i, (_, attribute, value)) in inputs(section).iter().enumerate() {
        println!("  input {}: {} = \"{}\"", i + 1, attribute, value);
    }
    for (i, (_, text, kind)) in links(section).iter().enumerate() {
        println!("  [{}] {} ({})", i + 1, text, kind);
    }
    if !session.are_inputs_valid() {
        println!("  (fill in the inputs to continue)");
    }
    println!();
}

fn print_usage() {
    eprintln!("Usage: player <story.json|story.ron> [--seed <n>] [--config <session.ron>]");
}

fn print_help() {
    println!("Commands:");
    println!("  <n>              click link number n");
    println!("  input <n> <text> type into input number n");
    println!("  back             go back one step");
    println!("  restart          start the story again");
    println!("  reload           re-read the story file and apply it");
    println!("  get <attr>       print an attribute");
    println!("  html             print the output as HTML");
    println!("  quit             exit");
}

//! `sleuth chat`: interactive session with persistent history.

use super::{AgentArgs, build_agent, cancel_on_ctrl_c, load_config, log_events};
use sleuth_agent::AnswerRequest;
use sleuth_core::event::EventBus;
use sleuth_core::message::SessionId;
use sleuth_storage::create_store;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Question(&'a str),
    Clear,
    Exit,
    Empty,
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Empty,
        "/clear" => Input::Clear,
        "/exit" | "/quit" | "exit" | "quit" => Input::Exit,
        question => Input::Question(question),
    }
}

pub async fn run(config_path: Option<&Path>, args: &AgentArgs, verbose: bool) -> anyhow::Result<()> {
    let config = load_config(config_path, args)?;
    let event_bus = Arc::new(EventBus::default());
    if verbose {
        log_events(&event_bus);
    }

    let store = create_store(&config.storage.backend, config.sessions_dir());
    let agent = build_agent(&config, event_bus)?.with_store(store.clone());
    let session_id = args.session.as_deref().map(SessionId::from).unwrap_or_default();

    println!();
    println!("  Sleuth — interactive mode");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Profile:   {}", agent.profile());
    println!("  Session:   {session_id}");
    println!();
    println!("  Ask about the codebase. /clear forgets this session, /exit quits.");
    println!();

    let cancel = cancel_on_ctrl_c();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  you > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let question = match classify(&line) {
            Input::Empty => continue,
            Input::Exit => break,
            Input::Clear => {
                match store.clear_history(&session_id).await {
                    Ok(()) => println!("  (history cleared)\n"),
                    Err(e) => eprintln!("  [Error] {e}\n"),
                }
                continue;
            }
            Input::Question(question) => question,
        };

        match agent
            .answer(AnswerRequest::new(session_id.clone(), question), &cancel)
            .await
        {
            Ok(answer) => {
                println!();
                for line in answer.answer.lines() {
                    println!("  sleuth > {line}");
                }
                if !answer.completed {
                    println!("  [did not complete within {} iterations]", answer.iterations);
                }
                println!();
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) => eprintln!("  [Error] {e}\n"),
        }
    }

    println!();
    println!("  Bye.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_commands() {
        assert_eq!(classify("  "), Input::Empty);
        assert_eq!(classify("/clear"), Input::Clear);
        assert_eq!(classify("quit\n"), Input::Exit);
        assert_eq!(classify(" where is main? "), Input::Question("where is main?"));
    }
}

//! `sleuth ask`: answer one question.

use super::{AgentArgs, build_agent, cancel_on_ctrl_c, image_url, load_config, log_events};
use anyhow::Context;
use serde_json::{Value, json};
use sleuth_agent::{AgentAnswer, AnswerRequest};
use sleuth_core::event::EventBus;
use sleuth_core::message::SessionId;
use sleuth_storage::create_store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct AskOptions {
    pub question: String,
    pub schema: Option<PathBuf>,
    pub images: Vec<String>,
    pub json: bool,
}

pub async fn run(
    config_path: Option<&Path>,
    args: &AgentArgs,
    options: AskOptions,
    verbose: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path, args)?;
    let event_bus = Arc::new(EventBus::default());
    if verbose {
        log_events(&event_bus);
    }

    let mut agent = build_agent(&config, event_bus)?;
    // One-shot questions only touch history when continuing a named session
    let session_id = match &args.session {
        Some(id) => {
            agent = agent.with_store(create_store(&config.storage.backend, config.sessions_dir()));
            SessionId::from(id)
        }
        None => SessionId::new(),
    };

    let images = options
        .images
        .iter()
        .map(|arg| image_url(arg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut request = AnswerRequest::new(session_id, options.question).with_images(images);
    if let Some(path) = &options.schema {
        request = request.with_schema(read_schema(path)?);
    }

    let cancel = cancel_on_ctrl_c();
    let answer = agent.answer(request, &cancel).await?;

    if let Some(delegator) = agent.delegator() {
        tracing::debug!(stats = ?delegator.scheduler().stats(), "Delegation statistics");
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&answer_json(&answer))?);
    } else {
        println!("{}", answer.answer);
        report(&answer);
    }
    Ok(())
}

fn read_schema(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Schema {} is not valid JSON", path.display()))
}

/// Caveats about the answer, on stderr.
fn report(answer: &AgentAnswer) {
    if !answer.completed {
        eprintln!(
            "\n  [did not complete: iteration budget of {} exhausted, answer is best effort]",
            answer.iterations
        );
    }
    if answer.schema_valid == Some(false) {
        eprintln!("  [answer does not conform to the requested schema]");
    }
}

fn answer_json(answer: &AgentAnswer) -> Value {
    json!({
        "session_id": answer.session_id.as_str(),
        "answer": answer.answer,
        "completed": answer.completed,
        "iterations": answer.iterations,
        "fallback_used": answer.fallback_used,
        "compactions": answer.compactions,
        "usage": answer.usage,
        "schema_valid": answer.schema_valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_file_must_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, r#"{"type": "object"}"#).unwrap();
        std::fs::write(&bad, "type: object").unwrap();

        assert_eq!(read_schema(&good).unwrap(), json!({"type": "object"}));
        assert!(read_schema(&bad).is_err());
        assert!(read_schema(&dir.path().join("missing.json")).is_err());
    }
}

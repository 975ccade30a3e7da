//! Interactive session tests with in-memory input

use super::fixtures::*;
use policy_llm::session::{self, SessionEnd, SessionSummary, BANNER};
use policy_llm::{Error, GenerationParams, InferenceEngine};
use std::future::pending;
use std::io::{self, BufRead, Cursor, Read};
use std::time::{Duration, Instant};

async fn run_with(
    input: &str,
    mut generate: impl FnMut(&str) -> policy_llm::Result<String>,
) -> (SessionSummary, String, Vec<String>) {
    let mut output = Vec::new();
    let mut prompts = Vec::new();
    let summary = session::run(
        session::spawn_line_reader(Cursor::new(input.to_string())),
        &mut output,
        |prompt| {
            prompts.push(prompt.to_string());
            generate(prompt)
        },
        pending(),
    )
    .await
    .unwrap();
    (summary, String::from_utf8(output).unwrap(), prompts)
}

#[tokio::test]
async fn test_quit_in_any_case_ends_without_generating() {
    for word in ["quit", "QUIT", "Exit", " q "] {
        let input = format!("{}\nshould not run\n", word);
        let (summary, output, prompts) = run_with(&input, |_| Ok("unused".to_string())).await;

        assert_eq!(summary.end, SessionEnd::Quit);
        assert!(prompts.is_empty(), "{} generated {:?}", word, prompts);
        assert!(output.starts_with(BANNER));
        assert!(!output.contains("Generating response..."));
    }
}

#[tokio::test]
async fn test_blank_lines_reprompt() {
    let (summary, output, prompts) = run_with("\n   \nquit\n", |_| Ok("unused".to_string())).await;

    assert_eq!(summary.end, SessionEnd::Quit);
    assert!(prompts.is_empty());
    assert_eq!(output.matches("Enter your prompt: ").count(), 3);
}

#[tokio::test]
async fn test_responses_are_printed() {
    let (summary, output, prompts) =
        run_with("first\n  second  \nexit\n", |prompt| Ok(format!("echo {}", prompt))).await;

    assert_eq!(summary.responses, 2);
    assert_eq!(prompts, vec!["first", "second"]);
    assert!(output.contains("Generating response..."));
    assert!(output.contains("\nResponse:\necho first\n"));
    assert!(output.contains("\nResponse:\necho second\n"));
}

#[tokio::test]
async fn test_generation_error_keeps_session_alive() {
    let mut calls = 0;
    let (summary, output, _) = run_with("boom\nfine\nquit\n", |_| {
        calls += 1;
        if calls == 1 {
            Err(Error::Generation("out of memory".to_string()))
        } else {
            Ok("recovered".to_string())
        }
    })
    .await;

    assert_eq!(summary.end, SessionEnd::Quit);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.responses, 1);
    assert!(output.contains("Error: Generation error: out of memory"));
    assert!(output.contains("recovered"));
}

#[tokio::test]
async fn test_end_of_input_terminates() {
    let (summary, _, prompts) = run_with("only prompt\n", |_| Ok("done".to_string())).await;

    assert_eq!(summary.end, SessionEnd::EndOfInput);
    assert_eq!(prompts, vec!["only prompt"]);
}

#[tokio::test]
async fn test_session_with_engine() {
    let mut engine = InferenceEngine::new(Box::new(ScriptedModel::new()), test_tokenizer());
    let params = GenerationParams {
        temperature: 0.0,
        ..Default::default()
    };

    let (summary, output, _) = run_with("policy\nq\n", |prompt| {
        engine.generate(&params.request(prompt)).map(|r| r.text)
    })
    .await;

    assert_eq!(summary.responses, 1);
    assert!(output.contains("\nResponse:\nupdate approved denied\n"));
}

/// Input that blocks like a terminal nobody types into
struct SilentTerminal;

impl Read for SilentTerminal {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_secs(30));
        Ok(0)
    }
}

impl BufRead for SilentTerminal {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        std::thread::sleep(Duration::from_secs(30));
        Ok(&[])
    }

    fn consume(&mut self, _amt: usize) {}
}

#[test]
fn test_interrupt_while_reading_lets_the_runtime_shut_down() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let started = Instant::now();

    let mut output = Vec::new();
    let summary = runtime
        .block_on(async {
            session::run(
                session::spawn_line_reader(SilentTerminal),
                &mut output,
                |_| Ok("unused".to_string()),
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await
        })
        .unwrap();
    drop(runtime);

    assert_eq!(summary.end, SessionEnd::Interrupted);
    assert!(String::from_utf8(output).unwrap().ends_with("Enter your prompt: \n"));
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(5),
        "shutdown waited {:?} on the blocked reader",
        elapsed
    );
}

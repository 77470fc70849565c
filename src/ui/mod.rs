//! Interactive terminal driver.

use anyhow::Result;
use inquire::error::InquireError;
use inquire::{Select, Text};
use log::{debug, info};
use std::fmt;

use crate::core::state::{Session, SessionState, CHAPTER_COUNT};
use crate::services::export::{ExportFormat, TITLE};
use crate::services::workflow::{WorkflowError, WorkflowManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    WriteBook,
    Export(ExportFormat),
    NewStory,
    Quit,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::WriteBook => f.write_str("Write my book"),
            Action::Export(ExportFormat::Txt) => f.write_str("Download .txt"),
            Action::Export(ExportFormat::Pdf) => f.write_str("Download PDF"),
            Action::NewStory => f.write_str("Start a new story"),
            Action::Quit => f.write_str("Quit"),
        }
    }
}

/// Menu entries offered in a given state. Premise entry and an unfinished
/// chapter run have no menu.
pub fn actions_for(state: SessionState) -> Vec<Action> {
    match state {
        SessionState::Premise
        | SessionState::GeneratingOutline
        | SessionState::GeneratingChapters => vec![],
        SessionState::DisplayOutline => vec![Action::WriteBook, Action::NewStory, Action::Quit],
        SessionState::Completed => vec![
            Action::Export(ExportFormat::Txt),
            Action::Export(ExportFormat::Pdf),
            Action::NewStory,
            Action::Quit,
        ],
    }
}

fn print_structure(session: &Session) {
    let Some(story) = &session.story_data else {
        return;
    };
    println!("\nPremise:\n  {}", session.premise);
    println!("\nCharacter Arcs:\n  {}", story.character_arcs);
    println!("\nOutline:");
    for (i, item) in story.outline.iter().enumerate() {
        println!("  {}. {}", i + 1, item);
    }
    println!();
}

fn print_chapters(session: &Session) {
    for (i, chapter) in session.chapters.iter().enumerate() {
        println!("\n=== Chapter {} ===\n\n{}", i + 1, chapter);
    }
}

/// Writes the remaining chapters, logging each one as it starts.
async fn write_book(manager: &mut WorkflowManager) -> Result<(), WorkflowError> {
    let mut writing = manager.watch_writing_chapter();
    let reporter = tokio::spawn(async move {
        while writing.changed().await.is_ok() {
            let current = *writing.borrow_and_update();
            if let Some(chapter) = current {
                debug!("Writing chapter {}/{}", chapter, CHAPTER_COUNT);
            }
        }
    });

    let result = match manager.session().state {
        SessionState::GeneratingChapters => manager.resume().await,
        _ => manager.start_writing().await,
    };
    reporter.abort();
    result
}

fn is_cancel(err: &InquireError) -> bool {
    matches!(
        err,
        InquireError::OperationCanceled | InquireError::OperationInterrupted
    )
}

/// Runs prompts until the user quits. Operation failures are shown and the
/// loop continues from whatever state the workflow fell back to.
pub async fn run(manager: &mut WorkflowManager, unattended: bool) -> Result<()> {
    println!("{}", TITLE);

    if unattended {
        return run_unattended(manager).await;
    }

    loop {
        let state = manager.session().state;

        if matches!(state, SessionState::Premise | SessionState::GeneratingOutline) {
            let previous = manager.session().premise.clone();
            let mut prompt = Text::new("Story premise:")
                .with_help_message("Describe your story in a sentence or two. Esc to quit.");
            if !previous.is_empty() {
                prompt = prompt.with_initial_value(&previous);
            }
            let premise = match prompt.prompt() {
                Ok(p) => p,
                Err(e) if is_cancel(&e) => break,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = manager.submit_premise(&premise).await {
                println!("{}", e);
            }
            continue;
        }

        if state == SessionState::GeneratingChapters {
            println!(
                "Resuming at chapter {}...",
                manager.session().chapters.len() + 1
            );
            if let Err(e) = write_book(manager).await {
                println!("{}", e);
            }
            continue;
        }

        if state == SessionState::DisplayOutline {
            print_structure(manager.session());
            if !manager.session().chapters.is_empty() {
                println!(
                    "{}/{} chapters already written.",
                    manager.session().chapters.len(),
                    CHAPTER_COUNT
                );
            }
        }
        if state == SessionState::Completed {
            print_chapters(manager.session());
            println!("\nYour story is complete.");
        }

        let action = match Select::new("What next?", actions_for(state)).prompt() {
            Ok(a) => a,
            Err(e) if is_cancel(&e) => break,
            Err(e) => return Err(e.into()),
        };

        let outcome = match action {
            Action::WriteBook => write_book(manager).await,
            Action::Export(format) => manager
                .export(format)
                .await
                .map(|path| println!("Saved {}", path)),
            Action::NewStory => {
                manager.reset().await;
                Ok(())
            }
            Action::Quit => break,
        };
        if let Err(e) = outcome {
            println!("{}", e);
        }
    }

    info!("Goodbye");
    Ok(())
}

/// Picks up the saved session and drives it to a finished, exported book.
async fn run_unattended(manager: &mut WorkflowManager) -> Result<()> {
    let state = manager.session().state;
    match state {
        SessionState::Premise | SessionState::GeneratingOutline => {
            anyhow::bail!("Unattended mode needs a saved outline; run interactively first")
        }
        SessionState::DisplayOutline | SessionState::GeneratingChapters => {
            write_book(manager).await?
        }
        SessionState::Completed => {}
    }

    for format in [ExportFormat::Txt, ExportFormat::Pdf] {
        let path = manager.export(format).await?;
        println!("Saved {}", path);
    }
    Ok(())
}

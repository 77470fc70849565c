use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::state::{Session, SessionEvent, SessionState, TransitionError, CHAPTER_COUNT};
use crate::services::export::{self, ExportFormat, PageGeometry};
use crate::services::generator::{ChapterRequest, GenerationError, StoryGenerator};
use crate::services::persistence::SessionStore;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Generation(#[from] GenerationError),
    #[error("An error occurred while writing chapter {chapter}: {source}")]
    Chapter {
        chapter: usize,
        #[source]
        source: GenerationError,
    },
    #[error("{0}")]
    Transition(#[from] TransitionError),
    #[error("The story is not finished yet; export is available once all chapters are written.")]
    NotReady,
    #[error("Sorry, there was an error exporting your story as {format}.")]
    Export { format: ExportFormat, reason: String },
}

pub struct WorkflowManager {
    config: Config,
    generator: StoryGenerator,
    store: SessionStore,
    storage: Arc<dyn Storage>,
    session: Session,
    writing_chapter: watch::Sender<Option<usize>>,
    show_progress: bool,
}

impl WorkflowManager {
    /// Builds the manager and resumes whatever session was saved last.
    pub async fn new(
        config: Config,
        generator: StoryGenerator,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let store = SessionStore::new(storage.clone(), &config.state_folder);
        let session = match store.load().await {
            Some(session) => {
                info!(
                    "Resuming saved story ({}, {}/{} chapters)",
                    session.state,
                    session.chapters.len(),
                    CHAPTER_COUNT
                );
                session
            }
            None => Session::new(),
        };

        Self {
            config,
            generator,
            store,
            storage,
            session,
            writing_chapter: watch::Sender::new(None),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 1-based chapter currently being written.
    pub fn writing_chapter(&self) -> Option<usize> {
        *self.writing_chapter.borrow()
    }

    /// Follows [`Self::writing_chapter`] while a run holds the manager.
    pub fn watch_writing_chapter(&self) -> watch::Receiver<Option<usize>> {
        self.writing_chapter.subscribe()
    }

    fn set_writing_chapter(&self, chapter: Option<usize>) {
        self.writing_chapter.send_replace(chapter);
    }

    async fn transition(&mut self, event: SessionEvent) -> Result<(), TransitionError> {
        self.session = self.session.apply(event)?;
        self.store.save(&self.session).await;
        Ok(())
    }

    /// Applies the outcome of a remote call only if no user action has
    /// started a newer attempt since the call was issued. Every driver today
    /// holds `&mut self` across the call, so this only bites once a driver
    /// runs generation concurrently with user input.
    async fn apply_outcome(
        &mut self,
        attempt: u64,
        event: SessionEvent,
    ) -> Result<bool, TransitionError> {
        if self.session.attempt != attempt {
            warn!(
                "Discarding stale generation result (attempt {}, current {})",
                attempt, self.session.attempt
            );
            return Ok(false);
        }
        self.transition(event).await?;
        Ok(true)
    }

    pub async fn submit_premise(&mut self, premise: &str) -> Result<(), WorkflowError> {
        self.transition(SessionEvent::SubmitPremise(premise.to_string()))
            .await?;
        let attempt = self.session.attempt;

        println!("Generating outline and character arcs...");
        match self.generator.generate_structure(&self.session.premise).await {
            Ok(data) => {
                self.apply_outcome(attempt, SessionEvent::OutlineReady(data))
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.apply_outcome(attempt, SessionEvent::OutlineFailed)
                    .await?;
                Err(e.into())
            }
        }
    }

    pub async fn start_writing(&mut self) -> Result<(), WorkflowError> {
        self.transition(SessionEvent::StartWriting).await?;
        self.write_chapters().await
    }

    /// Continues a chapter run that was interrupted (e.g. by quitting the app).
    pub async fn resume(&mut self) -> Result<(), WorkflowError> {
        match self.session.state {
            SessionState::GeneratingChapters => self.write_chapters().await,
            state => Err(TransitionError::Invalid {
                state,
                event: "resume writing",
            }
            .into()),
        }
    }

    async fn write_chapters(&mut self) -> Result<(), WorkflowError> {
        let attempt = self.session.attempt;
        let story = match (&self.session.story_data, self.session.state) {
            (Some(story), SessionState::GeneratingChapters) => story.clone(),
            (_, state) => {
                return Err(TransitionError::Invalid {
                    state,
                    event: "write chapters",
                }
                .into())
            }
        };

        let pb = self.progress_bar();

        while let Some(number) = self.session.next_chapter() {
            self.set_writing_chapter(Some(number));
            pb.set_message(format!("Writing chapter {}", number));

            let request = ChapterRequest {
                number,
                outline: &story.outline,
                character_arcs: &story.character_arcs,
                previous_chapters: &self.session.chapters,
            };
            let result = self.generator.generate_chapter(&request).await;

            let outcome = match result {
                Ok(text) => {
                    self.apply_outcome(attempt, SessionEvent::ChapterWritten(text))
                        .await
                }
                Err(e) => {
                    error!("Failed to generate chapter {}: {}", number, e);
                    self.set_writing_chapter(None);
                    pb.abandon_with_message(format!("Stopped at chapter {}", number));
                    self.apply_outcome(attempt, SessionEvent::ChaptersFailed)
                        .await?;
                    return Err(WorkflowError::Chapter {
                        chapter: number,
                        source: e,
                    });
                }
            };

            match outcome {
                Ok(true) => pb.inc(1),
                Ok(false) => {
                    self.set_writing_chapter(None);
                    pb.abandon();
                    return Ok(());
                }
                Err(e) => {
                    self.set_writing_chapter(None);
                    pb.abandon();
                    return Err(e.into());
                }
            }
        }

        self.set_writing_chapter(None);
        pb.finish_with_message("All chapters written");
        info!("Story complete ({} chapters)", self.session.chapters.len());
        Ok(())
    }

    fn progress_bar(&self) -> ProgressBar {
        let pb = ProgressBar::new(CHAPTER_COUNT as u64);
        if !self.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_position(self.session.chapters.len() as u64);
        pb
    }

    /// Clears the saved session and starts over.
    pub async fn reset(&mut self) {
        self.store.clear().await;
        self.session = match self.session.apply(SessionEvent::Reset) {
            Ok(session) => session,
            Err(_) => Session {
                attempt: self.session.attempt + 1,
                ..Session::new()
            },
        };
        self.set_writing_chapter(None);
        info!("Session reset");
    }

    /// Writes the finished story to the output folder, returning the file path.
    pub async fn export(&self, format: ExportFormat) -> Result<String, WorkflowError> {
        let story = match (&self.session.story_data, self.session.is_complete()) {
            (Some(story), true) => story,
            _ => return Err(WorkflowError::NotReady),
        };

        let path = Path::new(&self.config.output_folder)
            .join(format.file_name())
            .to_string_lossy()
            .to_string();

        let bytes = match format {
            ExportFormat::Txt => {
                Ok(export::format_story_txt(&self.session.premise, story, &self.session.chapters)
                    .into_bytes())
            }
            ExportFormat::Pdf => {
                let geometry = PageGeometry::a4();
                let pages = export::layout_story(
                    &self.session.premise,
                    story,
                    &self.session.chapters,
                    &geometry,
                );
                export::render_pdf(&pages, &geometry)
            }
        };

        let written = match bytes {
            Ok(bytes) => self.storage.write(&path, &bytes).await,
            Err(e) => Err(e),
        };

        written.map_err(|e| {
            error!("{:?} export failed: {:#}", format, e);
            WorkflowError::Export {
                format,
                reason: format!("{:#}", e),
            }
        })?;

        info!("Exported story to {}", path);
        Ok(path)
    }
}

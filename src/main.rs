use anyhow::Result;
use std::sync::Arc;
use story_weaver::core::config::Config;
use story_weaver::core::io::NativeStorage;
use story_weaver::services::generator::StoryGenerator;
use story_weaver::services::llm::create_llm;
use story_weaver::services::workflow::WorkflowManager;
use story_weaver::ui;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings (see config.example.yml).");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let llm = create_llm(&config)?;
    let generator = StoryGenerator::new(llm, &config.llm);
    let unattended = config.unattended;

    let mut manager = WorkflowManager::new(config, generator, Arc::new(NativeStorage::new()))
        .await
        .with_progress(true);
    ui::run(&mut manager, unattended).await
}

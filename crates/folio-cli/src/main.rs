use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use folio_contracts::analysis::{display_sections, legacy_sections};
use folio_contracts::cache::FileImageCache;
use folio_contracts::data_url::{mime_for_file_name, DataUrl};
use folio_contracts::error::FolioError;
use folio_contracts::events::EventLog;
use folio_contracts::repository::StoryRepository;
use folio_contracts::state::PromptPolicy;
use folio_contracts::store::JsonTableStore;
use folio_contracts::story::{new_id, AspectRatio, Scene, ShotType, Story};
use folio_engine::{FolioConfig, GenerateOutcome, GenerativeModel, ReferenceOutcome, Studio};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliStudio = Studio<Box<dyn GenerativeModel>, FileImageCache, JsonTableStore>;

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Illustrate a novel scene by scene")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct SessionArgs {
    /// Directory holding the image cache, story tables and event log.
    #[arg(long, global = true, default_value = ".folio")]
    data: PathBuf,
    #[arg(long, global = true, default_value = "local")]
    user: String,
    #[arg(long, global = true)]
    text_model: Option<String>,
    #[arg(long, global = true)]
    image_model: Option<String>,
    /// Use the offline deterministic model instead of Gemini.
    #[arg(long, global = true)]
    dryrun: bool,
    /// What a description edit does to a stored prompt: keep or invalidate.
    #[arg(long, global = true)]
    prompt_policy: Option<PromptPolicy>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Story(StoryCommand),
    #[command(subcommand)]
    Character(CharacterCommand),
    #[command(subcommand)]
    Background(BackgroundCommand),
    #[command(subcommand)]
    Style(StyleCommand),
    #[command(subcommand)]
    Scene(SceneCommand),
}

#[derive(Debug, Subcommand)]
enum StoryCommand {
    /// Segment a novel into scenes; `-` reads the text from stdin.
    New {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },
    List,
    Show {
        story: String,
    },
    Delete {
        story: String,
    },
}

#[derive(Debug, Subcommand)]
enum CharacterCommand {
    Add {
        story: String,
        name: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    Rename {
        story: String,
        character: String,
        name: String,
    },
    Image {
        story: String,
        character: String,
        image: PathBuf,
    },
    Reanalyze {
        story: String,
        character: String,
    },
    Remove {
        story: String,
        character: String,
        /// Confirm that the stored analysis may be discarded.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum BackgroundCommand {
    Add {
        story: String,
        name: String,
        image: PathBuf,
    },
    Rename {
        story: String,
        background: String,
        name: String,
    },
    Image {
        story: String,
        background: String,
        image: PathBuf,
    },
    Reanalyze {
        story: String,
        background: String,
    },
    Remove {
        story: String,
        background: String,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum StyleCommand {
    Set { story: String, image: PathBuf },
    Clear { story: String },
}

/// Scenes are addressed by id or by 1-based position.
#[derive(Debug, Subcommand)]
enum SceneCommand {
    /// Compose the prompt on the first call, generate the image on the next.
    Generate { story: String, scene: String },
    /// Generate every scene with a reviewed prompt; the rest get a prompt to review.
    GenerateAll {
        story: String,
        /// Compose and generate in one pass, skipping prompt review.
        #[arg(long)]
        auto_compose: bool,
    },
    Edit {
        story: String,
        scene: String,
        instruction: String,
    },
    Describe {
        story: String,
        scene: String,
        text: String,
    },
    SetPrompt {
        story: String,
        scene: String,
        #[arg(required_unless_present = "file")]
        prompt: Option<String>,
        #[arg(long, conflicts_with = "prompt")]
        file: Option<PathBuf>,
    },
    ClearPrompt { story: String, scene: String },
    Shot {
        story: String,
        scene: String,
        shot: ShotType,
    },
    Aspect {
        story: String,
        scene: String,
        ratio: AspectRatio,
    },
    SaveImage {
        story: String,
        scene: String,
        out: PathBuf,
    },
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("folio error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut studio = open_studio(&cli.session)?;
    let outcome = dispatch(&mut studio, cli.command);
    let synced = studio.flush();
    outcome?;
    synced.context("remote sync failed")?;
    Ok(())
}

fn session_config(session: &SessionArgs) -> Result<FolioConfig> {
    let mut config = FolioConfig::from_env()?;
    if session.text_model.is_some() {
        config.text_model = session.text_model.clone();
    }
    if session.image_model.is_some() {
        config.image_model = session.image_model.clone();
    }
    if let Some(policy) = session.prompt_policy {
        config.prompt_policy = policy;
    }
    config.dryrun |= session.dryrun;
    Ok(config)
}

fn open_studio(session: &SessionArgs) -> Result<CliStudio> {
    let config = session_config(session)?;
    let model = config.build_model()?;
    fs::create_dir_all(&session.data)
        .with_context(|| format!("failed creating {}", session.data.display()))?;
    let repository = StoryRepository::new(
        FileImageCache::new(session.data.join("images.json")),
        JsonTableStore::open(session.data.join("tables.json"))?,
        config.sync_quiet,
    );
    let events = EventLog::new(session.data.join("events.jsonl"), new_id());
    let (studio, report) = Studio::open(
        model,
        repository,
        events,
        session.user.clone(),
        config.prompt_policy,
    )?;
    if report.migrated_images > 0 {
        tracing::info!(migrated = report.migrated_images, "cached remote-only images locally");
    }
    Ok(studio)
}

fn dispatch(studio: &mut CliStudio, command: Command) -> Result<()> {
    match command {
        Command::Story(command) => run_story(studio, command),
        Command::Character(command) => run_character(studio, command),
        Command::Background(command) => run_background(studio, command),
        Command::Style(command) => run_style(studio, command),
        Command::Scene(command) => run_scene(studio, command),
    }
}

fn run_story(studio: &mut CliStudio, command: StoryCommand) -> Result<()> {
    match command {
        StoryCommand::New { file, title } => {
            let text = read_novel(&file)?;
            let story = studio.create_story(title.as_deref(), &text)?;
            println!("{}  {}", story.id, story.title);
            for (idx, scene) in story.scenes.iter().enumerate() {
                println!("  {:>2}. {}", idx + 1, scene.description);
            }
        }
        StoryCommand::List => {
            for story in studio.stories() {
                let done = story.scenes.iter().filter(|scene| scene.image.is_some()).count();
                println!(
                    "{}  {}  ({done}/{} illustrated)",
                    story.id,
                    story.title,
                    story.scenes.len()
                );
            }
        }
        StoryCommand::Show { story } => print!("{}", render_story(studio.story(&story)?)),
        StoryCommand::Delete { story } => {
            studio.delete_story(&story)?;
            println!("deleted {story}");
        }
    }
    Ok(())
}

fn run_character(studio: &mut CliStudio, command: CharacterCommand) -> Result<()> {
    match command {
        CharacterCommand::Add { story, name, image } => {
            let image = image.as_deref().map(read_image).transpose()?;
            let outcome = studio.add_character(&story, &name, image)?;
            report_reference("character", &outcome);
        }
        CharacterCommand::Rename {
            story,
            character,
            name,
        } => studio.rename_character(&story, &character, &name)?,
        CharacterCommand::Image {
            story,
            character,
            image,
        } => {
            let outcome = studio.set_character_image(&story, &character, read_image(&image)?)?;
            report_reference("character", &outcome);
        }
        CharacterCommand::Reanalyze { story, character } => {
            studio.reanalyze_character(&story, &character)?
        }
        CharacterCommand::Remove {
            story,
            character,
            yes,
        } => studio.remove_character(&story, &character, yes)?,
    }
    Ok(())
}

fn run_background(studio: &mut CliStudio, command: BackgroundCommand) -> Result<()> {
    match command {
        BackgroundCommand::Add { story, name, image } => {
            let outcome = studio.add_background(&story, &name, read_image(&image)?)?;
            report_reference("background", &outcome);
        }
        BackgroundCommand::Rename {
            story,
            background,
            name,
        } => studio.rename_background(&story, &background, &name)?,
        BackgroundCommand::Image {
            story,
            background,
            image,
        } => {
            let outcome = studio.set_background_image(&story, &background, read_image(&image)?)?;
            report_reference("background", &outcome);
        }
        BackgroundCommand::Reanalyze { story, background } => {
            studio.reanalyze_background(&story, &background)?
        }
        BackgroundCommand::Remove {
            story,
            background,
            yes,
        } => studio.remove_background(&story, &background, yes)?,
    }
    Ok(())
}

fn run_style(studio: &mut CliStudio, command: StyleCommand) -> Result<()> {
    match command {
        StyleCommand::Set { story, image } => {
            if let Some(err) = studio.set_art_style(&story, read_image(&image)?)? {
                eprintln!("warning: art style saved without analysis: {err}");
            }
        }
        StyleCommand::Clear { story } => studio.clear_art_style(&story)?,
    }
    Ok(())
}

fn run_scene(studio: &mut CliStudio, command: SceneCommand) -> Result<()> {
    match command {
        SceneCommand::Generate { story, scene } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            match studio.generate(&story, &scene_id)? {
                GenerateOutcome::PromptComposed(prompt) => {
                    println!("{prompt}");
                    println!("\nprompt saved; run generate again to render the image");
                }
                GenerateOutcome::ImageGenerated(image) => {
                    println!("generated {} ({})", scene_id, image.mime_type());
                }
            }
        }
        SceneCommand::GenerateAll {
            story,
            auto_compose,
        } => {
            let report = studio.generate_all(&story, auto_compose, |current, total| {
                eprintln!("[{current}/{total}] generating");
            })?;
            println!(
                "{} of {} scenes generated",
                report.generated.len(),
                report.total
            );
            if !report.composed.is_empty() {
                println!(
                    "{} prompts composed for review; run generate-all again to render them",
                    report.composed.len()
                );
            }
            for (scene_id, message) in &report.failed {
                println!("  failed {scene_id}: {message}");
            }
        }
        SceneCommand::Edit {
            story,
            scene,
            instruction,
        } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            studio.edit(&story, &scene_id, &instruction)?;
            println!("edited {scene_id}");
        }
        SceneCommand::Describe { story, scene, text } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            studio.edit_description(&story, &scene_id, &text)?;
        }
        SceneCommand::SetPrompt {
            story,
            scene,
            prompt,
            file,
        } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            let prompt = match (prompt, file) {
                (Some(prompt), _) => prompt,
                (None, Some(file)) => fs::read_to_string(&file)
                    .with_context(|| format!("failed reading {}", file.display()))?,
                (None, None) => bail!("a prompt or --file is required"),
            };
            studio.set_custom_prompt(&story, &scene_id, &prompt)?;
        }
        SceneCommand::ClearPrompt { story, scene } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            studio.clear_custom_prompt(&story, &scene_id)?;
        }
        SceneCommand::Shot { story, scene, shot } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            studio.set_shot_type(&story, &scene_id, shot)?;
        }
        SceneCommand::Aspect {
            story,
            scene,
            ratio,
        } => {
            let scene_id = resolve_scene(studio.story(&story)?, &scene)?;
            studio.set_aspect_ratio(&story, &scene_id, ratio)?;
        }
        SceneCommand::SaveImage { story, scene, out } => {
            let story = studio.story(&story)?;
            let scene_id = resolve_scene(story, &scene)?;
            let image = story.scene(&scene_id)?.image.as_ref().ok_or_else(|| {
                FolioError::validation(format!("scene '{scene_id}' has no image yet"))
            })?;
            fs::write(&out, image.decode()?)
                .with_context(|| format!("failed writing {}", out.display()))?;
            println!("{}", out.display());
        }
    }
    Ok(())
}

fn report_reference(entity: &str, outcome: &ReferenceOutcome) {
    println!("{}", outcome.id);
    if let Some(err) = outcome.analysis_error.as_ref() {
        eprintln!("warning: {entity} saved without a new analysis: {err}");
    }
}

/// Scene id for `key`, which is either an id or a 1-based position.
fn resolve_scene(story: &Story, key: &str) -> Result<String, FolioError> {
    let key = key.trim();
    if let Ok(position) = key.parse::<usize>() {
        return position
            .checked_sub(1)
            .and_then(|idx| story.scenes.get(idx))
            .map(|scene| scene.id.clone())
            .ok_or_else(|| FolioError::not_found("scene", key));
    }
    story.scene(key).map(|scene| scene.id.clone())
}

fn read_novel(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))
}

fn read_image(path: &Path) -> Result<DataUrl> {
    let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    let Some(mime_type) = mime_for_file_name(name) else {
        return Err(FolioError::validation(format!(
            "{} is not a png, jpeg, webp or gif image",
            path.display()
        ))
        .into());
    };
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    if bytes.is_empty() {
        return Err(FolioError::validation(format!("{} is empty", path.display())).into());
    }
    Ok(DataUrl::from_bytes(mime_type, &bytes))
}

fn render_story(story: &Story) -> String {
    let mut out = format!("{}  {}\n", story.id, story.title);
    match story.art_style.as_ref() {
        Some(style) if style.analysis.is_some() => out.push_str("art style: analyzed\n"),
        Some(_) => out.push_str("art style: set (no analysis)\n"),
        None => {}
    }
    if !story.characters.is_empty() {
        out.push_str("characters:\n");
        for character in &story.characters {
            let status = match (&character.image, &character.analysis) {
                (Some(_), Some(_)) => "analyzed",
                (Some(_), None) => "image only",
                (None, _) => "no image",
            };
            out.push_str(&format!("  {}  {} [{status}]\n", character.id, character.name));
            if let Some(description) = character.effective_description() {
                out.push_str(&format!("      {}\n", display_sections(&legacy_sections(&description))));
            }
        }
    }
    if !story.backgrounds.is_empty() {
        out.push_str("backgrounds:\n");
        for background in &story.backgrounds {
            let status = if background.analysis.is_some() {
                "analyzed"
            } else {
                "image only"
            };
            out.push_str(&format!("  {}  {} [{status}]\n", background.id, background.name));
        }
    }
    out.push_str("scenes:\n");
    for (idx, scene) in story.scenes.iter().enumerate() {
        out.push_str(&render_scene(idx + 1, scene));
    }
    out
}

fn render_scene(position: usize, scene: &Scene) -> String {
    let mut line = format!(
        "  {position:>2}. {} [{}; {}; {}]\n      {}\n",
        scene.id, scene.stage, scene.shot_type, scene.aspect_ratio, scene.description
    );
    if let Some(location) = scene
        .structured
        .as_ref()
        .and_then(|structured| structured.location.as_deref())
    {
        line.push_str(&format!("      at {location}\n"));
    }
    line
}

//! localgen - local text generation from the command line
//!
//! Loads the configured model, then reads prompts and `:commands` from stdin.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localgen::app::{AppError, ChatController, ChatEvent};
use localgen::inference::{CatalogLoader, ModelCatalog};
use localgen::storage::init_storage;
use localgen::storage::settings::{get_settings_path, load_settings, Reload};
use localgen::system::SystemProbe;

const HELP: &str = "\
Commands:
  :devices              list devices and their details
  :device <id>          switch device (cpu, cuda:0, ...)
  :model <name>         switch model
  :models               list available models
  :precision <p>        full or half
  :set <key> <value>    change a setting (temperature, top_k, top_p, ...)
  :status               show the loaded model
  :clear                clear the transcript
  :save                 save settings
  :quit                 exit
Anything else is sent to the model as a prompt.";

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localgen=info")))
        .init();

    info!("Starting localgen v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    if let Err(e) = init_storage() {
        warn!("Storage unavailable, settings will not persist: {}", e);
    }

    let settings = load_settings();
    let catalog = ModelCatalog::new(Some(settings.models_directory.clone()));
    let loader = CatalogLoader::new(catalog, settings.gpu_layers);
    let mut controller = ChatController::new(settings, Box::new(SystemProbe), Arc::new(loader))?;

    print_devices(&controller);
    controller.start()?;
    wait_for_load(&mut controller).await;
    println!("{}", controller.status_line());
    println!("Type :help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };

        match handle_line(&mut controller, line.trim()).await {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    controller.shutdown()
}

async fn handle_line(controller: &mut ChatController, line: &str) -> Result<Flow, AppError> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }
    let Some(command) = line.strip_prefix(':') else {
        chat(controller, line).await?;
        return Ok(Flow::Continue);
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match (name, arg) {
        ("quit" | "q" | "exit", _) => return Ok(Flow::Quit),
        ("help", _) => println!("{}", HELP),
        ("devices", _) => print_devices(controller),
        ("models", _) => {
            for model in controller.available_models() {
                println!("  {}", model);
            }
        }
        ("status", _) => println!("{}", controller.status_line()),
        ("clear", _) => {
            controller.clear_transcript();
            println!("Transcript cleared.");
        }
        ("save", _) => {
            let path = get_settings_path()?;
            controller.save_settings(&path)?;
            println!("Settings saved to {}", path.display());
        }
        ("device", id) if !id.is_empty() => change_setting(controller, "device", id).await?,
        ("model", model) if !model.is_empty() => change_setting(controller, "model", model).await?,
        ("precision", p) if !p.is_empty() => change_setting(controller, "precision", p).await?,
        ("set", rest) => match rest.split_once(char::is_whitespace) {
            Some((key, value)) => change_setting(controller, key, value.trim()).await?,
            None => println!("Usage: :set <key> <value>"),
        },
        _ => println!("Unknown command: {}\n{}", line, HELP),
    }
    Ok(Flow::Continue)
}

async fn change_setting(
    controller: &mut ChatController,
    key: &str,
    value: &str,
) -> Result<(), AppError> {
    let mut next = controller.settings().clone();
    next.set(key, value)?;
    if controller.apply_settings(next)? != Reload::None {
        wait_for_load(controller).await;
    }
    println!("{}", controller.status_line());
    Ok(())
}

async fn chat(controller: &mut ChatController, prompt: &str) -> Result<(), AppError> {
    let id = controller.send_message(prompt)?;
    while let Some(event) = controller.next_event().await {
        match event {
            ChatEvent::Reply(result) if result.request_id == id => {
                println!("AI: {}", result.text);
                break;
            }
            ChatEvent::Failed { request_id, error } if request_id == id => {
                println!("Error: {}", error);
                break;
            }
            other => report(&other),
        }
    }
    Ok(())
}

async fn wait_for_load(controller: &mut ChatController) {
    println!("Loading {}...", controller.settings().model);
    while let Some(event) = controller.next_event().await {
        let done = matches!(
            event,
            ChatEvent::ModelLoaded(_) | ChatEvent::ModelLoadFailed(_)
        );
        report(&event);
        if done {
            break;
        }
    }
}

fn report(event: &ChatEvent) {
    match event {
        ChatEvent::ModelLoaded(info) => println!(
            "Loaded {} on {} ({} precision, {} vocab, {} context)",
            info.model_name,
            info.device,
            info.precision,
            info.facts.vocab_size,
            info.facts.context_length
        ),
        ChatEvent::ModelLoadFailed(e) => println!("Model load failed: {}", e),
        ChatEvent::Reply(result) => println!("AI: {}", result.text),
        ChatEvent::Failed { error, .. } => println!("Error: {}", error),
    }
}

fn print_devices(controller: &ChatController) {
    println!("Available devices:");
    for device in controller.devices() {
        println!("  {}", device);
        match controller.describe_device(device) {
            Ok(info) => {
                for (key, value) in info {
                    println!("    {}: {}", key, value);
                }
            }
            Err(e) => println!("    (details unavailable: {})", e),
        }
    }
}

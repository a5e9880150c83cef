use crate::cli::{Cli, Commands, PresetCommand};
use anyhow::{Context, Result, bail};
use crossbeam::channel::Receiver;
use fc_channels::config::Config;
use fc_channels::engine::validate::FieldKind;
use fc_channels::engine::{
    Channels, FieldValue, FormatTag, Geometry, PresetStore, Schema, ServiceOptions,
};
use fc_channels::logging::{self, LogLevel};
use std::collections::BTreeMap;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often `serve` checks its deadline and Ctrl-C while waiting for requests
const SERVE_POLL: Duration = Duration::from_millis(200);

pub fn run(cli: Cli) {
    if let Some(Commands::InitConfig) = cli.command {
        handle_init_config(cli.config.as_deref());
        return;
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            process::exit(1);
        }
    };
    init_logging(&config, cli.log_level);

    let result = match cli.command {
        Some(Commands::Serve { duration }) => handle_serve(&config, duration),
        Some(Commands::Find { channel, timeout }) => handle_find(&config, &channel, timeout),
        Some(Commands::Send {
            channel,
            format,
            geometry,
        }) => handle_send(&config, &channel, &format, &geometry),
        Some(Commands::Channels) => handle_channels(&config),
        Some(Commands::Preset(command)) => handle_preset(&config, command),
        Some(Commands::InitConfig) => Ok(()),
        None if config.startup.start_on_boot => handle_serve(&config, None),
        None => {
            println!("Service not started (startup.start_on_boot is off). Run 'fc-channels serve'.");
            handle_channels(&config)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) if path.exists() => Config::load_from(path),
        Some(_) => Ok(Config::default()),
        None => Config::load(),
    }
}

fn init_logging(config: &Config, cli_level: Option<LogLevel>) {
    let level = cli_level
        .or_else(|| config.logging.level.parse().ok())
        .unwrap_or(LogLevel::Info);
    let log_dir = if config.logging.file {
        Config::data_dir().ok()
    } else {
        None
    };

    if let Err(e) = logging::init(level.as_tracing_level(), log_dir.as_deref()) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }
}

fn open_presets(config: &Config) -> Result<PresetStore> {
    let path = config.presets_path()?;
    PresetStore::open(&path, Schema::builtin())
        .with_context(|| format!("Failed to open presets: {}", path.display()))
}

fn open_channels(config: &Config) -> Result<Channels> {
    let presets = open_presets(config)?;
    let options = ServiceOptions {
        discovery_addr: config.discovery.addr()?,
        ..Default::default()
    };
    Ok(Channels::new(Arc::new(presets), options))
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid duration: {}", value))
}

fn handle_serve(config: &Config, duration: Option<f64>) -> Result<()> {
    let channels = open_channels(config)?;
    let deadline = match duration {
        Some(secs) => Some(Instant::now() + seconds(secs)?),
        None => None,
    };

    let (interrupt_tx, interrupt) = crossbeam::channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let state = channels.start_service()?;
    if let Some(address) = &state.address {
        println!("Listening as {}", address.display());
    }

    serve_until(&channels, deadline, &interrupt)?;
    println!("Stopped");
    Ok(())
}

/// Print delivered requests until `deadline` passes or an interrupt arrives,
/// then stop the service
fn serve_until(
    channels: &Channels,
    deadline: Option<Instant>,
    interrupt: &Receiver<()>,
) -> Result<()> {
    loop {
        if interrupt.try_recv().is_ok() {
            tracing::info!("Interrupted, stopping the channel service");
            break;
        }
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(SERVE_POLL)
            }
            None => SERVE_POLL,
        };

        if let Some(request) = channels.service().next_request(wait) {
            println!(
                "Received {} ({}, {} bytes) from {}",
                request.name,
                request.format,
                request.data.len(),
                request.source
            );
        }
    }

    channels.stop_service()?;
    Ok(())
}

fn handle_find(config: &Config, channel: &str, timeout: Option<f64>) -> Result<()> {
    let channels = open_channels(config)?;
    let endpoint = match timeout {
        Some(secs) => channels.service().find(channel, seconds(secs)?)?,
        None => channels.find_channel(channel)?,
    };
    println!("Found {} at {}", channel, endpoint);
    Ok(())
}

fn handle_send(config: &Config, channel: &str, format: &str, geometry: &Path) -> Result<()> {
    let format: FormatTag = format.parse()?;
    let geometry = Geometry::load(geometry)?;

    let channels = open_channels(config)?;
    let report = channels.send_objects(channel, format, geometry)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_done() {
        bail!("Export to {} failed: {}", channel, report.status);
    }
    Ok(())
}

fn handle_channels(config: &Config) -> Result<()> {
    let channels = open_channels(config)?;
    for channel in channels.channels() {
        let formats: Vec<String> = channel
            .supported_formats
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "- {} ({}): {}",
            channel.id,
            channel.display_name,
            formats.join(", ")
        );
    }
    Ok(())
}

fn handle_preset(config: &Config, command: PresetCommand) -> Result<()> {
    let store = open_presets(config)?;

    match command {
        PresetCommand::List => {
            let active = store.get_active().name.clone();
            for name in store.list() {
                let marker = if name == active { "*" } else { " " };
                let default = if store.get(&name).is_some_and(|p| p.is_default) {
                    " (default)"
                } else {
                    ""
                };
                println!("{} {}{}", marker, name, default);
            }
        }
        PresetCommand::Show { name } => {
            let preset = match name {
                Some(name) => store
                    .get(&name)
                    .with_context(|| format!("Preset '{}' not found", name))?,
                None => store.get_active(),
            };
            println!("[{}]", preset.name);
            for (key, value) in &preset.fields {
                let unit = store
                    .schema()
                    .get(key)
                    .and_then(|c| c.unit.as_deref())
                    .map(|u| format!(" {}", u))
                    .unwrap_or_default();
                println!("{} = {}{}", key, value, unit);
            }
        }
        PresetCommand::SaveAs { name, fields } => {
            let fields = with_assignments(&store, &fields)?;
            store.save_as(&name, fields)?;
            println!("Saved preset '{}'", name);
        }
        PresetCommand::Rename { old_name, new_name } => {
            store.rename(&old_name, &new_name)?;
            println!("Renamed '{}' to '{}'", old_name, new_name);
        }
        PresetCommand::Delete { name } => {
            store.delete(&name)?;
            println!("Deleted preset '{}'", name);
        }
        PresetCommand::Use { name } => {
            store.set_active(&name)?;
            println!("Active preset is now '{}'", name);
        }
        PresetCommand::Set { fields } => {
            let fields = with_assignments(&store, &fields)?;
            store.update_current(fields)?;
            println!("Updated preset '{}'", store.get_active().name);
        }
    }
    Ok(())
}

/// Active preset's fields with `KEY=VALUE` overrides applied
fn with_assignments(
    store: &PresetStore,
    assignments: &[String],
) -> Result<BTreeMap<String, FieldValue>> {
    let mut fields = store.get_active().fields.clone();
    for assignment in assignments {
        let (key, value) = parse_assignment(store.schema(), assignment)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn parse_assignment(schema: &Schema, assignment: &str) -> Result<(String, FieldValue)> {
    let Some((key, value)) = assignment.split_once('=') else {
        bail!("Expected KEY=VALUE, got '{}'", assignment);
    };
    let key = key.trim();

    // Text fields keep digit-only input as text
    let value = match schema.get(key).map(|c| c.kind) {
        Some(FieldKind::Text) => FieldValue::Text(value.to_string()),
        _ => FieldValue::parse(value),
    };
    Ok((key.to_string(), value))
}

fn handle_init_config(path: Option<&Path>) {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match Config::config_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("Config path unknown: {:#}", e);
                process::exit(1);
            }
        },
    };

    match Config::load_from(&path) {
        Ok(cfg) => {
            println!("Config loaded successfully from {}", path.display());
            println!("{:#?}", cfg);
        }
        Err(e) => {
            println!("Config missing or invalid: {:#}", e);
            println!("Creating default config...");

            if let Err(err) = Config::default().save_to(&path) {
                eprintln!("Failed to save default config: {:#}", err);
                process::exit(1);
            }
            println!("Default config saved to {}", path.display());
        }
    }
}

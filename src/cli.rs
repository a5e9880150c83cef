use clap::{Parser, Subcommand};
use fc_channels::logging::LogLevel;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fc-channels")]
#[command(about = "Send CAD objects to running applications over local channels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Console log level (overrides config; RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Use this config file instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the channel service and print what peers deliver
    Serve {
        /// Stop after this many seconds (runs until killed otherwise)
        #[arg(long = "for", value_name = "SECS")]
        duration: Option<f64>,
    },

    /// Look for a running peer of a channel
    Find {
        /// Channel id, e.g. "blender"
        channel: String,

        /// Seconds to wait (defaults to the active preset's discovery timeout)
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Encode geometry from a JSON file and send it to a channel
    Send {
        /// Channel id, e.g. "blender"
        channel: String,

        /// obj or gltf
        format: String,

        /// Geometry file ({"objects": [{"name", "positions", "normals", "triangles"}]})
        geometry: PathBuf,
    },

    /// List known channels
    Channels,

    /// Manage configuration presets
    #[command(subcommand)]
    Preset(PresetCommand),

    /// Show config status and location, or create default config if missing
    InitConfig,
}

#[derive(Subcommand)]
pub enum PresetCommand {
    /// List presets, marking the default and the active one
    List,

    /// Show the fields of a preset (the active one by default)
    Show { name: Option<String> },

    /// Save the active preset's fields, with overrides, under a new name
    SaveAs {
        name: String,

        /// Field overrides
        #[arg(value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Rename a preset
    Rename { old_name: String, new_name: String },

    /// Delete a preset
    Delete { name: String },

    /// Make a preset active
    Use { name: String },

    /// Change fields of the active preset
    Set {
        #[arg(value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

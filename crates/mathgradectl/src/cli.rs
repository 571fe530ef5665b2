//! CLI - Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Math homework grading client
#[derive(Parser)]
#[command(name = "mathgradectl")]
#[command(about = "Grade math homework through a mathgraded tool endpoint", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (overrides $MATHGRADE_CONFIG and the user config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Endpoint host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Endpoint port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Grade a photographed assignment
    Grade {
        /// JPEG or PNG image of the homework
        image: PathBuf,

        #[arg(long)]
        grade_level: String,

        #[arg(long)]
        student: String,

        /// Defaults to the image file name
        #[arg(long)]
        homework_id: Option<String>,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// List the endpoint's tools
    Tools,

    /// Check that the endpoint answers keepalives
    Ping,

    /// Call one tool with JSON arguments
    Call {
        tool: String,

        /// Arguments object, e.g. '{"expression": "2+2"}'
        args: String,
    },
}

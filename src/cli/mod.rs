use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tpupload",
    about = "Transcript Uploader - Send audio and video files to storage for transcription",
    version,
    long_about = "A CLI tool that validates audio and video files, streams them straight to object storage under your signed-in session, and registers each upload so it can be transcribed."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./config.yaml, then the user config directory)
    #[arg(long, global = true, value_name = "FILE", env = "TRANSCRIPT_UPLOADER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the session for later uploads
    Login {
        /// Account e-mail
        #[arg(short, long)]
        email: String,

        /// Account password (or set TRANSCRIPT_UPLOADER_PASSWORD)
        #[arg(short, long, env = "TRANSCRIPT_UPLOADER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Forget the stored session
    Logout,

    /// Show who is signed in
    Whoami,

    /// Check files against the upload policy without uploading
    Check {
        /// Files to check
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Declared MIME type (guessed from the extension if not specified)
        #[arg(long, value_name = "TYPE")]
        mime_type: Option<String>,
    },

    /// Upload audio or video files
    Upload {
        /// Files to upload
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Declared MIME type (guessed from the extension if not specified)
        #[arg(long, value_name = "TYPE")]
        mime_type: Option<String>,

        /// Output format for the resulting records
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show or edit configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text
    Text,
    /// JSON
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_upload_arguments() {
        let cli = Cli::try_parse_from(["tpupload", "upload", "a.mp3", "b.wav", "--format", "json", "-q"]).unwrap();
        assert!(cli.quiet);
        match cli.command {
            Commands::Upload { files, format, mime_type } => {
                assert_eq!(files, vec![PathBuf::from("a.mp3"), PathBuf::from("b.wav")]);
                assert_eq!(format, OutputFormat::Json);
                assert!(mime_type.is_none());
            }
            _ => panic!("expected upload command"),
        }
    }

    #[test]
    fn test_upload_requires_a_file() {
        assert!(Cli::try_parse_from(["tpupload", "upload"]).is_err());
    }
}

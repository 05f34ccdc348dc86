//! Command-line arguments.

use clap::{Parser, Subcommand};
use fani_store::ContentAddress;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fani", author, version, about = "Publish and call content-addressed WebAssembly functions", long_about = None)]
pub struct Cli {
    /// Keep blocks in memory instead of on disk
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish a WebAssembly module and print its descriptor address
    Deploy {
        /// Function name recorded in the descriptor
        name: String,

        /// Path to the compiled module
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Keep serving content to peers after publishing
        #[arg(long)]
        serve: bool,
    },

    /// Call a published function and print the address of its output
    Call {
        /// Descriptor address
        descriptor: ContentAddress,

        /// Argument addresses; anything else is stored and passed by address
        args: Vec<String>,

        /// Store every argument as data, even if it looks like an address
        #[arg(long)]
        inline: bool,

        /// Keep serving content to peers after the call
        #[arg(long)]
        serve: bool,
    },

    /// Run a published function locally and write its output to stdout
    Exec {
        /// Descriptor address
        descriptor: ContentAddress,
    },

    /// Provide locally stored content to peers until interrupted
    Serve,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::parse_from(["fani", "deploy", "helloworld", "hello.wasm"]);
        assert!(!cli.ephemeral);
        match cli.command {
            Command::Deploy { name, file, serve } => {
                assert_eq!(name, "helloworld");
                assert_eq!(file, PathBuf::from("hello.wasm"));
                assert!(!serve);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_with_flags() {
        let cli = Cli::parse_from([
            "fani", "call", ADDRESS, "world", "again", "--inline", "--serve", "--ephemeral",
        ]);
        assert!(cli.ephemeral);
        match cli.command {
            Command::Call {
                descriptor,
                args,
                inline,
                serve,
            } => {
                assert_eq!(descriptor.to_string(), ADDRESS);
                assert_eq!(args, vec!["world", "again"]);
                assert!(inline);
                assert!(serve);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_descriptor_address() {
        assert!(Cli::try_parse_from(["fani", "exec", "QmYwAPJzv5CZsnA"]).is_err());
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["fani", "--ephemeral", "serve"]);
        assert!(cli.ephemeral);
        assert!(matches!(cli.command, Command::Serve));
    }
}

//! fani command-line entry point.
//!
//! Every command starts a node (block store, block server, discovery),
//! performs its work, and prints the result to stdout. Logs go to stderr
//! so results can be piped.
//!
//! ## Commands
//!
//! - **deploy** `<name> <file>`: publish a module, print the descriptor address
//! - **call** `<descriptor> [arg...]`: invoke, print the result address
//! - **exec** `<descriptor>`: run locally, write raw output to stdout
//! - **serve**: provide stored content to peers until Ctrl-C

mod cli;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Command};
use fani_core::{InvocationError, Node, NodeConfig};
use fani_store::{ContentAddress, ContentStore};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command results
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("fani=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = NodeConfig::from_env();
    config.ephemeral = cli.ephemeral;
    tracing::debug!(?config, "Configuration loaded");
    config.validate_warn();

    let node = Node::start(config).await.context("failed to start node")?;

    let serve = match &cli.command {
        Command::Deploy { serve, .. } | Command::Call { serve, .. } => *serve,
        Command::Exec { .. } => false,
        Command::Serve => true,
    };

    let outcome = run(&node, cli.command).await;

    if outcome.is_ok() && serve {
        node.serve_until(shutdown_signal()).await;
    } else {
        node.shutdown().await;
    }
    outcome
}

async fn run(node: &Node, command: Command) -> anyhow::Result<()> {
    let orchestrator = node.orchestrator();

    match command {
        Command::Deploy { name, file, .. } => {
            let bytecode = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let address = orchestrator.deploy(Bytes::from(bytecode), &name).await?;
            println!("{address}");
        }

        Command::Call {
            descriptor,
            args,
            inline,
            ..
        } => {
            let args = resolve_args(orchestrator.context().store().as_ref(), &args, inline).await?;
            let result = orchestrator
                .call(&descriptor, &args)
                .await
                .map_err(report)?;
            println!("{result}");
        }

        Command::Exec { descriptor } => {
            let result = orchestrator.execute(&descriptor).await.map_err(report)?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&result.output).await?;
            stdout.flush().await?;
        }

        Command::Serve => {
            println!("{}", node.local_addr());
        }
    }

    Ok(())
}

/// Turn command-line arguments into content addresses.
///
/// An argument that parses as an address is used as-is unless `inline` is
/// set; anything else is stored first and passed by its new address.
async fn resolve_args(
    store: &dyn ContentStore,
    args: &[String],
    inline: bool,
) -> anyhow::Result<Vec<ContentAddress>> {
    let mut addresses = Vec::with_capacity(args.len());
    for arg in args {
        if !inline {
            if let Ok(address) = arg.parse::<ContentAddress>() {
                addresses.push(address);
                continue;
            }
        }
        let address = store
            .put(Bytes::from(arg.clone().into_bytes()))
            .await
            .context("failed to store argument")?;
        tracing::debug!(address = %address, "Stored inline argument");
        addresses.push(address);
    }
    Ok(addresses)
}

/// Attach the error kind so it shows up next to the failing stage.
fn report(e: InvocationError) -> anyhow::Error {
    let kind = e.kind();
    anyhow::Error::new(e).context(kind.to_string())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
    tracing::info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fani_store::MemoryStore;

    #[tokio::test]
    async fn test_resolve_args_stores_plain_values() {
        let store = MemoryStore::new();
        let args = vec!["world".to_string()];
        let addresses = resolve_args(&store, &args, false).await.unwrap();
        assert_eq!(addresses, vec![ContentAddress::of(b"world")]);
        assert_eq!(
            store.get(&addresses[0]).await.unwrap(),
            Bytes::from_static(b"world")
        );
    }

    #[tokio::test]
    async fn test_resolve_args_passes_addresses_through() {
        let store = MemoryStore::new();
        let existing = ContentAddress::of(b"elsewhere");
        let args = vec![existing.to_string()];

        let addresses = resolve_args(&store, &args, false).await.unwrap();
        assert_eq!(addresses, vec![existing]);
        assert!(store.is_empty().await);

        // --inline stores the address text itself
        let addresses = resolve_args(&store, &args, true).await.unwrap();
        assert_eq!(addresses, vec![ContentAddress::of(existing.to_string().as_bytes())]);
    }

    #[test]
    fn test_report_names_kind_and_stage() {
        let err = report(InvocationError {
            stage: fani_core::CallState::Resolving,
            error: fani_core::CoreError::ContentUnavailable("timed out".into()),
        });
        let rendered = format!("{err:#}");
        assert!(rendered.starts_with("ContentUnavailable"));
        assert!(rendered.contains("resolving failed"));
    }
}

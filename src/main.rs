use clap::Parser;
use std::io;
use std::sync::Arc;

use loyalty_ledger::csv::{read_commands, write_balances};
use loyalty_ledger::store;
use loyalty_ledger::{Config, HttpAccrualClient, LoyaltyLedger, ReconciliationEngine};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    if config.input.extension().is_none_or(|ext| ext != "csv") {
        warn!(path = %config.input.display(), "input file seems to not be a csv file");
    }

    let commands = match read_commands(config.input.clone()) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let store = match store::connect(&config.store_kind(), config.request_timeout()).await {
        Ok(store) => store,
        Err(e) => {
            error!(reason = %e, "failed to open store");
            std::process::exit(1);
        }
    };
    let oracle = match HttpAccrualClient::new(&config.accrual_address, config.request_timeout()) {
        Ok(oracle) => oracle,
        Err(e) => {
            error!(reason = %e, "failed to build accrual client");
            std::process::exit(1);
        }
    };
    let engine = ReconciliationEngine::new(store, Arc::new(oracle), config.reconcile());
    let ledger = LoyaltyLedger::new(Arc::new(engine), config.workers, config.queue_size);

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    ledger.run(ReceiverStream::new(cmd_receiver)).await;

    if let Err(e) = ledger.reconcile_all().await {
        error!(reason = %e, "final reconciliation failed");
    }

    let mut balances = Vec::new();
    for user in ledger.users().await.expect("failed to list users") {
        match ledger.balance(user).await {
            Ok(balance) => balances.push((user, balance)),
            Err(e) => error!(user = %user, reason = %e, "failed to read balance"),
        }
    }

    write_balances(io::stdout().lock(), balances).expect("failed to write balances");

    ledger.shutdown().await;
}

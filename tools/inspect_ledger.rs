//! Ledger inspection tool
//!
//! Prints a wallet with its journal and reconciliation result, a lottery
//! slot, or raw keys under a prefix. Open the database only while the daemon
//! is stopped.

use casino_ledger::lottery::LotteryStore;
use casino_ledger::wallet::WalletLedger;
use casino_ledger::LedgerStorage;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "inspect_ledger")]
#[command(about = "Inspect casino ledger database contents")]
struct Cli {
    /// Path to database directory
    #[arg(short, long, default_value = "./DB/ledger_data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet balances, history and reconciliation
    Wallet {
        user_id: String,

        /// Journal entries to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// One lottery slot
    Slot { slot_id: String },

    /// Raw keys under a prefix
    Keys {
        #[arg(short, long, default_value = "")]
        prefix: String,

        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let storage = LedgerStorage::open_path(&cli.data_dir)?;

    match cli.command {
        Commands::Wallet { user_id, limit } => {
            let ledger = WalletLedger::new(storage);
            let wallet = ledger.get(&user_id)?;

            println!("Wallet {} (version {})", wallet.user_id, wallet.version);
            for (kind, amount) in wallet.balances() {
                println!("  {:<16} {}", kind, amount);
            }
            println!(
                "  turnover         {} / {}",
                wallet.turnover.completed, wallet.turnover.required
            );

            println!("\nJournal:");
            for entry in ledger.journal().history(&user_id, limit)? {
                println!(
                    "  {} {:<16} {:>14} v{} {}",
                    entry.timestamp, entry.tx_type, entry.amount, entry.wallet_version, entry.description
                );
            }

            let report = ledger.journal().reconcile(&wallet)?;
            if report.is_consistent() {
                println!("\nReconciliation: OK ({} entries)", report.entries);
            } else {
                println!("\nReconciliation: MISMATCH");
                for m in &report.mismatches {
                    println!("  {:<16} journal {} wallet {}", m.balance, m.journal, m.wallet);
                }
            }
        }
        Commands::Slot { slot_id } => {
            let store = LotteryStore::new(storage);
            match store.get(&slot_id)? {
                Some(slot) => {
                    println!("{}", serde_json::to_string_pretty(&slot)?);
                    for ticket in store.tickets(&slot_id)? {
                        println!("  #{:<6} {}", ticket.ticket_no, ticket.user_id);
                    }
                }
                None => println!("Slot {} not found", slot_id),
            }
        }
        Commands::Keys { prefix, limit } => {
            for key in storage.scan_keys(prefix.as_bytes(), limit)? {
                println!("  {}", key);
            }
        }
    }

    Ok(())
}

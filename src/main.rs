use anyhow::Result;
use dotenv::dotenv;
use log::info;
use p2p_share_rust::config::ShareConfig;
use p2p_share_rust::node::ShareNode;
use std::io::{self, Write};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    ctrlc::set_handler(|| {
        println!();
        println!("[*] Exiting...");
        std::process::exit(0);
    })?;

    let node_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "share-node".to_string());
    let config = ShareConfig::from_env();

    println!("=== P2P Share Node ===");
    println!("Node: {}", node_name);
    println!("Sharing directory: {}", config.shared_dir.display());
    println!();

    let mut node = ShareNode::new(config)?;
    node.start(None).await?;
    info!("node '{}' announcing as {}", node_name, node.local_addr());

    loop {
        println!();
        println!("--- P2P Share Menu ---");
        println!("1. Show known peers");
        println!("2. Show shared files");
        println!("3. Request a file");
        println!("4. Exit");
        print!("Select option: ");
        io::stdout().flush()?;

        let mut choice = String::new();
        if io::stdin().read_line(&mut choice)? == 0 {
            break; // stdin closed
        }

        match choice.trim() {
            "1" => {
                let peers = node.known_peers();
                if peers.is_empty() {
                    println!("No peers discovered yet.");
                }
                for peer in peers {
                    println!(" - {}", peer);
                }
            }
            "2" => {
                let names = node.shared_files()?;
                if names.is_empty() {
                    println!("No files in the shared directory.");
                }
                for name in names {
                    println!(" - {}", name);
                }
            }
            "3" => {
                print!("Enter filename to request: ");
                io::stdout().flush()?;
                let mut name = String::new();
                io::stdin().read_line(&mut name)?;
                let name = name.trim();
                if name.is_empty() {
                    println!("No filename given.");
                    continue;
                }
                node.request_file(name, Arc::new(|status| println!("{}", status)));
            }
            "4" => break,
            other => println!("Invalid option: {}", other),
        }
    }

    node.shutdown().await;
    info!("node stopped");
    Ok(())
}

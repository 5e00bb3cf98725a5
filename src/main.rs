use clap::{Parser, Subcommand};
use vanopticon_bifrost::{config, run};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - software-defined perimeter controller")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Print the effective configuration and exit
	CheckConfig,
	/// Run the controller (default)
	Run,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run) {
		Commands::CheckConfig => match config::load() {
			Ok(settings) => println!(
				"control plane {}:{}  data plane {}:{}  ca={}",
				settings.host,
				settings.port,
				settings.host,
				settings.relay_port,
				settings.tls_ca.as_deref().unwrap_or("(none)")
			),
			Err(e) => eprintln!("Failed to load config: {}", e),
		},
		Commands::Run => {
			if let Err(e) = run().await {
				eprintln!("bifrost failed: {:#}", e);
				std::process::exit(1);
			}
		}
	}
}

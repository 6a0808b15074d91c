use anyhow::Result;
use clap::{Parser, Subcommand};
use kubectl_kcl::{commands, telemetry};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "kubectl-kcl")]
#[command(about = "Transform cluster resources with KCL functions", long_about = None)]
#[command(version)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Run a KCL function over the cluster's resources and apply the result
	Apply(commands::apply::ApplyArgs),
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	match cli.command {
		Commands::Apply(args) => {
			let _telemetry = telemetry::init(args.log_level, args.log_format)?;
			commands::apply::run(args)
		}
	}
}

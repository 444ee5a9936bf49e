use clap::{Parser, Subcommand};

/// KOI: model/instance backend with scoped access control
#[derive(Parser)]
#[command(name = "koi", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Port to bind (defaults to KOI_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Seed essential roles and users and exit
    Bootstrap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["koi", "serve", "--port", "9000"]);
        assert_eq!(cli.command, Some(Commands::Serve { port: Some(9000) }));

        let cli = Cli::parse_from(["koi", "bootstrap"]);
        assert_eq!(cli.command, Some(Commands::Bootstrap));

        let cli = Cli::parse_from(["koi"]);
        assert!(cli.command.is_none());
    }
}

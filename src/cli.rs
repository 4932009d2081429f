use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;

use crate::client;
use crate::core::config::{
    AllocatorConfig, EngineConfig, FleetTarget, MatchmakerConfig, ProvisionerConfig,
};
use crate::core::error::ConfigError;
use crate::engine::EngineServer;
use crate::game::SessionReport;
use crate::matchmaker::{
    HttpAllocator, LocalEngine, MatchmakerServer, SessionProvisioner, StaticLocation,
};

#[derive(Parser)]
#[command(name = "guessduel")]
#[command(about = "Two-player matchmaking and number-guessing duels")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host game sessions
    Engine {
        #[command(flatten)]
        engine: EngineArgs,

        /// Exit after the first game finishes
        #[arg(long, env = "SINGLE_SHOT")]
        single_shot: bool,
    },
    /// Pair players and send them to a game session
    Matchmaker(MatchmakerArgs),
    /// Run the matchmaker and a game engine in one process
    Serve {
        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        lobby: LobbyArgs,
    },
    /// Find an opponent and play from the terminal
    Play {
        /// Matchmaker URL
        #[arg(default_value = "ws://127.0.0.1:8080/match")]
        url: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Address the game engine listens on
    #[arg(long, env = "ENGINE_ADDR", default_value = "0.0.0.0:8081")]
    pub engine_addr: SocketAddr,

    /// Base URL players use to reach the engine (e.g. "ws://games.example.com:8081")
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Seconds a player has to guess
    #[arg(long, env = "TURN_TIMEOUT_SECS", default_value_t = 30)]
    pub turn_timeout: u64,

    /// Seconds a session waits for its second player
    #[arg(long, env = "JOIN_TIMEOUT_SECS", default_value_t = 10)]
    pub join_timeout: u64,
}

impl EngineArgs {
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            bind: self.engine_addr,
            public_url: self.public_url.clone(),
            turn_timeout: Duration::from_secs(self.turn_timeout),
            join_timeout: Duration::from_secs(self.join_timeout),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LobbyArgs {
    /// Address the matchmaker listens on
    #[arg(long, env = "MATCHMAKER_ADDR", default_value = "0.0.0.0:8080")]
    pub matchmaker_addr: SocketAddr,

    /// Seconds a lone player waits for an opponent
    #[arg(long, env = "MATCH_TIMEOUT_SECS", default_value_t = 180)]
    pub match_timeout: u64,
}

impl LobbyArgs {
    pub fn config(&self) -> MatchmakerConfig {
        MatchmakerConfig {
            bind: self.matchmaker_addr,
            match_timeout: Duration::from_secs(self.match_timeout),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    /// Send every match to the same engine
    Static,
    /// Create a session per match through an external allocator
    Allocator,
}

#[derive(Args, Debug, Clone)]
pub struct MatchmakerArgs {
    #[command(flatten)]
    pub lobby: LobbyArgs,

    #[arg(long, value_enum, default_value = "static")]
    pub provisioner: ProvisionerKind,

    /// Game URL handed out by the static provisioner
    #[arg(long, env = "GAME_SERVER_URL", default_value = "ws://localhost:8081/game")]
    pub location: String,

    #[arg(long, env = "FLEET_ID")]
    pub fleet_id: Option<String>,

    #[arg(long, env = "ALIAS_ID")]
    pub alias_id: Option<String>,

    /// Endpoint that creates game sessions
    #[arg(long, env = "ALLOCATOR_URL")]
    pub allocator_url: Option<String>,

    #[arg(long, env = "ALLOCATOR_LOCATION", default_value = "custom-location-1")]
    pub allocator_location: String,
}

impl MatchmakerArgs {
    pub fn provisioner_config(&self) -> Result<ProvisionerConfig, ConfigError> {
        match self.provisioner {
            ProvisionerKind::Static => Ok(ProvisionerConfig::Static {
                location: self.location.clone(),
            }),
            ProvisionerKind::Allocator => {
                let target = FleetTarget::from_ids(self.fleet_id.clone(), self.alias_id.clone())?;
                let endpoint = self
                    .allocator_url
                    .clone()
                    .filter(|url| !url.is_empty())
                    .ok_or(ConfigError::MissingAllocatorUrl)?;
                Ok(ProvisionerConfig::Allocator(AllocatorConfig {
                    endpoint,
                    target,
                    location: self.allocator_location.clone(),
                    max_players: 2,
                }))
            }
        }
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Engine { engine, single_shot } => run_engine(engine.config(), single_shot).await,
        Commands::Matchmaker(args) => {
            let provisioner = match args.provisioner_config()? {
                ProvisionerConfig::Static { location } => {
                    Arc::new(StaticLocation::new(location)) as Arc<dyn SessionProvisioner>
                }
                ProvisionerConfig::Allocator(config) => Arc::new(HttpAllocator::new(config)),
            };
            run_matchmaker(args.lobby.config(), provisioner).await
        }
        Commands::Serve { engine, lobby } => serve(engine.config(), lobby.config()).await,
        Commands::Play { url } => client::run(&url).await,
    }
}

async fn first_report(reports: &mut broadcast::Receiver<SessionReport>) -> Option<SessionReport> {
    loop {
        match reports.recv().await {
            Ok(report) => return Some(report),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn run_engine(config: EngineConfig, single_shot: bool) -> Result<()> {
    let server = EngineServer::bind(config)
        .await
        .context("Failed to start game engine")?;
    let mut reports = server.registry().subscribe_reports();

    tokio::select! {
        result = server.run() => result.context("Game engine stopped")?,
        Some(report) = first_report(&mut reports), if single_shot => {
            info!(session = %report.id, winner = report.winner, reason = ?report.reason, "Game finished, shutting down");
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn run_matchmaker(config: MatchmakerConfig, provisioner: Arc<dyn SessionProvisioner>) -> Result<()> {
    let server = MatchmakerServer::bind(config, provisioner)
        .await
        .context("Failed to start matchmaker")?;

    tokio::select! {
        result = server.run() => result.context("Matchmaker stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn serve(engine: EngineConfig, lobby: MatchmakerConfig) -> Result<()> {
    let engine = EngineServer::bind(engine)
        .await
        .context("Failed to start game engine")?;
    let provisioner = Arc::new(LocalEngine::new(engine.registry()));
    let matchmaker = MatchmakerServer::bind(lobby, provisioner)
        .await
        .context("Failed to start matchmaker")?;

    tokio::select! {
        result = engine.run() => result.context("Game engine stopped")?,
        result = matchmaker.run() => result.context("Matchmaker stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn engine_defaults() {
        let Commands::Engine { engine, single_shot } = parse(&["guessduel", "engine"]) else {
            panic!("expected engine");
        };
        assert!(!single_shot);
        let config = engine.config();
        assert_eq!(config.turn_timeout, Duration::from_secs(30));
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.bind.port(), 8081);
    }

    #[test]
    fn allocator_needs_exactly_one_target() {
        let Commands::Matchmaker(args) = parse(&[
            "guessduel",
            "matchmaker",
            "--provisioner",
            "allocator",
            "--allocator-url",
            "http://allocator.local/sessions",
            "--fleet-id",
            "fleet-1",
        ]) else {
            panic!("expected matchmaker");
        };
        let ProvisionerConfig::Allocator(config) = args.provisioner_config().unwrap() else {
            panic!("expected allocator config");
        };
        assert_eq!(config.target, FleetTarget::Fleet("fleet-1".into()));
        assert_eq!(config.location, "custom-location-1");
        assert_eq!(config.max_players, 2);

        let mut both = args.clone();
        both.alias_id = Some("alias-1".into());
        assert_eq!(both.provisioner_config(), Err(ConfigError::FleetTarget));

        let mut no_url = args;
        no_url.allocator_url = None;
        assert_eq!(no_url.provisioner_config(), Err(ConfigError::MissingAllocatorUrl));
    }
}

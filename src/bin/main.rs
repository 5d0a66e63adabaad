use std::error::Error;
use std::io;
use std::sync::Arc;

use clap::Parser;
use oauth2_session::authenticator::OAuth2Authenticator;
use oauth2_session::commands::get::GetCommand;
use oauth2_session::commands::login::LoginCommand;
use oauth2_session::commands::logout::LogoutCommand;
use oauth2_session::commands::status::StatusCommand;
use oauth2_session::endpoint::ServiceEndpoint;
use oauth2_session::event::{AuthEvent, EventDispatcher};
use oauth2_session::http::client::HttpClient;
use oauth2_session::http_session::HttpSession;
use oauth2_session::parameters::{Commands, EndpointArgs, OutputFormat};
use oauth2_session::session::storage::file::FileSessionStorage;
use oauth2_session::trace::Trace;
use tracing::Level;

type CliAuthenticator = OAuth2Authenticator<Arc<HttpClient>, FileSessionStorage>;

#[derive(Parser, Debug)]
#[command(name = "oauth2-session-cli")]
struct Cli {
    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Login { endpoint, force } => {
            let (_, _, authenticators) = setup(&endpoint)?;
            let trace = Trace::new().with_origin("cli-login");
            for session in LoginCommand::new(&authenticators).login(force, &trace)? {
                println!("{}: valid until {}", session.config_hash(), session.valid_until());
            }
            Ok(())
        }
        Commands::Status {
            endpoint,
            output_format,
        } => {
            let (_, _, authenticators) = setup(&endpoint)?;
            let report = StatusCommand::new(&authenticators).report()?;
            match output_format {
                OutputFormat::Plain => {
                    for entry in report {
                        let valid_until = entry
                            .valid_until
                            .map(|t| format!(" (valid until {t})"))
                            .unwrap_or_default();
                        println!(
                            "{} {} {}{}",
                            entry.session_id, entry.resource_url, entry.state, valid_until
                        );
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(())
        }
        Commands::Logout { endpoint } => {
            let (_, _, authenticators) = setup(&endpoint)?;
            for session_id in LogoutCommand::new(&authenticators).logout()? {
                println!("{session_id}: revoked");
            }
            Ok(())
        }
        Commands::Get { endpoint, path } => {
            let (service, http_client, authenticators) = setup(&endpoint)?;
            let session = HttpSession::new(http_client, authenticators);
            let response = GetCommand::new(service.url, session)
                .get(&path, &Trace::new().with_origin("cli-get"))?;
            println!("{}", String::from_utf8_lossy(response.body()));
            Ok(())
        }
    }
}

fn setup(
    args: &EndpointArgs,
) -> Result<(ServiceEndpoint, Arc<HttpClient>, Vec<CliAuthenticator>), Box<dyn Error>> {
    let service = args.endpoint()?;
    let http_client = Arc::new(
        HttpClient::new(args.http_config()?)
            .map_err(|e| format!("error creating http client: {e}"))?,
    );
    let session_manager = Arc::new(args.session_manager()?);

    let events = EventDispatcher::new();
    events.subscribe(|event: &AuthEvent| {
        if let AuthEvent::BlockingResponseRequired { url, .. } = event {
            eprintln!("To continue, open {url} and approve this device.");
        }
    });

    let authenticators = service
        .authenticators(Arc::clone(&http_client), session_manager, &events)
        .into_iter()
        .map(|authenticator| authenticator.with_adapter_factory(args.adapter_factory()))
        .collect();
    Ok((service, http_client, authenticators))
}

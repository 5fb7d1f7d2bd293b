use rocket_oidc_rp::{OIDCConfig, OIDCError};
use rpassword::read_password;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

fn get_password(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    // no echo
    read_password()
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(about = "Serves the OpenID Connect login routes for one provider")]
pub struct Args {
    /// JSON file holding the provider and client settings; environment variables are used otherwise.
    /// The client secret may be left out of either when `--prompt-secret` is given
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Read the client secret from the terminal instead of the configuration
    #[structopt(long)]
    prompt_secret: bool,
}

fn load_config(args: &Args) -> Result<OIDCConfig, OIDCError> {
    let mut config: OIDCConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                OIDCError::Configuration(format!("unable to read {}: {}", path.display(), err))
            })?;
            serde_json::from_str(&raw).map_err(|err| {
                OIDCError::Configuration(format!("invalid config {}: {}", path.display(), err))
            })?
        }
        None => OIDCConfig::from_env()?,
    };

    if args.prompt_secret {
        config.client_secret = get_password("client secret: ")
            .map_err(|err| OIDCError::Configuration(format!("unable to read secret: {}", err)))?;
    }
    Ok(config)
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::from_args();
    let config = load_config(&args)?;
    // Rocket's own request lines include the callback query (code and state).
    let figment = rocket::Config::figment().merge(("log_level", "critical"));
    let rocket = rocket_oidc_rp::setup(rocket::custom(figment), config)?;
    let _ = rocket.launch().await?;
    Ok(())
}

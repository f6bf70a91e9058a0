use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fleet-server-rs",
    version,
    about = "Real-time telemetry service for VRLA battery fleets"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}

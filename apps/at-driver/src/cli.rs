use clap::Parser;

use at_driver_proto::DEFAULT_PORT;

#[derive(Debug, Parser)]
#[command(
    name = "at-driver",
    author,
    version,
    about = "Bridge between WebSocket test harnesses and a screen reader's voice output"
)]
pub struct Cli {
    /// TCP port for the WebSocket command server.
    #[arg(long, env = "AT_DRIVER_PORT", default_value_t = DEFAULT_PORT, value_parser = parse_port)]
    pub port: u16,

    /// Address the command server binds to.
    #[arg(long, env = "AT_DRIVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Socket path (macOS) or pipe name (Windows) for voice events.
    #[arg(long, env = "AT_DRIVER_VOICE_ENDPOINT")]
    pub voice_endpoint: Option<String>,

    /// Seconds a voice connection may stay silent before its packet is cut off.
    #[arg(long, env = "AT_DRIVER_VOICE_READ_TIMEOUT_SECS", default_value_t = 30)]
    pub voice_read_timeout_secs: u64,
}

/// Accept only plain decimal port numbers: no sign, radix prefix, fraction
/// or leading zeros.
pub fn parse_port(value: &str) -> Result<u16, String> {
    let plain = !value.is_empty()
        && value.bytes().all(|b| b.is_ascii_digit())
        && (value == "0" || !value.starts_with('0'));
    if !plain {
        return Err(format!("\"{value}\" is not a valid port number"));
    }
    value
        .parse()
        .map_err(|_| format!("port {value} is out of range"))
}

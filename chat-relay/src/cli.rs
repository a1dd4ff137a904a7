use std::net::SocketAddr;

use clap::Parser;

use crate::{protocol::DEFAULT_MAX_LINE_LENGTH, router::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:55555")]
    pub listen: SocketAddr,

    /// Longest line, in bytes, accepted from a client.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH, value_parser = parse_line_length)]
    pub max_line_length: usize,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_line_length: self.max_line_length,
        }
    }
}

fn parse_line_length(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(length) => Ok(length),
        Err(err) => Err(err.to_string()),
    }
}

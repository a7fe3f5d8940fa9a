//! relay-client: send requests to a relay server over one connection.
//!
//! Requests come from the command line, or from stdin one per line when none
//! are given. With `--token`, each request is prefixed with `TOKEN:<token> `.

use clap::Parser;
use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(about = "Send requests to a relay server", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Token to prefix each request with
    #[arg(short, long)]
    token: Option<String>,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Requests to send, e.g. "ECHO hello"
    requests: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(args.timeout)))?;

    let requests: Vec<String> = if args.requests.is_empty() {
        io::stdin().lock().lines().collect::<Result<_, _>>()?
    } else {
        args.requests.clone()
    };

    let mut buf = vec![0u8; 64 * 1024];
    for request in requests.iter().filter(|r| !r.trim().is_empty()) {
        let line = match &args.token {
            Some(token) => format!("TOKEN:{token} {request}\r\n"),
            None => format!("{request}\r\n"),
        };
        stream.write_all(line.as_bytes())?;

        let n = stream.read(&mut buf)?;
        if n == 0 {
            eprintln!("connection closed by server");
            break;
        }
        println!("{}", String::from_utf8_lossy(&buf[..n]).trim_end());
    }

    Ok(())
}

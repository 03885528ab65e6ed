//! # kvlink CLI
//!
//! Sends one raw command to a server and prints the decoded reply.
//!
//! ```text
//! kvlink [--config FILE] [--host HOST] [--port PORT] VERB [ARGS...]
//! ```

use std::env;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use kvlink_client::{ClientConfig, Command, Connection, RespValue};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let mut config = ClientConfig::default();
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a file")?;
                config = ClientConfig::from_file(&path)
                    .with_context(|| format!("loading {path}"))?;
            }
            "--host" => config.host = args.next().context("--host needs a value")?,
            "--port" => {
                config.port = args
                    .next()
                    .context("--port needs a value")?
                    .parse()
                    .context("invalid port")?;
            }
            _ => {
                words.push(arg);
                words.extend(args.by_ref());
            }
        }
    }

    let Some((verb, rest)) = words.split_first() else {
        bail!("usage: kvlink [--config FILE] [--host HOST] [--port PORT] VERB [ARGS...]");
    };

    let mut conn = Connection::connect(&config)
        .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
    let reply = conn.execute(&Command::new(verb).args(rest));
    match reply {
        Ok(value) => print_value(&value, 0),
        Err(err) => println!("({}) {}", err.code(), conn.message()),
    }
    Ok(())
}

fn print_value(value: &RespValue, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        RespValue::Simple(text) => println!("{indent}{text}"),
        RespValue::Error(text) => println!("{indent}(error) {text}"),
        RespValue::Integer(number) => println!("{indent}(integer) {number}"),
        RespValue::Bulk(data) => println!("{indent}\"{}\"", String::from_utf8_lossy(data)),
        RespValue::Null => println!("{indent}(nil)"),
        RespValue::Array(items) if items.is_empty() => println!("{indent}(empty array)"),
        RespValue::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                println!("{indent}{})", idx + 1);
                print_value(item, depth + 1);
            }
        }
    }
}

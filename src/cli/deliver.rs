use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Args;

use super::{CliContext, print_json};
use trigger_plugin::message::Delivery;

#[derive(Args, Debug)]
pub struct DeliverArgs {
    pub subscription_id: String,

    #[arg(long, default_value = "POST")]
    pub method: String,

    /// Raw body file; `-` reads stdin. Omit for an empty body.
    #[arg(long)]
    pub body: Option<PathBuf>,

    /// Request header as `Name: value`; repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Query parameter as `name=value`; repeatable
    #[arg(short = 'q', long = "query")]
    pub query: Vec<String>,
}

pub async fn execute(args: DeliverArgs, context: &CliContext) -> anyhow::Result<()> {
    let body = match &args.body {
        None => Vec::new(),
        Some(path) if path.as_os_str() == "-" => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("reading body from stdin")?;
            buf
        }
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
    };
    let headers = parse_pairs(&args.headers, ':')?;
    let query = parse_pairs(&args.query, '=')?;
    let delivery = Delivery::from_parts(&args.method, headers, query, body);

    let engine = context.engine().await?;
    match engine.handle_delivery(&args.subscription_id, delivery).await {
        Ok(response) => print_json(&response),
        Err(e) => bail!(e.user_message()),
    }
}

fn parse_pairs(raw: &[String], separator: char) -> anyhow::Result<HashMap<String, String>> {
    raw.iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once(separator)
                .with_context(|| format!("`{pair}` is not in name{separator}value form"))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_query_pairs() {
        let headers = parse_pairs(&["X-Goog-Channel-ID: c1".to_string()], ':').unwrap();
        assert_eq!(headers["X-Goog-Channel-ID"], "c1");
        let query = parse_pairs(&["hub.mode=subscribe".to_string()], '=').unwrap();
        assert_eq!(query["hub.mode"], "subscribe");
        assert!(parse_pairs(&["broken".to_string()], '=').is_err());
    }
}

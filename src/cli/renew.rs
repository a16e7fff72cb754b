use anyhow::bail;
use clap::Args;
use tracing::error;

use super::CliContext;
use changefeed::lifecycle::RenewalOutcome;

#[derive(Args, Debug)]
pub struct RenewArgs {
    /// Renew only this subscription; otherwise sweep every live one
    pub subscription_id: Option<String>,
}

pub async fn execute(args: RenewArgs, context: &CliContext) -> anyhow::Result<()> {
    let engine = context.engine().await?;
    let results = match args.subscription_id {
        Some(id) => {
            let outcome = engine.renew(&id).await;
            vec![(id, outcome)]
        }
        None => engine.renew_due().await?,
    };

    let mut failed = 0;
    for (id, outcome) in results {
        match outcome {
            Ok(RenewalOutcome::Renewed(sub)) => {
                let until = sub.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "no expiry".into());
                println!("✅ {id} renewed until {until}");
            }
            Ok(RenewalOutcome::NotDue { expires_at }) => {
                let until = expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "no expiry".into());
                println!("{id} not due (expires {until})");
            }
            Ok(RenewalOutcome::InProgress) => println!("{id} is being renewed by another worker"),
            Err(e) => {
                failed += 1;
                error!(subscription_id = %id, "renewal failed: {e}");
                eprintln!("❌ {id}: {}", e.user_message());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} renewal(s) failed");
    }
    Ok(())
}

use clap::Args;

use super::{CliContext, print_json};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// One subscription with its checkpoint; omit to list all
    pub subscription_id: Option<String>,
}

pub async fn execute(args: StatusArgs, context: &CliContext) -> anyhow::Result<()> {
    let engine = context.engine().await?;
    match args.subscription_id {
        Some(id) => {
            let report = engine.status(&id).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
            print_json(&report)
        }
        None => {
            for sub in engine.list().await? {
                let expires = sub.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
                println!(
                    "{}  {:<8} {:<9} {}  expires {}",
                    sub.subscription_id,
                    sub.provider_id,
                    sub.status.as_str(),
                    sub.resource_scope.key(),
                    expires
                );
            }
            Ok(())
        }
    }
}

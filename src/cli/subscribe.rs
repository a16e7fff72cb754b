use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::Args;
use tracing::info;
use trigger_plugin::oauth::TokenGrant;

use super::{CliContext, print_json};
use changefeed::subscription_config::SubscriptionConfig;

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// YAML subscription config
    #[arg(long)]
    pub config: PathBuf,

    /// Access token obtained by the host's authorization flow
    #[arg(long)]
    pub access_token: Option<String>,

    #[arg(long)]
    pub refresh_token: Option<String>,

    /// Seconds until the access token expires
    #[arg(long)]
    pub expires_in: Option<i64>,
}

#[derive(Args, Debug)]
pub struct UnsubscribeArgs {
    pub subscription_id: String,
}

pub async fn execute(args: SubscribeArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = SubscriptionConfig::load(&args.config)?;
    let tokens = args.access_token.map(|access_token| TokenGrant {
        access_token,
        refresh_token: args.refresh_token,
        expires_at: args.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
    });
    let engine = context.engine().await?;
    let subscription = engine.provision(&config, tokens).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
    info!(subscription_id = %subscription.subscription_id, "subscribed");
    print_json(&subscription)
}

pub async fn unsubscribe(args: UnsubscribeArgs, context: &CliContext) -> anyhow::Result<()> {
    let engine = context.engine().await?;
    let revoked = engine
        .unsubscribe(&args.subscription_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    println!("✅ Subscription {} revoked.", revoked.subscription_id);
    Ok(())
}

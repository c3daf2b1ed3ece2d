//! supportkit-tail: follow a visitor's realtime channel from the terminal.
//!
//! Resolves (or reuses) the visitor for `SUPPORTKIT_WEBSITE_ID`, connects
//! the realtime channel and logs every event until Ctrl-C.
//!
//! Environment variables:
//! - `SUPPORTKIT_WEBSITE_ID` (required)
//! - `SUPPORTKIT_VISITOR_ID`: skip visitor resolution and use this id
//! - `SUPPORTKIT_API_URL`, `SUPPORTKIT_WS_URL`, `SUPPORTKIT_PUBLIC_KEY`

use std::rc::Rc;

use anyhow::Context;
use supportkit_client::logging::init_tracing;
use supportkit_client::ws::TungsteniteTransport;
use supportkit_client::{
    ApiClient, ClientConfig, ConnectionAuth, ConnectionManager, FileStorage, Scheduler,
    SupportClient, TokioScheduler,
};
use supportkit_shared::Visitor;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("supportkit=info,supportkit_tail=info");

    let local = tokio::task::LocalSet::new();
    local.run_until(run()).await
}

async fn run() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    let website_id =
        std::env::var("SUPPORTKIT_WEBSITE_ID").context("SUPPORTKIT_WEBSITE_ID is not set")?;

    let scheduler: Rc<dyn Scheduler> = Rc::new(TokioScheduler::new());
    let api = ApiClient::new()
        .with_base_url(config.api_url.clone())
        .with_public_key(config.public_key.clone());
    let storage = FileStorage::in_config_dir().context("no config directory for the visitor cache")?;
    let client = SupportClient::new(&config, Rc::new(api), scheduler.clone(), Rc::new(storage));

    let visitor_id = match std::env::var("SUPPORTKIT_VISITOR_ID") {
        Ok(id) if !id.trim().is_empty() => {
            client.set_visitor(&Visitor {
                id: id.trim().to_string(),
                website_id: website_id.clone(),
                organization_id: String::new(),
                contact_id: None,
                created_at: scheduler.now(),
            });
            id.trim().to_string()
        }
        _ => {
            client
                .resolve_visitor(&website_id)
                .await
                .context("resolving visitor")?
                .id
        }
    };

    let manager = ConnectionManager::new(
        config.ws_url.clone(),
        config.connection.clone(),
        Rc::new(TungsteniteTransport::new()),
        scheduler.clone(),
    );
    manager.on_connect(|| tracing::info!("connected"));
    manager.on_disconnect(|| tracing::info!("disconnected"));
    manager.on_error(|err| tracing::warn!("channel error: {err}"));
    let _events = manager.subscribe(|event| {
        let json = serde_json::to_string(event)?;
        println!("{json}");
        Ok(())
    });
    client.attach_realtime(&manager);

    let mut auth = ConnectionAuth::visitor(visitor_id).website_id(website_id);
    if let Some(key) = &config.public_key {
        auth = auth.public_key(key.clone());
    }
    manager.connect(auth);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    client.destroy();
    manager.destroy();
    Ok(())
}
